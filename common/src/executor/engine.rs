// Execution engine: owns everything a run/build needs and dispatches work
// items arriving from the per-target queues. One dispatch call runs at a time
// per target; the queues guarantee it.

use crate::artifacts::ArtifactStore;
use crate::config::ExecutorConfig;
use crate::executor::cluster::{self, ClusterClient};
use crate::executor::freestyle;
use crate::executor::ssh::RemoteShellClient;
use crate::loghub::LogHub;
use crate::notifier::Notifier;
use crate::scheduler::{CancelRegistry, Dispatcher, TargetId, Work};
use crate::store::Store;
use crate::vault::SecretSealer;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Engine {
    pub(crate) store: Arc<Store>,
    pub(crate) loghub: Arc<LogHub>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) sealer: Arc<dyn SecretSealer>,
    pub(crate) artifacts: Arc<ArtifactStore>,
    pub(crate) shell: Arc<dyn RemoteShellClient>,
    pub(crate) cluster: Option<Arc<dyn ClusterClient>>,
    pub(crate) cancels: Arc<CancelRegistry>,
    pub(crate) config: ExecutorConfig,
    pub(crate) workspaces_dir: PathBuf,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        loghub: Arc<LogHub>,
        notifier: Arc<Notifier>,
        sealer: Arc<dyn SecretSealer>,
        artifacts: Arc<ArtifactStore>,
        shell: Arc<dyn RemoteShellClient>,
        cluster: Option<Arc<dyn ClusterClient>>,
        cancels: Arc<CancelRegistry>,
        config: ExecutorConfig,
        workspaces_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            loghub,
            notifier,
            sealer,
            artifacts,
            shell,
            cluster,
            cancels,
            config,
            workspaces_dir,
        }
    }

    pub fn cluster_available(&self) -> bool {
        self.cluster.is_some()
    }

    /// Shared remote shell client, also used by the host test endpoint
    pub fn shell(&self) -> Arc<dyn RemoteShellClient> {
        Arc::clone(&self.shell)
    }
}

#[async_trait]
impl Dispatcher for Engine {
    async fn dispatch(&self, work: Work) {
        match work.target {
            TargetId::Pipeline(_) => cluster::run_pipeline(self, work.id, work.cancel).await,
            TargetId::Job(_) => freestyle::run_build(self, work.id, work.cancel).await,
        }
        self.cancels.deregister(work.id);
    }
}
