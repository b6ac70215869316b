// Lifecycle supervisor: builds every component in dependency order, recovers
// state interrupted by the previous shutdown, re-registers cron targets and
// exposes the handles the API layer works with.

use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::errors::StoreError;
use crate::executor::{ClusterClient, Engine, RemoteShellClient, Ssh2ShellClient};
use crate::gateway::WebhookGateway;
use crate::loghub::{self, LogHub};
use crate::notifier::{HttpPoster, Notifier, ReqwestPoster};
use crate::runs::RunFactory;
use crate::scheduler::{CancelRegistry, CronEngine, TargetId, TargetQueues};
use crate::store::Store;
use crate::vault::{AesGcmSealer, SecretSealer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Controller {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub loghub: Arc<LogHub>,
    pub sealer: Arc<dyn SecretSealer>,
    pub artifacts: Arc<ArtifactStore>,
    pub notifier: Arc<Notifier>,
    pub factory: Arc<RunFactory>,
    pub cancels: Arc<CancelRegistry>,
    pub gateway: Arc<WebhookGateway>,
    pub cron: Arc<CronEngine>,
    pub queues: Arc<TargetQueues>,
    pub engine: Arc<Engine>,
}

/// Boot with production collaborators: ssh2 shell, reqwest poster
pub async fn boot(
    settings: Settings,
    cluster: Option<Arc<dyn ClusterClient>>,
) -> Result<Controller> {
    let poster: Arc<dyn HttpPoster> =
        Arc::new(ReqwestPoster::new().context("build HTTP poster")?);
    boot_with(settings, cluster, Arc::new(Ssh2ShellClient), poster).await
}

/// Boot with injected collaborators; tests hand in fakes here
pub async fn boot_with(
    settings: Settings,
    cluster: Option<Arc<dyn ClusterClient>>,
    shell: Arc<dyn RemoteShellClient>,
    poster: Arc<dyn HttpPoster>,
) -> Result<Controller> {
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let storage = &settings.storage;
    std::fs::create_dir_all(&storage.base_dir).context("create base dir")?;
    std::fs::create_dir_all(storage.logs_dir()).context("create logs dir")?;
    std::fs::create_dir_all(storage.workspaces_dir()).context("create workspaces dir")?;

    let sealer: Arc<dyn SecretSealer> = Arc::new(
        AesGcmSealer::load_or_create(&storage.seal_key_path()).context("load sealing key")?,
    );
    let store = Arc::new(Store::open(&storage.base_dir).context("open store")?);
    recover_interrupted(&store);

    let loghub = Arc::new(LogHub::new(storage.logs_dir(), storage.log_ring_bytes));
    let artifacts = Arc::new(
        ArtifactStore::new(storage.artifacts_dir(), Arc::clone(&store))
            .context("open artifact store")?,
    );
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&store),
        poster,
        settings.notifier.clone(),
    ));
    let cancels = Arc::new(CancelRegistry::new());

    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        Arc::clone(&loghub),
        Arc::clone(&notifier),
        Arc::clone(&sealer),
        Arc::clone(&artifacts),
        shell,
        cluster,
        Arc::clone(&cancels),
        settings.executor.clone(),
        storage.workspaces_dir(),
    ));
    let queues = Arc::new(TargetQueues::new(
        settings.scheduler.queue_depth,
        Arc::clone(&engine) as Arc<dyn crate::scheduler::Dispatcher>,
    ));
    let factory = Arc::new(RunFactory::new(
        Arc::clone(&store),
        Arc::clone(&queues),
        Arc::clone(&cancels),
        engine.cluster_available(),
    ));
    let gateway = Arc::new(WebhookGateway::new(
        Arc::clone(&store),
        Arc::clone(&factory),
    ));

    let cron = Arc::new(CronEngine::new(
        settings.scheduler.clone(),
        Arc::clone(&factory),
    ));
    reregister_cron(&store, &cron);
    tokio::spawn(Arc::clone(&cron).run());

    info!("Controller booted");
    Ok(Controller {
        settings,
        store,
        loghub,
        sealer,
        artifacts,
        notifier,
        factory,
        cancels,
        gateway,
        cron,
        queues,
        engine,
    })
}

/// Any run/build left non-terminal by a previous process is forced to
/// `failed` with reason "interrupted" before new work is accepted
fn recover_interrupted(store: &Store) {
    let mut recovered = 0usize;
    for run in store.runs().list() {
        if !run.status.is_terminal() {
            let result = store.runs().update_with(run.id, |r| {
                r.status = crate::models::RunStatus::Failed;
                r.reason = Some("interrupted".to_string());
                for job in &mut r.jobs {
                    if !job.status.is_terminal() {
                        job.status = crate::models::RunStatus::Failed;
                        job.reason = Some("interrupted".to_string());
                    }
                }
                let now = chrono::Utc::now();
                r.finished_at = Some(now);
                r.duration_ms = r.started_at.map(|s| (now - s).num_milliseconds());
            });
            if let Err(e) = result {
                warn!(run_id = %run.id, error = %e, "Failed to mark interrupted run");
            } else {
                recovered += 1;
            }
        }
    }
    for build in store.builds().list() {
        if !build.status.is_terminal() {
            let result = store.builds().update_with(build.id, |b| {
                b.status = crate::models::RunStatus::Failed;
                b.reason = Some("interrupted".to_string());
                for step in &mut b.steps {
                    if !step.status.is_terminal() {
                        step.status = crate::models::RunStatus::Failed;
                        step.reason = Some("interrupted".to_string());
                    }
                }
                let now = chrono::Utc::now();
                b.finished_at = Some(now);
                b.duration_ms = b.started_at.map(|s| (now - s).num_milliseconds());
            });
            if let Err(e) = result {
                warn!(build_id = %build.id, error = %e, "Failed to mark interrupted build");
            } else {
                recovered += 1;
            }
        }
    }
    if recovered > 0 {
        info!(count = recovered, "Marked interrupted runs/builds as failed");
    }
}

fn reregister_cron(store: &Store, cron: &CronEngine) {
    for pipeline in store.pipelines().list() {
        if let Err(e) = cron.register_pipeline(&pipeline) {
            warn!(pipeline = %pipeline.name, error = %e, "Cron re-registration failed");
        }
    }
    for job in store.jobs().list() {
        if let Err(e) = cron.register_job(&job) {
            warn!(job = %job.name, error = %e, "Cron re-registration failed");
        }
    }
}

impl Controller {
    /// Idempotent cancellation by run/build id
    pub fn cancel(&self, id: Uuid) -> bool {
        self.cancels.cancel(id)
    }

    pub fn shutdown(&self) {
        self.cron.shutdown();
        info!("Controller shutdown requested");
    }

    /// Delete a terminal run together with its artifacts and logs
    pub fn delete_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let run = self.store.runs().get(run_id)?;
        if !run.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run {} is still {}",
                run_id,
                run.status.as_str()
            )));
        }
        self.artifacts.cleanup_run(run_id)?;
        for job in &run.jobs {
            self.loghub
                .remove_persisted(&loghub::run_job_key(run_id, &job.name));
        }
        self.store.runs().delete(run_id)?;
        Ok(())
    }

    /// Delete a terminal build together with its log
    pub fn delete_build(&self, build_id: Uuid) -> Result<(), StoreError> {
        let build = self.store.builds().get(build_id)?;
        if !build.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "build {} is still {}",
                build_id,
                build.status.as_str()
            )));
        }
        self.loghub.remove_persisted(&loghub::build_key(build_id));
        self.store.builds().delete(build_id)?;
        Ok(())
    }

    /// Delete a pipeline, cascading runs and artifacts
    pub fn delete_pipeline(&self, pipeline_id: Uuid) -> Result<(), StoreError> {
        let pipeline = self.store.pipelines().get(pipeline_id)?;
        for run in self.store.runs_for_pipeline(pipeline_id) {
            if !run.status.is_terminal() {
                self.cancels.cancel(run.id);
            }
            if let Err(e) = self.artifacts.cleanup_run(run.id) {
                warn!(run_id = %run.id, error = %e, "Cascade artifact cleanup failed");
            }
            for job in &run.jobs {
                self.loghub
                    .remove_persisted(&loghub::run_job_key(run.id, &job.name));
            }
            if let Err(e) = self.store.runs().delete(run.id) {
                warn!(run_id = %run.id, error = %e, "Cascade run delete failed");
            }
        }
        self.cron.unregister(TargetId::Pipeline(pipeline_id));
        self.queues.remove_target(TargetId::Pipeline(pipeline_id));
        self.store.pipelines().delete(pipeline_id)?;
        info!(pipeline = %pipeline.name, "Pipeline deleted");
        Ok(())
    }

    /// Delete a freestyle job, cascading builds and logs
    pub fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let job = self.store.jobs().get(job_id)?;
        for build in self.store.builds_for_job(job_id) {
            if !build.status.is_terminal() {
                self.cancels.cancel(build.id);
            }
            self.loghub.remove_persisted(&loghub::build_key(build.id));
            if let Err(e) = self.store.builds().delete(build.id) {
                warn!(build_id = %build.id, error = %e, "Cascade build delete failed");
            }
        }
        self.cron.unregister(TargetId::Job(job_id));
        self.queues.remove_target(TargetId::Job(job_id));
        self.store.jobs().delete(job_id)?;
        info!(job = %job.name, "Job deleted");
        Ok(())
    }
}
