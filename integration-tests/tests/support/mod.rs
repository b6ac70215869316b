// Shared harness for the end-to-end scenarios: an in-process controller with
// recording/scripted collaborators and a temp storage root.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use common::config::Settings;
use common::errors::{ExecutionError, NotifyError};
use common::executor::{
    ClusterClient, RemoteShellClient, SshTarget, UploadSource, WorkloadHandle, WorkloadPhase,
    WorkloadSpec,
};
use common::models::{
    BuildStep, FreestyleJob, JobStatus, JobTriggers, RunStatus, StepAction,
};
use common::notifier::HttpPoster;
use common::scheduler::CancelToken;
use common::supervisor::{self, Controller};
use common::webhook;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One outbound notification captured by the recording poster
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl RecordedDelivery {
    pub fn event(&self) -> String {
        self.body["event"].as_str().unwrap_or_default().to_string()
    }
}

/// HttpPoster that records every delivery and always reports 200
#[derive(Default)]
pub struct RecordingPoster {
    pub deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl RecordingPoster {
    pub fn events(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.event())
            .collect()
    }
}

#[async_trait]
impl HttpPoster for RecordingPoster {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        _timeout: Duration,
    ) -> Result<u16, NotifyError> {
        self.deliveries.lock().unwrap().push(RecordedDelivery {
            url: url.to_string(),
            headers: headers.clone(),
            body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
        });
        Ok(200)
    }
}

/// Shell client for scenarios that never reach a remote host
pub struct UnreachableShell;

#[async_trait]
impl RemoteShellClient for UnreachableShell {
    async fn run(
        &self,
        _target: &SshTarget,
        _command: &str,
        _env: &HashMap<String, String>,
        _output: tokio::sync::mpsc::Sender<Vec<u8>>,
        _cancel: CancelToken,
    ) -> Result<i32, ExecutionError> {
        Err(ExecutionError::SshConnectionFailed(
            "no remote hosts in this scenario".to_string(),
        ))
    }

    async fn upload(
        &self,
        _target: &SshTarget,
        _source: UploadSource,
        _remote_path: &str,
        _mode: i32,
    ) -> Result<u64, ExecutionError> {
        Err(ExecutionError::TransferFailed("unreachable".to_string()))
    }

    async fn download(
        &self,
        _target: &SshTarget,
        _remote_path: &str,
        _local_path: &Path,
    ) -> Result<u64, ExecutionError> {
        Err(ExecutionError::TransferFailed("unreachable".to_string()))
    }
}

/// Scripted behavior for one workload submitted by the cluster executor
#[derive(Debug, Clone, Default)]
pub struct ScriptedWorkload {
    pub logs: Vec<u8>,
    pub fail: bool,
    /// Artifact files the workload leaves behind, by directory
    pub artifacts: Vec<(String, Vec<u8>)>,
    /// Hold in Running this long before the terminal phase
    pub running_for: Duration,
}

/// ClusterClient fake: scripts are keyed by job name (workload names are
/// `<pipeline>-<number>-<job>`)
#[derive(Default)]
pub struct FakeCluster {
    scripts: Mutex<HashMap<String, ScriptedWorkload>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn script(&self, job_name: &str, workload: ScriptedWorkload) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_name.to_string(), workload);
    }

    fn lookup(&self, handle: &WorkloadHandle) -> ScriptedWorkload {
        let scripts = self.scripts.lock().unwrap();
        scripts
            .iter()
            .find(|(job, _)| handle.0.ends_with(&format!("-{}", sanitize(job))))
            .map(|(_, w)| w.clone())
            .unwrap_or_default()
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ExecutionError> {
        Ok(WorkloadHandle(spec.name.clone()))
    }

    async fn watch(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<futures::stream::BoxStream<'static, WorkloadPhase>, ExecutionError> {
        let script = self.lookup(handle);
        let terminal = if script.fail {
            WorkloadPhase::Failed
        } else {
            WorkloadPhase::Succeeded
        };
        let hold = script.running_for;
        let stream = futures::stream::unfold(0u8, move |step| async move {
            match step {
                0 => Some((WorkloadPhase::Pending, 1)),
                1 => Some((WorkloadPhase::Running, 2)),
                2 => {
                    tokio::time::sleep(hold).await;
                    Some((terminal, 3))
                }
                _ => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn stream_logs(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<futures::stream::BoxStream<'static, Vec<u8>>, ExecutionError> {
        let script = self.lookup(handle);
        Ok(Box::pin(futures::stream::iter(vec![script.logs])))
    }

    async fn delete(&self, handle: &WorkloadHandle) -> Result<(), ExecutionError> {
        self.deleted.lock().unwrap().push(handle.0.clone());
        Ok(())
    }

    async fn read_artifact_dir(
        &self,
        handle: &WorkloadHandle,
        _path: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, ExecutionError> {
        Ok(self.lookup(handle).artifacts)
    }
}

pub struct Harness {
    pub controller: Arc<Controller>,
    pub poster: Arc<RecordingPoster>,
    pub cluster: Option<Arc<FakeCluster>>,
    _dir: tempfile::TempDir,
}

pub async fn boot(with_cluster: bool) -> Harness {
    boot_with_queue_depth(with_cluster, 8).await
}

pub async fn boot_with_queue_depth(with_cluster: bool, queue_depth: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.storage.base_dir = dir.path().to_path_buf();
    settings.scheduler.queue_depth = queue_depth;
    settings.scheduler.tick_interval_seconds = 3600; // scenarios drive fire_due directly

    let poster = Arc::new(RecordingPoster::default());
    let cluster = with_cluster.then(|| Arc::new(FakeCluster::default()));
    let controller = supervisor::boot_with(
        settings,
        cluster
            .clone()
            .map(|c| c as Arc<dyn ClusterClient>),
        Arc::new(UnreachableShell),
        Arc::clone(&poster) as Arc<dyn HttpPoster>,
    )
    .await
    .unwrap();

    Harness {
        controller: Arc::new(controller),
        poster,
        cluster,
        _dir: dir,
    }
}

/// A freestyle job made of local shell steps: (name, command, continue_on_error)
pub fn shell_job(name: &str, steps: &[(&str, &str, bool)]) -> FreestyleJob {
    shell_job_with(name, steps, JobTriggers::default())
}

pub fn shell_job_with(
    name: &str,
    steps: &[(&str, &str, bool)],
    triggers: JobTriggers,
) -> FreestyleJob {
    let now = Utc::now();
    FreestyleJob {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
        enabled: true,
        scm: None,
        environment: HashMap::new(),
        parameters: Vec::new(),
        steps: steps
            .iter()
            .map(|(step_name, command, continue_on_error)| BuildStep {
                name: step_name.to_string(),
                action: StepAction::Shell {
                    command: command.to_string(),
                },
                host_id: "local".to_string(),
                timeout_seconds: Some(30),
                continue_on_error: *continue_on_error,
            })
            .collect(),
        triggers,
        status: JobStatus {
            webhook_token: webhook::generate_webhook_token(),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
    }
}

/// Poll until the predicate holds or the timeout lapses
pub async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, pred: F) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Poll until a build reaches a terminal status, then return it
pub async fn wait_terminal_build(
    controller: &Controller,
    build_id: Uuid,
    timeout: Duration,
) -> common::models::FreestyleBuild {
    wait_for("build terminal state", timeout, || {
        controller
            .store
            .builds()
            .get(build_id)
            .map(|b| b.status.is_terminal())
            .unwrap_or(false)
    })
    .await;
    controller.store.builds().get(build_id).unwrap()
}

/// Poll until a run reaches a terminal status, then return it
pub async fn wait_terminal_run(
    controller: &Controller,
    run_id: Uuid,
    timeout: Duration,
) -> common::models::Run {
    wait_for("run terminal state", timeout, || {
        controller
            .store
            .runs()
            .get(run_id)
            .map(|r| r.status.is_terminal())
            .unwrap_or(false)
    })
    .await;
    controller.store.runs().get(run_id).unwrap()
}

pub fn is_terminal(status: RunStatus) -> bool {
    status.is_terminal()
}
