// Cluster executor: translates a pipeline run into batch workloads and
// drives the per-job state machine by watching cluster status. The cluster
// itself sits behind the ClusterClient contract; the controller never talks
// to a runtime directly.

use crate::errors::ExecutionError;
use crate::executor::engine::Engine;
use crate::loghub;
use crate::models::{JobSpec, NotifyEvent, Pipeline, Run, RunStatus};
use crate::notifier::{LifecycleEvent, TargetKind};
use crate::scheduler::CancelToken;
use crate::spec;
use crate::substitution::VariableExpander;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Rendered batch workload handed to the cluster
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout_seconds: Option<u64>,
    /// Artifact directories the workload may populate on its shared volume
    pub artifact_paths: Vec<String>,
}

/// Opaque reference to a submitted workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

/// Contract to the cluster runtime (docker, kubernetes). Implementations
/// live outside the engine; tests use scripted fakes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ExecutionError>;

    /// Status stream; must eventually yield a terminal phase
    async fn watch(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<BoxStream<'static, WorkloadPhase>, ExecutionError>;

    /// Combined container output
    async fn stream_logs(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, ExecutionError>;

    async fn delete(&self, handle: &WorkloadHandle) -> Result<(), ExecutionError>;

    /// Files the workload left in an artifact directory, as (name, contents)
    async fn read_artifact_dir(
        &self,
        handle: &WorkloadHandle,
        path: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, ExecutionError>;
}

#[instrument(skip(engine, cancel), fields(run_id = %run_id))]
pub(crate) async fn run_pipeline(engine: &Engine, run_id: Uuid, cancel: CancelToken) {
    if let Err(e) = execute(engine, run_id, &cancel).await {
        error!(run_id = %run_id, error = %e, "Run execution failed internally");
        let _ = engine.store.runs().update_with(run_id, |r| {
            if !r.status.is_terminal() {
                r.status = RunStatus::Failed;
                r.reason = Some(e.to_string());
                close_timestamps(r);
            }
        });
    }
}

async fn execute(engine: &Engine, run_id: Uuid, cancel: &CancelToken) -> Result<(), ExecutionError> {
    let run = engine.store.runs().get(run_id)?;
    let Ok(pipeline) = engine.store.pipelines().get(run.pipeline_id) else {
        engine.store.runs().update_with(run_id, |r| {
            r.status = RunStatus::Failed;
            r.reason = Some("pipeline no longer exists".to_string());
            close_timestamps(r);
        })?;
        return Ok(());
    };

    if cancel.is_cancelled() {
        let run = engine.store.runs().update_with(run_id, |r| {
            r.status = RunStatus::Cancelled;
            r.reason = Some("cancelled while queued".to_string());
            close_timestamps(r);
        })?;
        settle_pipeline_status(engine, &pipeline, &run);
        emit(engine, &pipeline, &run, NotifyEvent::RunCancelled);
        return Ok(());
    }

    let Some(client) = engine.cluster.clone() else {
        let run = engine.store.runs().update_with(run_id, |r| {
            r.status = RunStatus::Failed;
            r.reason = Some("cluster runtime is not available".to_string());
            close_timestamps(r);
        })?;
        settle_pipeline_status(engine, &pipeline, &run);
        emit(engine, &pipeline, &run, NotifyEvent::RunFailed);
        return Ok(());
    };

    let run = engine.store.runs().update_with(run_id, |r| {
        r.status = RunStatus::Running;
        r.started_at = Some(Utc::now());
    })?;
    metrics::counter!("gagos_runs_started_total").increment(1);
    emit(engine, &pipeline, &run, NotifyEvent::RunStarted);
    info!(pipeline = %pipeline.name, run_number = run.run_number, "Run started");

    let levels = spec::execution_order(&pipeline.spec).map_err(|e| {
        ExecutionError::ClusterFailed(format!("stored spec no longer orders: {}", e))
    })?;
    let jobs_by_name: HashMap<&str, &JobSpec> = pipeline
        .spec
        .stages
        .iter()
        .flat_map(|s| s.jobs.iter())
        .map(|j| (j.name.as_str(), j))
        .collect();

    let fan_out = Arc::new(Semaphore::new(engine.config.max_parallel_jobs));
    let mut any_failed = false;
    let mut cancelled = false;

    for level in levels {
        if any_failed || cancelled {
            // Downstream jobs never start once the run is decided
            for name in &level {
                mark_job(engine, run_id, name, RunStatus::Skipped, None);
            }
            continue;
        }

        let mut tasks = Vec::new();
        for name in &level {
            let Some(job) = jobs_by_name.get(name.as_str()).copied() else {
                continue;
            };
            let gate = Arc::clone(&fan_out);
            let fut = run_job(
                engine,
                Arc::clone(&client),
                &pipeline,
                &run,
                job.clone(),
                cancel.clone(),
            );
            tasks.push(async move {
                // Fan-out cap: the job only starts once a permit frees up
                let _permit = gate.acquire_owned().await;
                fut.await
            });
        }

        for status in futures::future::join_all(tasks).await {
            match status {
                RunStatus::Failed => any_failed = true,
                RunStatus::Cancelled => cancelled = true,
                _ => {}
            }
        }
    }

    let final_status = if cancelled {
        RunStatus::Cancelled
    } else if any_failed {
        RunStatus::Failed
    } else {
        RunStatus::Succeeded
    };
    let run = engine.store.runs().update_with(run_id, |r| {
        r.status = final_status;
        if final_status == RunStatus::Failed {
            r.reason = r
                .jobs
                .iter()
                .find(|j| j.status == RunStatus::Failed)
                .map(|j| format!("job '{}' failed", j.name));
        }
        close_timestamps(r);
    })?;
    settle_pipeline_status(engine, &pipeline, &run);

    let event = match final_status {
        RunStatus::Succeeded => NotifyEvent::RunSucceeded,
        RunStatus::Cancelled => NotifyEvent::RunCancelled,
        _ => NotifyEvent::RunFailed,
    };
    emit(engine, &pipeline, &run, event);
    metrics::counter!("gagos_runs_finished_total", "status" => final_status.as_str()).increment(1);
    info!(pipeline = %pipeline.name, run_number = run.run_number, status = final_status.as_str(), "Run finished");
    Ok(())
}

/// Drive one job: submit, stream logs, watch to terminal, collect artifacts
async fn run_job(
    engine: &Engine,
    client: Arc<dyn ClusterClient>,
    pipeline: &Pipeline,
    run: &Run,
    job: JobSpec,
    cancel: CancelToken,
) -> RunStatus {
    let key = loghub::run_job_key(run.id, &job.name);
    engine.loghub.begin(&key);
    let status = drive_job(engine, client, pipeline, run, &job, &key, &cancel).await;
    engine.loghub.finish(&key);
    let reason = match status {
        RunStatus::Failed => Some("workload failed".to_string()),
        _ => None,
    };
    mark_job(engine, run.id, &job.name, status, reason);
    status
}

async fn drive_job(
    engine: &Engine,
    client: Arc<dyn ClusterClient>,
    pipeline: &Pipeline,
    run: &Run,
    job: &JobSpec,
    key: &str,
    cancel: &CancelToken,
) -> RunStatus {
    let workload = render_workload(pipeline, run, job);
    let handle = match client.submit(&workload).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(job = %job.name, error = %e, "Workload submission failed");
            engine
                .loghub
                .publish(key, format!("submission failed: {}\n", e).as_bytes());
            return RunStatus::Failed;
        }
    };
    let _ = engine.store.runs().update_with(run.id, |r| {
        if let Some(state) = r.jobs.iter_mut().find(|j| j.name == job.name) {
            state.status = RunStatus::Running;
            state.workload = Some(handle.0.clone());
            state.started_at = Some(Utc::now());
        }
    });

    // Forward container output into the hub as it arrives
    let forwarder = match client.stream_logs(&handle).await {
        Ok(mut stream) => {
            let hub = Arc::clone(&engine.loghub);
            let key = key.to_string();
            Some(tokio::spawn(async move {
                while let Some(chunk) = stream.next().await {
                    hub.publish(&key, &chunk);
                }
            }))
        }
        Err(e) => {
            warn!(job = %job.name, error = %e, "Log stream unavailable");
            None
        }
    };

    let status = watch_to_terminal(client.as_ref(), &handle, cancel).await;
    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }

    if status == RunStatus::Cancelled {
        if let Err(e) = client.delete(&handle).await {
            warn!(job = %job.name, error = %e, "Workload delete failed after cancel");
        }
        return RunStatus::Cancelled;
    }

    if status == RunStatus::Succeeded {
        collect_artifacts(engine, client.as_ref(), &handle, pipeline.id, run.id, job).await;
    }
    status
}

async fn watch_to_terminal(
    client: &dyn ClusterClient,
    handle: &WorkloadHandle,
    cancel: &CancelToken,
) -> RunStatus {
    let mut watch = match client.watch(handle).await {
        Ok(watch) => watch,
        Err(e) => {
            warn!(handle = %handle.0, error = %e, "Watch failed");
            return RunStatus::Failed;
        }
    };
    loop {
        tokio::select! {
            phase = watch.next() => match phase {
                Some(WorkloadPhase::Succeeded) => return RunStatus::Succeeded,
                Some(WorkloadPhase::Failed) => return RunStatus::Failed,
                Some(_) => {}
                // A watch that ends without a terminal phase is a failure
                None => return RunStatus::Failed,
            },
            _ = cancel.cancelled() => return RunStatus::Cancelled,
        }
    }
}

/// After a successful workload, lift every file from its artifact
/// directories into the artifact store
async fn collect_artifacts(
    engine: &Engine,
    client: &dyn ClusterClient,
    handle: &WorkloadHandle,
    pipeline_id: Uuid,
    run_id: Uuid,
    job: &JobSpec,
) {
    let Some(artifacts) = &job.artifacts else {
        return;
    };
    for path in &artifacts.paths {
        match client.read_artifact_dir(handle, path).await {
            Ok(files) => {
                for (name, bytes) in files {
                    if let Err(e) = engine.artifacts.save(pipeline_id, run_id, &name, &bytes) {
                        warn!(job = %job.name, artifact = %name, error = %e, "Artifact capture failed");
                    }
                }
            }
            Err(e) => {
                warn!(job = %job.name, path = %path, error = %e, "Artifact directory unreadable");
            }
        }
    }
}

/// Expand run variables into the job's env and command
fn render_workload(pipeline: &Pipeline, run: &Run, job: &JobSpec) -> WorkloadSpec {
    let expander = VariableExpander::new();
    let mut env = run.variables.clone();
    for (k, v) in &job.env {
        env.insert(k.clone(), expander.expand(v, &run.variables));
    }
    let command = job
        .command
        .iter()
        .map(|part| expander.expand(part, &env))
        .collect();
    WorkloadSpec {
        name: workload_name(&pipeline.name, run.run_number, &job.name),
        image: job.image.clone(),
        command,
        env,
        timeout_seconds: job.timeout_seconds,
        artifact_paths: job
            .artifacts
            .as_ref()
            .map(|a| a.paths.clone())
            .unwrap_or_default(),
    }
}

/// Cluster-safe workload name: lowercase alphanumerics and dashes
fn workload_name(pipeline: &str, run_number: i64, job: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("{}-{}-{}", sanitize(pipeline), run_number, sanitize(job))
}

fn mark_job(engine: &Engine, run_id: Uuid, name: &str, status: RunStatus, reason: Option<String>) {
    let _ = engine.store.runs().update_with(run_id, |r| {
        if let Some(state) = r.jobs.iter_mut().find(|j| j.name == name) {
            if !state.status.is_terminal() {
                state.status = status;
                state.reason = reason.clone();
                if status != RunStatus::Skipped {
                    state.finished_at = Some(Utc::now());
                }
            }
        }
    });
}

fn close_timestamps(run: &mut Run) {
    let now = Utc::now();
    run.finished_at = Some(now);
    run.duration_ms = run
        .started_at
        .map(|started| (now - started).num_milliseconds());
}

fn settle_pipeline_status(engine: &Engine, pipeline: &Pipeline, run: &Run) {
    let result = engine.store.pipelines().update_with(pipeline.id, |p| {
        p.status.last_run_id = Some(run.id);
        p.status.last_run_status = Some(run.status);
        p.status.last_run_at = run.finished_at.or(Some(Utc::now()));
    });
    if let Err(e) = result {
        warn!(pipeline_id = %pipeline.id, error = %e, "Failed to update pipeline status block");
    }
}

fn emit(engine: &Engine, pipeline: &Pipeline, run: &Run, event: NotifyEvent) {
    engine.notifier.emit(LifecycleEvent {
        event,
        target_kind: TargetKind::Pipeline,
        target_id: pipeline.id,
        target_name: pipeline.name.clone(),
        number: run.run_number,
        status: run.status,
        duration_ms: run.duration_ms,
        trigger: run.trigger,
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_name_sanitized() {
        assert_eq!(
            workload_name("Build Images", 7, "unit_tests"),
            "build-images-7-unit-tests"
        );
    }

    #[test]
    fn test_render_workload_expands_variables() {
        let yaml = r#"
name: p
variables:
  REGISTRY: registry.local
stages:
  - name: s
    jobs:
      - name: push
        image: docker:24
        command: ["push", "${REGISTRY}/app"]
        env:
          TARGET: "${REGISTRY}"
"#;
        let pipeline = crate::spec::new_pipeline(yaml).unwrap();
        let run = Run {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            run_number: 3,
            trigger: crate::models::TriggerSource::Manual,
            trigger_user: None,
            commit: None,
            variables: pipeline.spec.variables.clone(),
            status: RunStatus::Running,
            jobs: Vec::new(),
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
        };
        let job = &pipeline.spec.stages[0].jobs[0];
        let workload = render_workload(&pipeline, &run, job);
        assert_eq!(workload.command, vec!["push", "registry.local/app"]);
        assert_eq!(workload.env["TARGET"], "registry.local");
        assert_eq!(workload.name, "p-3-push");
    }
}
