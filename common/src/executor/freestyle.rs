// Freestyle executor: drives one build through workspace setup, the step
// loop and teardown. State machine per build:
//
//   pending -> running -> succeeded | failed | cancelled
//
// The cancellation signal is checked before every step and propagated into
// step I/O; step timeouts fire the same signal scoped to the step.

use crate::errors::ExecutionError;
use crate::executor::engine::Engine;
use crate::executor::{git, local, ssh};
use crate::loghub;
use crate::models::{
    BuildStep, FreestyleBuild, FreestyleJob, NotifyEvent, RunStatus, StepAction,
};
use crate::notifier::{LifecycleEvent, TargetKind};
use crate::scheduler::{cancel_pair, CancelToken};
use crate::substitution::VariableExpander;
use crate::vault;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one step after timeout/cancel interpretation
enum StepOutcome {
    Succeeded { exit_code: i32 },
    Failed { exit_code: Option<i32>, reason: String },
    Cancelled,
}

#[instrument(skip(engine, cancel), fields(build_id = %build_id))]
pub(crate) async fn run_build(engine: &Engine, build_id: Uuid, cancel: CancelToken) {
    if let Err(e) = execute(engine, build_id, &cancel).await {
        error!(build_id = %build_id, error = %e, "Build execution failed internally");
        let _ = engine.store.builds().update_with(build_id, |b| {
            if !b.status.is_terminal() {
                b.status = RunStatus::Failed;
                b.reason = Some(e.to_string());
                close_timestamps(b);
            }
        });
    }
}

async fn execute(
    engine: &Engine,
    build_id: Uuid,
    cancel: &CancelToken,
) -> Result<(), ExecutionError> {
    let build = engine.store.builds().get(build_id)?;
    let Ok(job) = engine.store.jobs().get(build.job_id) else {
        engine.store.builds().update_with(build_id, |b| {
            b.status = RunStatus::Failed;
            b.reason = Some("job no longer exists".to_string());
            close_timestamps(b);
        })?;
        return Ok(());
    };

    // Cancelled while still queued: terminal without running anything
    if cancel.is_cancelled() {
        let build = engine.store.builds().update_with(build_id, |b| {
            b.status = RunStatus::Cancelled;
            b.reason = Some("cancelled while queued".to_string());
            close_timestamps(b);
        })?;
        settle_job_status(engine, &job, &build);
        emit(engine, &job, &build, NotifyEvent::BuildCancelled);
        return Ok(());
    }

    let key = loghub::build_key(build_id);
    engine.loghub.begin(&key);

    let build = engine.store.builds().update_with(build_id, |b| {
        b.status = RunStatus::Running;
        b.started_at = Some(Utc::now());
    })?;
    metrics::counter!("gagos_builds_started_total").increment(1);
    emit(engine, &job, &build, NotifyEvent::BuildStarted);
    info!(job = %job.name, build_number = build.build_number, "Build started");

    let workspace = engine.workspaces_dir.join(format!("build-{}", build_id));
    let setup = std::fs::create_dir_all(&workspace)
        .map_err(|e| ExecutionError::WorkspaceFailed(format!("create workspace: {}", e)));

    let (status, reason) = match setup {
        Err(e) => (RunStatus::Failed, Some(e.to_string())),
        Ok(()) => run_phases(engine, &job, &build, &workspace, &key, cancel).await,
    };

    if let Err(e) = std::fs::remove_dir_all(&workspace) {
        if workspace.exists() {
            warn!(workspace = %workspace.display(), error = %e, "Failed to remove workspace");
        }
    }

    let build = engine.store.builds().update_with(build_id, |b| {
        b.status = status;
        b.reason = reason.clone();
        close_timestamps(b);
    })?;
    engine.loghub.finish(&key);
    settle_job_status(engine, &job, &build);

    let event = match status {
        RunStatus::Succeeded => NotifyEvent::BuildSucceeded,
        RunStatus::Cancelled => NotifyEvent::BuildCancelled,
        _ => NotifyEvent::BuildFailed,
    };
    emit(engine, &job, &build, event);
    metrics::counter!("gagos_builds_finished_total", "status" => status.as_str()).increment(1);
    info!(job = %job.name, build_number = build.build_number, status = status.as_str(), "Build finished");
    Ok(())
}

/// Clone phase plus the step loop. Returns the build's terminal status and
/// optional human-readable reason.
async fn run_phases(
    engine: &Engine,
    job: &FreestyleJob,
    build: &FreestyleBuild,
    workspace: &Path,
    key: &str,
    cancel: &CancelToken,
) -> (RunStatus, Option<String>) {
    let publish = |bytes: &[u8]| engine.loghub.publish(key, bytes);

    if let Some(scm) = &job.scm {
        let resolve = |credential_id: Uuid| {
            let credential = engine
                .store
                .git_credentials()
                .get(credential_id)
                .map_err(|_| {
                    ExecutionError::GitCloneFailed(format!(
                        "git credential {} not found",
                        credential_id
                    ))
                })?;
            let sealed = credential.sealed_secret.as_deref().ok_or_else(|| {
                ExecutionError::GitCloneFailed(format!(
                    "git credential '{}' has no sealed secret",
                    credential.name
                ))
            })?;
            let secret = vault::open_git_secret(engine.sealer.as_ref(), sealed)?;
            Ok((credential, secret))
        };
        if let Err(e) =
            git::clone_repositories(workspace, &scm.repositories, resolve, cancel, &publish).await
        {
            if matches!(e, ExecutionError::Cancelled) {
                return (RunStatus::Cancelled, Some("cancelled during checkout".to_string()));
            }
            // Clone failure fails the build before any step runs
            return (RunStatus::Failed, Some(e.to_string()));
        }
    }

    let env = build_env(job, build, workspace);
    let expander = VariableExpander::new();

    let mut build_failed_reason: Option<String> = None;
    for (index, step) in job.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return (RunStatus::Cancelled, Some("cancelled between steps".to_string()));
        }

        let host_name = match resolve_host_name(engine, step) {
            Ok(name) => name,
            Err(e) => {
                let _ = engine.store.builds().update_with(build.id, |b| {
                    if let Some(s) = b.steps.get_mut(index) {
                        s.status = RunStatus::Failed;
                        s.reason = Some(e.to_string());
                    }
                });
                if step.continue_on_error {
                    continue;
                }
                return (RunStatus::Failed, Some(format!("step '{}' failed: {}", step.name, e)));
            }
        };

        let _ = engine.store.builds().update_with(build.id, |b| {
            if let Some(s) = b.steps.get_mut(index) {
                s.status = RunStatus::Running;
                s.host = host_name.clone();
                s.started_at = Some(Utc::now());
            }
        });

        let outcome = run_step(engine, step, &env, &expander, workspace, key, cancel).await;

        let (step_status, exit_code, step_reason) = match &outcome {
            StepOutcome::Succeeded { exit_code } => (RunStatus::Succeeded, Some(*exit_code), None),
            StepOutcome::Failed { exit_code, reason } => {
                (RunStatus::Failed, *exit_code, Some(reason.clone()))
            }
            StepOutcome::Cancelled => (RunStatus::Cancelled, None, None),
        };
        let _ = engine.store.builds().update_with(build.id, |b| {
            if let Some(s) = b.steps.get_mut(index) {
                s.status = step_status;
                s.exit_code = exit_code;
                s.reason = step_reason.clone();
                s.finished_at = Some(Utc::now());
            }
        });

        match outcome {
            StepOutcome::Succeeded { .. } => {}
            StepOutcome::Cancelled => {
                return (RunStatus::Cancelled, Some(format!("cancelled in step '{}'", step.name)));
            }
            StepOutcome::Failed { reason, .. } => {
                if step.continue_on_error {
                    warn!(step = %step.name, reason = %reason, "Step failed, continuing");
                    continue;
                }
                build_failed_reason = Some(format!("step '{}' failed: {}", step.name, reason));
                break;
            }
        }
    }

    match build_failed_reason {
        Some(reason) => (RunStatus::Failed, Some(reason)),
        None => (RunStatus::Succeeded, None),
    }
}

/// Dispatch one step with its timeout and cancellation scope
async fn run_step(
    engine: &Engine,
    step: &BuildStep,
    env: &HashMap<String, String>,
    expander: &VariableExpander,
    workspace: &Path,
    key: &str,
    cancel: &CancelToken,
) -> StepOutcome {
    let timeout_seconds = step
        .timeout_seconds
        .unwrap_or(engine.config.default_step_timeout_seconds);
    let (step_switch, step_token) = cancel_pair();

    let action = dispatch_action(engine, step, env, expander, workspace, key, &step_token);
    tokio::pin!(action);
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_seconds));
    tokio::pin!(deadline);

    let mut timed_out = false;
    let mut build_cancelled = false;
    let result = loop {
        tokio::select! {
            result = &mut action => break result,
            _ = cancel.cancelled(), if !build_cancelled && !timed_out => {
                build_cancelled = true;
                step_switch.cancel();
            }
            _ = &mut deadline, if !timed_out && !build_cancelled => {
                timed_out = true;
                step_switch.cancel();
            }
        }
    };

    // The signal outranks whatever the process did afterwards
    if build_cancelled {
        return StepOutcome::Cancelled;
    }
    if timed_out {
        return StepOutcome::Failed {
            exit_code: None,
            reason: format!("timeout after {} seconds", timeout_seconds),
        };
    }
    match result {
        Ok(0) => StepOutcome::Succeeded { exit_code: 0 },
        Ok(code) => StepOutcome::Failed {
            exit_code: Some(code),
            reason: format!("exited {}", code),
        },
        Err(ExecutionError::Cancelled) => StepOutcome::Cancelled,
        Err(e) => StepOutcome::Failed {
            exit_code: None,
            reason: e.to_string(),
        },
    }
}

/// Execute the typed payload; returns the exit code
async fn dispatch_action(
    engine: &Engine,
    step: &BuildStep,
    env: &HashMap<String, String>,
    expander: &VariableExpander,
    workspace: &Path,
    key: &str,
    cancel: &CancelToken,
) -> Result<i32, ExecutionError> {
    let publish = |bytes: &[u8]| engine.loghub.publish(key, bytes);

    if step.is_local() {
        return match &step.action {
            StepAction::Shell { command } => {
                let command = expander.expand(command, env);
                local::run_shell(&command, workspace, env, cancel, &publish).await
            }
            StepAction::Script { script } => {
                let script = expander.expand(script, env);
                let script_path = workspace.join(format!(".step-{}.sh", Uuid::new_v4()));
                std::fs::write(&script_path, script.as_bytes())
                    .map_err(|e| ExecutionError::WorkspaceFailed(format!("write script: {}", e)))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o700))
                        .map_err(|e| {
                            ExecutionError::WorkspaceFailed(format!("chmod script: {}", e))
                        })?;
                }
                let command = format!("sh '{}'", script_path.display());
                let code = local::run_shell(&command, workspace, env, cancel, &publish).await;
                let _ = std::fs::remove_file(&script_path);
                code
            }
            other => Err(ExecutionError::RemoteHostRequired {
                step: format!("{} ({})", step.name, other.kind()),
            }),
        };
    }

    // Remote step: resolve the host record and unseal its credentials
    let host_id = Uuid::parse_str(&step.host_id)
        .map_err(|_| ExecutionError::UnknownHost(step.host_id.clone()))?;
    let host = engine
        .store
        .ssh_hosts()
        .get(host_id)
        .map_err(|_| ExecutionError::UnknownHost(step.host_id.clone()))?;
    let sealed = host
        .sealed_secret
        .as_deref()
        .ok_or(crate::errors::VaultError::NoSecret)
        .map_err(ExecutionError::Vault)?;
    let secret = vault::open_ssh_secret(engine.sealer.as_ref(), sealed)?;
    let target = ssh::SshTarget::from_host(
        &host,
        &secret,
        Duration::from_secs(engine.config.ssh_io_timeout_seconds),
    )?;

    match &step.action {
        StepAction::Shell { command } => {
            let command = expander.expand(command, env);
            remote_run(engine, &target, &command, env, key, cancel).await
        }
        StepAction::Script { script } => {
            let script = expander.expand(script, env);
            let remote_path = format!("/tmp/gagos-step-{}.sh", Uuid::new_v4());
            engine
                .shell
                .upload(
                    &target,
                    ssh::UploadSource::Bytes(script.into_bytes()),
                    &remote_path,
                    0o700,
                )
                .await?;
            // Run, then remove the script regardless of its exit code
            let command = format!("{p}; rc=$?; rm -f {p}; exit $rc", p = remote_path);
            remote_run(engine, &target, &command, env, key, cancel).await
        }
        StepAction::ScpPush {
            local_path,
            remote_path,
        } => {
            let local_path = workspace.join(expander.expand(local_path, env));
            let remote_path = expander.expand(remote_path, env);
            let bytes = engine
                .shell
                .upload(
                    &target,
                    ssh::UploadSource::File(local_path.clone()),
                    &remote_path,
                    0o644,
                )
                .await?;
            publish(
                format!(
                    "uploaded {} ({} bytes) to {}:{}\n",
                    local_path.display(),
                    bytes,
                    host.host,
                    remote_path
                )
                .as_bytes(),
            );
            Ok(0)
        }
        StepAction::ScpPull {
            remote_path,
            local_path,
        } => {
            let remote_path = expander.expand(remote_path, env);
            let local_path = workspace.join(expander.expand(local_path, env));
            let bytes = engine
                .shell
                .download(&target, &remote_path, &local_path)
                .await?;
            publish(
                format!(
                    "downloaded {}:{} ({} bytes) to {}\n",
                    host.host,
                    remote_path,
                    bytes,
                    local_path.display()
                )
                .as_bytes(),
            );
            Ok(0)
        }
    }
}

/// Run a remote command, forwarding its combined output into the log hub
async fn remote_run(
    engine: &Engine,
    target: &ssh::SshTarget,
    command: &str,
    env: &HashMap<String, String>,
    key: &str,
    cancel: &CancelToken,
) -> Result<i32, ExecutionError> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let hub = Arc::clone(&engine.loghub);
    let key = key.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            hub.publish(&key, &chunk);
        }
    });
    let result = engine
        .shell
        .run(target, command, env, tx, cancel.clone())
        .await;
    let _ = forwarder.await;
    result
}

/// Merged step environment: job env, then parameter values, then built-ins
fn build_env(
    job: &FreestyleJob,
    build: &FreestyleBuild,
    workspace: &Path,
) -> HashMap<String, String> {
    let mut env = job.environment.clone();
    env.extend(build.parameters.clone());
    env.insert("BUILD_NUMBER".to_string(), build.build_number.to_string());
    env.insert("JOB_NAME".to_string(), job.name.clone());
    env.insert("WORKSPACE".to_string(), workspace.display().to_string());
    env
}

/// Host name recorded on remote step results; None for local steps
fn resolve_host_name(engine: &Engine, step: &BuildStep) -> Result<Option<String>, ExecutionError> {
    if step.is_local() {
        if step.action.requires_remote() {
            return Err(ExecutionError::RemoteHostRequired {
                step: step.name.clone(),
            });
        }
        return Ok(None);
    }
    let host_id = Uuid::parse_str(&step.host_id)
        .map_err(|_| ExecutionError::UnknownHost(step.host_id.clone()))?;
    let host = engine
        .store
        .ssh_hosts()
        .get(host_id)
        .map_err(|_| ExecutionError::UnknownHost(step.host_id.clone()))?;
    Ok(Some(host.name))
}

fn close_timestamps(build: &mut FreestyleBuild) {
    let now = Utc::now();
    build.finished_at = Some(now);
    build.duration_ms = build
        .started_at
        .map(|started| (now - started).num_milliseconds());
}

/// Update the owning job's status block after a terminal build
fn settle_job_status(engine: &Engine, job: &FreestyleJob, build: &FreestyleBuild) {
    let result = engine.store.jobs().update_with(job.id, |j| {
        j.status.last_build_id = Some(build.id);
        j.status.last_build_status = Some(build.status);
        j.status.last_build_at = build.finished_at.or(Some(Utc::now()));
    });
    if let Err(e) = result {
        warn!(job_id = %job.id, error = %e, "Failed to update job status block");
    }
}

fn emit(engine: &Engine, job: &FreestyleJob, build: &FreestyleBuild, event: NotifyEvent) {
    engine.notifier.emit(LifecycleEvent {
        event,
        target_kind: TargetKind::Freestyle,
        target_id: job.id,
        target_name: job.name.clone(),
        number: build.build_number,
        status: build.status,
        duration_ms: build.duration_ms,
        trigger: build.trigger,
        timestamp: Utc::now(),
    });
}
