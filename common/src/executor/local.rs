// Local process execution for freestyle steps and git operations. Combined
// stdout/stderr is streamed to the caller chunk by chunk; cancellation kills
// the child process.

use crate::errors::ExecutionError;
use crate::scheduler::CancelToken;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported when the child was terminated by a signal
pub const SIGNAL_EXIT: i32 = -1;

/// Run `sh -c <command>` in `cwd`, streaming combined output
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    cancel: &CancelToken,
    publish: &(dyn Fn(&[u8]) + Send + Sync),
) -> Result<i32, ExecutionError> {
    run_command("sh", &["-c".to_string(), command.to_string()], cwd, env, cancel, publish).await
}

/// Spawn a program with arguments, streaming combined output until exit,
/// cancellation, or caller-side timeout (the caller drops this future; the
/// child dies with it).
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    cancel: &CancelToken,
    publish: &(dyn Fn(&[u8]) + Send + Sync),
) -> Result<i32, ExecutionError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecutionError::SpawnFailed(format!("{}: {}", program, e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutionError::SpawnFailed("stdout not piped".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutionError::SpawnFailed("stderr not piped".to_string()))?;

    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_done = false;
    let mut err_done = false;

    while !out_done || !err_done {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !out_done => match read {
                Ok(0) => out_done = true,
                Ok(n) => publish(&out_buf[..n]),
                Err(e) => {
                    warn!(error = %e, "stdout read failed");
                    out_done = true;
                }
            },
            read = stderr.read(&mut err_buf), if !err_done => match read {
                Ok(0) => err_done = true,
                Ok(n) => publish(&err_buf[..n]),
                Err(e) => {
                    warn!(error = %e, "stderr read failed");
                    err_done = true;
                }
            },
            _ = cancel.cancelled() => {
                debug!(program = %program, "Killing process on cancellation");
                let _ = child.kill().await;
                return Err(ExecutionError::Cancelled);
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|e| ExecutionError::SpawnFailed(format!("wait: {}", e)))?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ExecutionError::Cancelled);
        }
    };

    Ok(status.code().unwrap_or(SIGNAL_EXIT))
}
