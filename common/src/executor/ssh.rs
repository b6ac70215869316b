// Remote shell client over ssh2. The library is blocking, so every operation
// runs inside spawn_blocking; TCP read timeouts keep blocking reads short
// enough to observe cancellation promptly.

use crate::errors::ExecutionError;
use crate::models::{SshAuthMethod, SshHost, SshSecret};
use crate::scheduler::CancelToken;
use async_trait::async_trait;
use ssh2::Session;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

/// Everything needed to open an authenticated session to one host
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Optional SHA-256 host key fingerprint pin (hex)
    pub fingerprint: Option<String>,
    pub io_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl SshTarget {
    /// Assemble a target from a host record and its unsealed secret
    pub fn from_host(
        host: &SshHost,
        secret: &SshSecret,
        io_timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let auth = match host.auth_method {
            SshAuthMethod::Password => {
                let password = secret.password.clone().ok_or_else(|| {
                    ExecutionError::SshAuthenticationFailed(format!(
                        "host '{}' has no sealed password",
                        host.name
                    ))
                })?;
                SshAuth::Password(password)
            }
            SshAuthMethod::Key => {
                let private_key = secret.private_key.clone().ok_or_else(|| {
                    ExecutionError::SshAuthenticationFailed(format!(
                        "host '{}' has no sealed private key",
                        host.name
                    ))
                })?;
                SshAuth::Key {
                    private_key,
                    passphrase: secret.passphrase.clone(),
                }
            }
        };
        Ok(Self {
            host: host.host.clone(),
            port: host.port,
            username: host.username.clone(),
            auth,
            fingerprint: host.fingerprint.clone(),
            io_timeout,
        })
    }
}

/// Source for an upload: a workspace file or an in-memory script body
pub enum UploadSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// Remote shell operations consumed by the freestyle executor
#[async_trait]
pub trait RemoteShellClient: Send + Sync {
    /// Execute a command, streaming combined stdout/stderr into `output`.
    /// Returns the remote exit code.
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        env: &HashMap<String, String>,
        output: mpsc::Sender<Vec<u8>>,
        cancel: CancelToken,
    ) -> Result<i32, ExecutionError>;

    /// Upload a file or byte buffer to `remote_path` with the given mode
    async fn upload(
        &self,
        target: &SshTarget,
        source: UploadSource,
        remote_path: &str,
        mode: i32,
    ) -> Result<u64, ExecutionError>;

    /// Download `remote_path` into `local_path`
    async fn download(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<u64, ExecutionError>;
}

/// Production implementation on ssh2
pub struct Ssh2ShellClient;

#[async_trait]
impl RemoteShellClient for Ssh2ShellClient {
    #[instrument(skip(self, target, env, output, cancel), fields(host = %target.host, port = target.port))]
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        env: &HashMap<String, String>,
        output: mpsc::Sender<Vec<u8>>,
        cancel: CancelToken,
    ) -> Result<i32, ExecutionError> {
        let target = target.clone();
        let command = prefix_env(command, env);
        tokio::task::spawn_blocking(move || {
            let session = connect(&target)?;
            let mut channel = session.channel_session().map_err(|e| {
                ExecutionError::SshOperationFailed(format!("open channel: {}", e))
            })?;
            // Merge stderr into the stdout stream; step output is combined
            channel
                .handle_extended_data(ssh2::ExtendedData::Merge)
                .map_err(|e| ExecutionError::SshOperationFailed(format!("merge streams: {}", e)))?;
            channel
                .exec(&command)
                .map_err(|e| ExecutionError::SshOperationFailed(format!("exec: {}", e)))?;

            let mut buf = [0u8; 8192];
            loop {
                match channel.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output.blocking_send(buf[..n].to_vec()).is_err() {
                            // Receiver gone; keep draining so exit status is real
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        if cancel.is_cancelled() {
                            let _ = channel.close();
                            return Err(ExecutionError::Cancelled);
                        }
                    }
                    Err(e) => {
                        return Err(ExecutionError::SshOperationFailed(format!("read: {}", e)));
                    }
                }
                if cancel.is_cancelled() {
                    let _ = channel.close();
                    return Err(ExecutionError::Cancelled);
                }
            }

            let _ = channel.wait_close();
            channel
                .exit_status()
                .map_err(|e| ExecutionError::SshOperationFailed(format!("exit status: {}", e)))
        })
        .await
        .map_err(|e| ExecutionError::SshOperationFailed(format!("worker join: {}", e)))?
    }

    #[instrument(skip(self, target, source), fields(host = %target.host, remote_path = %remote_path))]
    async fn upload(
        &self,
        target: &SshTarget,
        source: UploadSource,
        remote_path: &str,
        mode: i32,
    ) -> Result<u64, ExecutionError> {
        let target = target.clone();
        let remote_path = remote_path.to_string();
        let data = match source {
            UploadSource::Bytes(bytes) => bytes,
            UploadSource::File(path) => tokio::fs::read(&path).await.map_err(|e| {
                ExecutionError::TransferFailed(format!("read {}: {}", path.display(), e))
            })?,
        };
        tokio::task::spawn_blocking(move || {
            let session = connect(&target)?;
            let mut channel = session
                .scp_send(Path::new(&remote_path), mode, data.len() as u64, None)
                .map_err(|e| ExecutionError::TransferFailed(format!("scp send: {}", e)))?;
            channel
                .write_all(&data)
                .map_err(|e| ExecutionError::TransferFailed(format!("write: {}", e)))?;
            let _ = channel.send_eof();
            let _ = channel.wait_eof();
            let _ = channel.close();
            let _ = channel.wait_close();
            info!(bytes = data.len(), "Upload complete");
            Ok(data.len() as u64)
        })
        .await
        .map_err(|e| ExecutionError::TransferFailed(format!("worker join: {}", e)))?
    }

    #[instrument(skip(self, target), fields(host = %target.host, remote_path = %remote_path))]
    async fn download(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<u64, ExecutionError> {
        let target = target.clone();
        let remote_path = remote_path.to_string();
        let local_path = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let session = connect(&target)?;
            let (mut channel, stat) = session
                .scp_recv(Path::new(&remote_path))
                .map_err(|e| ExecutionError::TransferFailed(format!("scp recv: {}", e)))?;
            let mut contents = Vec::with_capacity(stat.size() as usize);
            channel
                .read_to_end(&mut contents)
                .map_err(|e| ExecutionError::TransferFailed(format!("read: {}", e)))?;
            if let Some(parent) = local_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ExecutionError::TransferFailed(format!("create {}: {}", parent.display(), e))
                })?;
            }
            std::fs::write(&local_path, &contents).map_err(|e| {
                ExecutionError::TransferFailed(format!("write {}: {}", local_path.display(), e))
            })?;
            info!(bytes = contents.len(), "Download complete");
            Ok(contents.len() as u64)
        })
        .await
        .map_err(|e| ExecutionError::TransferFailed(format!("worker join: {}", e)))?
    }
}

/// Open and authenticate a session. TCP and session timeouts bound every
/// blocking operation on the returned session.
fn connect(target: &SshTarget) -> Result<Session, ExecutionError> {
    let addr = format!("{}:{}", target.host, target.port);
    let tcp = TcpStream::connect(&addr).map_err(|e| {
        error!(error = %e, addr = %addr, "TCP connect failed");
        ExecutionError::SshConnectionFailed(format!("connect {}: {}", addr, e))
    })?;
    let timeout = Some(target.io_timeout);
    tcp.set_read_timeout(timeout)
        .map_err(|e| ExecutionError::SshConnectionFailed(format!("set read timeout: {}", e)))?;
    tcp.set_write_timeout(timeout)
        .map_err(|e| ExecutionError::SshConnectionFailed(format!("set write timeout: {}", e)))?;

    let mut session = Session::new()
        .map_err(|e| ExecutionError::SshConnectionFailed(format!("create session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(target.io_timeout.as_millis() as u32);
    session.handshake().map_err(|e| {
        error!(error = %e, "SSH handshake failed");
        ExecutionError::SshConnectionFailed(format!("handshake: {}", e))
    })?;

    verify_fingerprint(&session, target)?;
    authenticate(&session, target)?;

    if !session.authenticated() {
        return Err(ExecutionError::SshAuthenticationFailed(
            "session not authenticated".to_string(),
        ));
    }
    debug!(host = %target.host, "SSH session established");
    Ok(session)
}

/// When a fingerprint pin is configured, the host key hash must match it
fn verify_fingerprint(session: &Session, target: &SshTarget) -> Result<(), ExecutionError> {
    let Some(expected) = target.fingerprint.as_deref() else {
        return Ok(());
    };
    let hash = session
        .host_key_hash(ssh2::HashType::Sha256)
        .ok_or_else(|| {
            ExecutionError::SshConnectionFailed("host key hash unavailable".to_string())
        })?;
    let actual = hex::encode(hash);
    if !actual.eq_ignore_ascii_case(expected) {
        error!(host = %target.host, expected = %expected, actual = %actual, "Host key mismatch");
        return Err(ExecutionError::SshConnectionFailed(format!(
            "host key mismatch for {}",
            target.host
        )));
    }
    Ok(())
}

fn authenticate(session: &Session, target: &SshTarget) -> Result<(), ExecutionError> {
    match &target.auth {
        SshAuth::Password(password) => session
            .userauth_password(&target.username, password)
            .map_err(|e| {
                ExecutionError::SshAuthenticationFailed(format!(
                    "password auth for {}: {}",
                    target.username, e
                ))
            }),
        SshAuth::Key {
            private_key,
            passphrase,
        } => session
            .userauth_pubkey_memory(
                &target.username,
                None,
                private_key,
                passphrase.as_deref(),
            )
            .map_err(|e| {
                ExecutionError::SshAuthenticationFailed(format!(
                    "key auth for {}: {}",
                    target.username, e
                ))
            }),
    }
}

/// Prepend exported env assignments so the remote command sees the merged
/// environment. Values are single-quoted; embedded quotes are escaped.
fn prefix_env(command: &str, env: &HashMap<String, String>) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let exports: Vec<String> = keys
        .iter()
        .map(|k| format!("export {}={}", k, shell_quote(&env[*k])))
        .collect();
    format!("{}; {}", exports.join("; "), command)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Connection test used by the credential API: open a session, run `true`
pub async fn test_connection(
    client: &dyn RemoteShellClient,
    target: &SshTarget,
) -> Result<(), ExecutionError> {
    let (tx, mut rx) = mpsc::channel(8);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let code = client
        .run(target, "true", &HashMap::new(), tx, CancelToken::never())
        .await?;
    let _ = drain.await;
    if code != 0 {
        return Err(ExecutionError::SshOperationFailed(format!(
            "probe command exited {}",
            code
        )));
    }
    Ok(())
}
