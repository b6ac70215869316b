// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all persisted state
    pub base_dir: PathBuf,
    /// Ring buffer capacity for live log capture, in bytes
    pub log_ring_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            log_ring_bytes: 1024 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn seal_key_path(&self) -> PathBuf {
        self.base_dir.join("keys").join("seal.key")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.base_dir.join("workspaces")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the cron loop wakes up to check registrations (in seconds)
    pub tick_interval_seconds: u64,
    /// Per-target serialization queue depth
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 10,
            queue_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Fan-out cap for independent jobs within one pipeline run
    pub max_parallel_jobs: usize,
    /// Default per-step timeout when a step does not declare one (in seconds)
    pub default_step_timeout_seconds: u64,
    /// SSH TCP read/write timeout; bounds how long a cancelled step can linger
    pub ssh_io_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            default_step_timeout_seconds: 3600,
            ssh_io_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Per-delivery HTTP timeout (in seconds)
    pub request_timeout_seconds: u64,
    /// Delivery attempts beyond the first
    pub max_retries: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            notifier: NotifierConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Cluster runtime selected through the GAGOS_RUNTIME environment variable.
/// When unset the cluster executor reports itself unavailable and only
/// freestyle jobs can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRuntime {
    Docker,
    Kubernetes,
}

impl ClusterRuntime {
    pub fn from_env() -> Option<Self> {
        match std::env::var("GAGOS_RUNTIME").ok().as_deref() {
            Some("docker") => Some(Self::Docker),
            Some("kubernetes") => Some(Self::Kubernetes),
            _ => None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("GAGOS")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }
        if self.storage.log_ring_bytes == 0 {
            return Err("storage.log_ring_bytes must be greater than 0".to_string());
        }
        if self.scheduler.queue_depth == 0 {
            return Err("scheduler.queue_depth must be greater than 0".to_string());
        }
        if self.executor.max_parallel_jobs == 0 {
            return Err("executor.max_parallel_jobs must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scheduler.queue_depth, 8);
        assert_eq!(settings.storage.log_ring_bytes, 1024 * 1024);
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let mut settings = Settings::default();
        settings.scheduler.queue_depth = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_storage_paths_derive_from_base_dir() {
        let mut settings = Settings::default();
        settings.storage.base_dir = PathBuf::from("/var/lib/gagos");
        assert_eq!(
            settings.storage.seal_key_path(),
            PathBuf::from("/var/lib/gagos/keys/seal.key")
        );
        assert_eq!(
            settings.storage.logs_dir(),
            PathBuf::from("/var/lib/gagos/logs")
        );
    }

    #[test]
    fn test_cluster_runtime_from_env_unset() {
        // GAGOS_RUNTIME is not set in the test environment
        assert_eq!(ClusterRuntime::from_env(), None);
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let settings = Settings::load_from_path("/nonexistent-config-dir");
        // All sections carry serde defaults, so an empty source still loads
        assert!(settings.is_ok());
    }
}
