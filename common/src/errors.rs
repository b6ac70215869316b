// Error handling framework

use thiserror::Error;

/// Store-related errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pipeline spec parsing and validation errors
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Invalid YAML: {0}")]
    InvalidYaml(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown trigger type: {0}")]
    UnknownTriggerType(String),

    #[error("Cron trigger requires a schedule")]
    CronWithoutSchedule,

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Job '{job}' in stage '{stage}' is missing {field}")]
    IncompleteJob {
        stage: String,
        job: String,
        field: String,
    },

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Dependency cycle involving job '{0}'")]
    DependencyCycle(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJobName(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// Scheduler errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("No next execution time for schedule '{0}'")]
    NoNextExecution(String),
}

/// Run and build execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Cluster operation failed: {0}")]
    ClusterFailed(String),

    #[error("SSH connection failed: {0}")]
    SshConnectionFailed(String),

    #[error("SSH authentication failed: {0}")]
    SshAuthenticationFailed(String),

    #[error("SSH operation failed: {0}")]
    SshOperationFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Git clone failed: {0}")]
    GitCloneFailed(String),

    #[error("Workspace setup failed: {0}")]
    WorkspaceFailed(String),

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Step '{step}' requires a remote host")]
    RemoteHostRequired { step: String },

    #[error("Store failure during execution: {0}")]
    Store(#[from] StoreError),

    #[error("Vault failure during execution: {0}")]
    Vault(#[from] VaultError),
}

/// Errors surfaced when a trigger (manual, webhook, cron) is admitted
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Target queue is full")]
    Busy,

    #[error("Target is disabled")]
    Disabled,

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Cluster runtime is not available")]
    ClusterUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Credential vault errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Sealing failed: {0}")]
    SealFailed(String),

    #[error("Opening sealed payload failed: {0}")]
    OpenFailed(String),

    #[error("Sealing key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("No sealed secret on record")]
    NoSecret,
}

/// Outbound notification errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Transport(String),

    #[error("Retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

/// Inbound webhook admission errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Target not found")]
    TargetNotFound,

    #[error("Invalid webhook token")]
    InvalidToken,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook trigger not enabled for this target")]
    TriggerNotEnabled,

    #[error("Target is disabled")]
    TargetDisabled,

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match err {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::AlreadyExists(_) | StoreError::Conflict(_) => "CONFLICT",
            _ => "STORE_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<SpecError> for ApiError {
    fn from(err: SpecError) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let code = match err {
            ExecutionError::UnknownHost(_) => "NOT_FOUND",
            _ => "EXECUTION_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        let code = match &err {
            TriggerError::Busy => "BUSY",
            TriggerError::Disabled => "FORBIDDEN",
            TriggerError::MissingParameter(_) | TriggerError::InvalidParameter { .. } => {
                "VALIDATION_ERROR"
            }
            TriggerError::ClusterUnavailable => "CLUSTER_UNAVAILABLE",
            TriggerError::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            TriggerError::Store(_) => "STORE_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        ApiError::new("VAULT_ERROR", err.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::TargetNotFound => ApiError::new("NOT_FOUND", err.to_string()),
            WebhookError::InvalidToken | WebhookError::InvalidSignature => {
                ApiError::new("UNAUTHORIZED", err.to_string())
            }
            WebhookError::TriggerNotEnabled | WebhookError::TargetDisabled => {
                ApiError::new("FORBIDDEN", err.to_string())
            }
            WebhookError::Trigger(inner) => inner.into(),
        }
    }
}
