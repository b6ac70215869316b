use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Shared status vocabulary
// ============================================================================

/// Lifecycle status shared by pipeline runs, freestyle builds, jobs within a
/// run and individual build steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Skipped => "skipped",
        }
    }
}

/// What caused a run or build to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Webhook,
    Cron,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Webhook => "webhook",
            TriggerSource::Cron => "cron",
        }
    }
}

// ============================================================================
// Pipeline (declarative, cluster-executed)
// ============================================================================

/// Pipeline is a declaratively-defined workflow targeted at cluster execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Raw YAML exactly as submitted
    pub yaml: String,
    /// Canonical parsed form of `yaml`
    pub spec: PipelineSpec,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Opaque secret embedded in the webhook URL, distinct from any HMAC secret
    pub webhook_token: String,
    /// Optional HMAC secret verified against X-*-Signature headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    pub total_runs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn webhook_url(&self) -> String {
        format!("/cicd/webhooks/{}/{}", self.id, self.status.webhook_token)
    }
}

/// Canonical parsed pipeline spec. This is the structure the YAML document
/// maps onto and the structure `spec::emit` re-serializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerSpec>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Cron,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub jobs: Vec<JobSpec>,
}

/// One container-level unit within a pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Freestyle jobs (imperative, typically over SSH)
// ============================================================================

/// FreestyleJob is an imperative multi-step workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreestyleJob {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<ScmConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub triggers: JobTriggers,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTriggers {
    #[serde(default)]
    pub webhook_enabled: bool,
    /// Optional HMAC secret for webhook admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// 5-field cron expression, evaluated in UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatus {
    pub webhook_token: String,
    pub total_builds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
}

impl FreestyleJob {
    pub fn webhook_url(&self) -> String {
        format!("/cicd/freestyle/webhook/{}", self.status.webhook_token)
    }
}

/// SCM block: repositories cloned into the workspace before the step loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmConfig {
    pub repositories: Vec<GitRepoSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRepoSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default)]
    pub submodules: bool,
    /// Remove the destination directory before cloning
    #[serde(default)]
    pub clean: bool,
    /// Checkout directory relative to the workspace; defaults to the repo name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

/// Typed job parameter declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Bool,
    Choice,
}

/// Host id value meaning "execute on the controller itself"
pub const LOCAL_HOST_ID: &str = "local";

/// The atomic unit a freestyle job executes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    /// Either the literal "local" or an SSHHost id
    #[serde(default = "default_host_id")]
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_host_id() -> String {
    LOCAL_HOST_ID.to_string()
}

impl BuildStep {
    pub fn is_local(&self) -> bool {
        self.host_id == LOCAL_HOST_ID
    }
}

/// Type-specific step payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Shell { command: String },
    Script { script: String },
    ScpPush { local_path: String, remote_path: String },
    ScpPull { remote_path: String, local_path: String },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Shell { .. } => "shell",
            StepAction::Script { .. } => "script",
            StepAction::ScpPush { .. } => "scp_push",
            StepAction::ScpPull { .. } => "scp_pull",
        }
    }

    /// SCP step types cannot run against the controller itself
    pub fn requires_remote(&self) -> bool {
        matches!(self, StepAction::ScpPush { .. } | StepAction::ScpPull { .. })
    }
}

// ============================================================================
// Runs and builds
// ============================================================================

/// One execution of a Pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    /// Monotonically increasing per pipeline, starting at 1
    pub run_number: i64,
    pub trigger: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Variables snapshotted at trigger time
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    pub status: RunStatus,
    pub jobs: Vec<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Per-job sub-status within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    pub stage: String,
    pub status: RunStatus,
    /// Workload handle returned by the cluster on submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of a FreestyleJob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreestyleBuild {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    /// Monotonically increasing per job, starting at 1
    pub build_number: i64,
    pub trigger: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Parameter values snapshotted at trigger time, after defaulting
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Per-step status record within a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    /// Host name for remote steps; None for local steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Artifacts
// ============================================================================

/// A file captured from a run for later download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    /// Blob path relative to the artifact root: `<artifact_id>/<basename>`
    pub path: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Credentials
// ============================================================================

/// Test outcome recorded on credential records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    Failed,
}

/// Credential record for a reachable SSH host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshHost {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Sealed JSON-encoded SshSecret; never exposed through the read API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_secret: Option<String>,
    /// Optional SHA-256 host key fingerprint pin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuthMethod {
    Password,
    Key,
}

/// Plaintext payload sealed into SshHost::sealed_secret
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshSecret {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Sanitized projection used by every read API response
#[derive(Debug, Clone, Serialize)]
pub struct SshHostView {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: SshAuthMethod,
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SshHost> for SshHostView {
    fn from(host: &SshHost) -> Self {
        Self {
            id: host.id,
            name: host.name.clone(),
            host: host.host.clone(),
            port: host.port,
            username: host.username.clone(),
            auth_method: host.auth_method,
            groups: host.groups.clone(),
            description: host.description.clone(),
            fingerprint: host.fingerprint.clone(),
            test_status: host.test_status,
            last_tested_at: host.last_tested_at,
            created_at: host.created_at,
            updated_at: host.updated_at,
        }
    }
}

/// Credential record for Git remotes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: Uuid,
    pub name: String,
    pub auth_method: GitAuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Sealed JSON-encoded GitSecret; never exposed through the read API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitAuthMethod {
    Token,
    Password,
    SshKey,
}

/// Plaintext payload sealed into GitCredential::sealed_secret
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitSecret {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Sanitized projection used by every read API response
#[derive(Debug, Clone, Serialize)]
pub struct GitCredentialView {
    pub id: Uuid,
    pub name: String,
    pub auth_method: GitAuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GitCredential> for GitCredentialView {
    fn from(cred: &GitCredential) -> Self {
        Self {
            id: cred.id,
            name: cred.name.clone(),
            auth_method: cred.auth_method,
            username: cred.username.clone(),
            description: cred.description.clone(),
            test_status: cred.test_status,
            last_tested_at: cred.last_tested_at,
            created_at: cred.created_at,
            updated_at: cred.updated_at,
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Outbound webhook subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub url: String,
    /// HMAC secret; the body is signed when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub events: Vec<NotifyEvent>,
    /// Empty scope lists match every target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_ids: Vec<Uuid>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Webhook,
}

/// Lifecycle event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    RunStarted,
    RunSucceeded,
    RunFailed,
    RunCancelled,
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    BuildCancelled,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::RunStarted => "run_started",
            NotifyEvent::RunSucceeded => "run_succeeded",
            NotifyEvent::RunFailed => "run_failed",
            NotifyEvent::RunCancelled => "run_cancelled",
            NotifyEvent::BuildStarted => "build_started",
            NotifyEvent::BuildSucceeded => "build_succeeded",
            NotifyEvent::BuildFailed => "build_failed",
            NotifyEvent::BuildCancelled => "build_cancelled",
        }
    }
}
