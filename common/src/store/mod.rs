// Single-writer persistent store for every entity kind, rooted at the
// configured base directory:
//
//   pipelines/<id>.json        jobs/<id>.json         runs/<id>.json
//   builds/<id>.json           ssh_hosts/<id>.json    git_credentials/<id>.json
//   notifications/<id>.json    artifacts/metadata/<id>.json
//
// Counter allocation (run/build numbers) happens under the parent kind's
// writer lock so numbers are unique and monotonic per parent.

mod collection;

pub use collection::{Collection, Entity};

use crate::errors::StoreError;
use crate::models::{
    Artifact, FreestyleBuild, FreestyleJob, GitCredential, NotificationConfig, Pipeline, Run,
    SshHost,
};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

impl Entity for Pipeline {
    const KIND: &'static str = "pipelines";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Entity for FreestyleJob {
    const KIND: &'static str = "jobs";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Entity for Run {
    const KIND: &'static str = "runs";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for FreestyleBuild {
    const KIND: &'static str = "builds";

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for SshHost {
    const KIND: &'static str = "ssh_hosts";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Entity for GitCredential {
    const KIND: &'static str = "git_credentials";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Entity for NotificationConfig {
    const KIND: &'static str = "notifications";

    fn id(&self) -> Uuid {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Entity for Artifact {
    const KIND: &'static str = "artifacts/metadata";

    fn id(&self) -> Uuid {
        self.id
    }
}

pub struct Store {
    base_dir: PathBuf,
    pipelines: Collection<Pipeline>,
    jobs: Collection<FreestyleJob>,
    runs: Collection<Run>,
    builds: Collection<FreestyleBuild>,
    ssh_hosts: Collection<SshHost>,
    git_credentials: Collection<GitCredential>,
    notifications: Collection<NotificationConfig>,
    artifacts: Collection<Artifact>,
}

impl Store {
    /// Open the store, creating kind directories as needed and loading every
    /// record into memory. Subsequent reads never touch disk.
    pub fn open(base_dir: &Path) -> Result<Self, StoreError> {
        let store = Self {
            base_dir: base_dir.to_path_buf(),
            pipelines: Collection::open(base_dir)?,
            jobs: Collection::open(base_dir)?,
            runs: Collection::open(base_dir)?,
            builds: Collection::open(base_dir)?,
            ssh_hosts: Collection::open(base_dir)?,
            git_credentials: Collection::open(base_dir)?,
            notifications: Collection::open(base_dir)?,
            artifacts: Collection::open(base_dir)?,
        };
        info!(
            base_dir = %base_dir.display(),
            pipelines = store.pipelines.len(),
            jobs = store.jobs.len(),
            runs = store.runs.len(),
            builds = store.builds.len(),
            "Store opened"
        );
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn pipelines(&self) -> &Collection<Pipeline> {
        &self.pipelines
    }

    pub fn jobs(&self) -> &Collection<FreestyleJob> {
        &self.jobs
    }

    pub fn runs(&self) -> &Collection<Run> {
        &self.runs
    }

    pub fn builds(&self) -> &Collection<FreestyleBuild> {
        &self.builds
    }

    pub fn ssh_hosts(&self) -> &Collection<SshHost> {
        &self.ssh_hosts
    }

    pub fn git_credentials(&self) -> &Collection<GitCredential> {
        &self.git_credentials
    }

    pub fn notifications(&self) -> &Collection<NotificationConfig> {
        &self.notifications
    }

    pub fn artifacts(&self) -> &Collection<Artifact> {
        &self.artifacts
    }

    // ------------------------------------------------------------------
    // Secondary indexes
    // ------------------------------------------------------------------

    /// Runs owned by a pipeline, newest first
    pub fn runs_for_pipeline(&self, pipeline_id: Uuid) -> Vec<Run> {
        let mut runs = self.runs.filter(|r| r.pipeline_id == pipeline_id);
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));
        runs
    }

    /// Builds owned by a job, newest first
    pub fn builds_for_job(&self, job_id: Uuid) -> Vec<FreestyleBuild> {
        let mut builds = self.builds.filter(|b| b.job_id == job_id);
        builds.sort_by(|a, b| b.build_number.cmp(&a.build_number));
        builds
    }

    /// Artifact records captured from a run
    pub fn artifacts_for_run(&self, run_id: Uuid) -> Vec<Artifact> {
        self.artifacts.filter(|a| a.run_id == run_id)
    }

    /// Artifact records across every run of a pipeline
    pub fn artifacts_for_pipeline(&self, pipeline_id: Uuid) -> Vec<Artifact> {
        self.artifacts.filter(|a| a.pipeline_id == pipeline_id)
    }

    /// Freestyle job addressed by webhook token. Tokens are high-entropy and
    /// compared in constant time so lookups leak nothing about near-misses.
    pub fn job_by_webhook_token(&self, token: &str) -> Option<FreestyleJob> {
        self.jobs
            .find(|j| crate::webhook::constant_time_eq(j.status.webhook_token.as_bytes(), token.as_bytes()))
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Allocate the next run number for a pipeline. The increment and the
    /// write-back happen under the pipeline kind's writer lock.
    pub fn next_run_number(&self, pipeline_id: Uuid) -> Result<i64, StoreError> {
        let updated = self
            .pipelines
            .update_with(pipeline_id, |p| p.status.total_runs += 1)?;
        Ok(updated.status.total_runs)
    }

    /// Allocate the next build number for a freestyle job
    pub fn next_build_number(&self, job_id: Uuid) -> Result<i64, StoreError> {
        let updated = self
            .jobs
            .update_with(job_id, |j| j.status.total_builds += 1)?;
        Ok(updated.status.total_builds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineSpec, PipelineStatus, RunStatus, TriggerSource};
    use chrono::Utc;
    use std::collections::HashMap;

    fn pipeline(name: &str) -> Pipeline {
        let now = Utc::now();
        Pipeline {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            yaml: String::new(),
            spec: PipelineSpec {
                name: name.to_string(),
                description: None,
                variables: HashMap::new(),
                triggers: Vec::new(),
                stages: Vec::new(),
            },
            status: PipelineStatus {
                webhook_token: format!("token-{}", name),
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    fn run(pipeline: &Pipeline, number: i64) -> Run {
        Run {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            run_number: number,
            trigger: TriggerSource::Manual,
            trigger_user: None,
            commit: None,
            variables: HashMap::new(),
            status: RunStatus::Pending,
            jobs: Vec::new(),
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    #[test]
    fn test_run_numbers_monotonic_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let p = pipeline("release");
        store.pipelines().insert(p.clone()).unwrap();

        for expected in 1..=5 {
            assert_eq!(store.next_run_number(p.id).unwrap(), expected);
        }
        assert_eq!(store.pipelines().get(p.id).unwrap().status.total_runs, 5);
    }

    #[test]
    fn test_runs_for_pipeline_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let p = pipeline("release");
        store.pipelines().insert(p.clone()).unwrap();
        for n in 1..=3 {
            store.runs().insert(run(&p, n)).unwrap();
        }
        let runs = store.runs_for_pipeline(p.id);
        let numbers: Vec<i64> = runs.iter().map(|r| r.run_number).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[test]
    fn test_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline("release");
        {
            let store = Store::open(dir.path()).unwrap();
            store.pipelines().insert(p.clone()).unwrap();
            store.next_run_number(p.id).unwrap();
            store.next_run_number(p.id).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.next_run_number(p.id).unwrap(), 3);
    }
}
