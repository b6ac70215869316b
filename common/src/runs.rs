// Run factory: allocates run/build numbers, snapshots inputs, persists the
// pending record and hands the work to the matching per-target queue. The
// pending record is only created once a queue slot is reserved, so a Busy
// rejection leaves nothing behind.

use crate::errors::TriggerError;
use crate::models::{
    FreestyleBuild, FreestyleJob, JobState, ParameterKind, Run, RunStatus, StepResult,
    TriggerSource,
};
use crate::scheduler::{CancelRegistry, TargetId, TargetQueues, Work};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct RunFactory {
    store: Arc<Store>,
    queues: Arc<TargetQueues>,
    cancels: Arc<CancelRegistry>,
    cluster_available: bool,
}

impl RunFactory {
    pub fn new(
        store: Arc<Store>,
        queues: Arc<TargetQueues>,
        cancels: Arc<CancelRegistry>,
        cluster_available: bool,
    ) -> Self {
        Self {
            store,
            queues,
            cancels,
            cluster_available,
        }
    }

    /// Create a pending Run for a pipeline and enqueue it
    #[instrument(skip(self, variables))]
    pub async fn trigger_pipeline(
        &self,
        pipeline_id: Uuid,
        variables: HashMap<String, String>,
        trigger: TriggerSource,
        trigger_user: Option<String>,
        commit: Option<String>,
    ) -> Result<Run, TriggerError> {
        let pipeline = self.store.pipelines().get(pipeline_id)?;
        if !self.cluster_available {
            return Err(TriggerError::ClusterUnavailable);
        }

        // Spec variables first, trigger-supplied values override
        let mut snapshot = pipeline.spec.variables.clone();
        snapshot.extend(variables);

        let jobs: Vec<JobState> = pipeline
            .spec
            .stages
            .iter()
            .flat_map(|stage| {
                stage.jobs.iter().map(|job| JobState {
                    name: job.name.clone(),
                    stage: stage.name.clone(),
                    status: RunStatus::Pending,
                    workload: None,
                    reason: None,
                    started_at: None,
                    finished_at: None,
                })
            })
            .collect();

        let store = Arc::clone(&self.store);
        let cancels = Arc::clone(&self.cancels);
        let target = TargetId::Pipeline(pipeline_id);
        let pipeline_name = pipeline.name.clone();
        let work = self
            .queues
            .submit(target, move || {
                let run_number = store.next_run_number(pipeline_id)?;
                let run = Run {
                    id: Uuid::new_v4(),
                    pipeline_id,
                    pipeline_name,
                    run_number,
                    trigger,
                    trigger_user,
                    commit,
                    variables: snapshot,
                    status: RunStatus::Pending,
                    jobs,
                    reason: None,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    duration_ms: None,
                };
                store.runs().insert(run.clone())?;
                let cancel = cancels.register(run.id);
                Ok(Work {
                    target,
                    id: run.id,
                    cancel,
                })
            })
            .await?;

        metrics::counter!("gagos_runs_created_total").increment(1);
        info!(run_id = %work.id, pipeline_id = %pipeline_id, trigger = trigger.as_str(), "Run created");
        self.store
            .runs()
            .get(work.id)
            .map_err(TriggerError::Store)
    }

    /// Create a pending FreestyleBuild for a job and enqueue it
    #[instrument(skip(self, parameters))]
    pub async fn trigger_job(
        &self,
        job_id: Uuid,
        parameters: HashMap<String, String>,
        trigger: TriggerSource,
        trigger_user: Option<String>,
        commit: Option<String>,
    ) -> Result<FreestyleBuild, TriggerError> {
        let job = self.store.jobs().get(job_id)?;
        if !job.enabled {
            return Err(TriggerError::Disabled);
        }
        let resolved = resolve_parameters(&job, &parameters)?;

        let steps: Vec<StepResult> = job
            .steps
            .iter()
            .map(|step| StepResult {
                name: step.name.clone(),
                host: None,
                status: RunStatus::Pending,
                exit_code: None,
                reason: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let store = Arc::clone(&self.store);
        let cancels = Arc::clone(&self.cancels);
        let target = TargetId::Job(job_id);
        let job_name = job.name.clone();
        let work = self
            .queues
            .submit(target, move || {
                let build_number = store.next_build_number(job_id)?;
                let build = FreestyleBuild {
                    id: Uuid::new_v4(),
                    job_id,
                    job_name,
                    build_number,
                    trigger,
                    trigger_user,
                    commit,
                    parameters: resolved,
                    status: RunStatus::Pending,
                    steps,
                    reason: None,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    duration_ms: None,
                };
                store.builds().insert(build.clone())?;
                let cancel = cancels.register(build.id);
                Ok(Work {
                    target,
                    id: build.id,
                    cancel,
                })
            })
            .await?;

        metrics::counter!("gagos_builds_created_total").increment(1);
        info!(build_id = %work.id, job_id = %job_id, trigger = trigger.as_str(), "Build created");
        self.store
            .builds()
            .get(work.id)
            .map_err(TriggerError::Store)
    }
}

/// Check supplied parameter values against the declarations and fill in
/// defaults. Unknown supplied keys pass through untouched.
fn resolve_parameters(
    job: &FreestyleJob,
    supplied: &HashMap<String, String>,
) -> Result<HashMap<String, String>, TriggerError> {
    let mut resolved = supplied.clone();
    for param in &job.parameters {
        match resolved.get(&param.name) {
            Some(value) => match param.kind {
                ParameterKind::Bool => {
                    if value != "true" && value != "false" {
                        return Err(TriggerError::InvalidParameter {
                            name: param.name.clone(),
                            reason: format!("expected true or false, got '{}'", value),
                        });
                    }
                }
                ParameterKind::Choice => {
                    if !param.choices.iter().any(|c| c == value) {
                        return Err(TriggerError::InvalidParameter {
                            name: param.name.clone(),
                            reason: format!(
                                "'{}' is not one of [{}]",
                                value,
                                param.choices.join(", ")
                            ),
                        });
                    }
                }
                ParameterKind::String => {}
            },
            None => match (&param.default, param.required) {
                (Some(default), _) => {
                    resolved.insert(param.name.clone(), default.clone());
                }
                (None, true) => {
                    return Err(TriggerError::MissingParameter(param.name.clone()));
                }
                (None, false) => {}
            },
        }
    }
    Ok(resolved)
}
