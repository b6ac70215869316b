use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common::models::{
    BuildStep, FreestyleBuild, FreestyleJob, JobStatus, JobTriggers, ParameterSpec, RunStatus,
    ScmConfig, TriggerSource,
};
use common::{badge, loghub, schedule, webhook};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::logs::{self, LogsResponse, TailQuery};
use crate::handlers::runs::CancelAccepted;
use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scm: Option<ScmConfig>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub triggers: JobTriggers,
}

fn default_enabled() -> bool {
    true
}

/// Read projection; the webhook HMAC secret stays in the store
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scm: Option<ScmConfig>,
    pub environment: HashMap<String, String>,
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<BuildStep>,
    pub webhook_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub webhook_url: String,
    pub total_builds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&FreestyleJob> for JobView {
    fn from(job: &FreestyleJob) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            description: job.description.clone(),
            enabled: job.enabled,
            scm: job.scm.clone(),
            environment: job.environment.clone(),
            parameters: job.parameters.clone(),
            steps: job.steps.clone(),
            webhook_enabled: job.triggers.webhook_enabled,
            cron: job.triggers.cron.clone(),
            webhook_url: job.webhook_url(),
            total_builds: job.status.total_builds,
            last_build_id: job.status.last_build_id,
            last_build_status: job.status.last_build_status,
            last_build_at: job.status.last_build_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerBuildRequest {
    #[serde(default)]
    pub parameters: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct BuildAccepted {
    pub build_id: Uuid,
    pub build_number: i64,
    pub status: RunStatus,
}

fn validate_job(request: &JobRequest) -> Result<(), ErrorResponse> {
    if request.name.trim().is_empty() {
        return Err(ErrorResponse::new("VALIDATION_ERROR", "name is required"));
    }
    if request.steps.is_empty() {
        return Err(ErrorResponse::new(
            "VALIDATION_ERROR",
            "at least one step is required",
        ));
    }
    for step in &request.steps {
        if step.is_local() && step.action.requires_remote() {
            return Err(ErrorResponse::new(
                "VALIDATION_ERROR",
                format!("step '{}': {} requires a remote host", step.name, step.action.kind()),
            ));
        }
    }
    if let Some(cron) = request.triggers.cron.as_deref() {
        schedule::validate_cron(cron).map_err(error_response)?;
    }
    Ok(())
}

#[tracing::instrument(skip(state, body))]
pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobView>), ErrorResponse> {
    validate_job(&body)?;
    let now = Utc::now();
    let job = FreestyleJob {
        id: Uuid::new_v4(),
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        scm: body.scm,
        environment: body.environment,
        parameters: body.parameters,
        steps: body.steps,
        triggers: body.triggers,
        status: JobStatus {
            webhook_token: webhook::generate_webhook_token(),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
    };
    state
        .controller
        .store
        .jobs()
        .insert(job.clone())
        .map_err(error_response)?;
    state
        .controller
        .cron
        .register_job(&job)
        .map_err(error_response)?;
    tracing::info!(job = %job.name, id = %job.id, "Freestyle job created");
    Ok((StatusCode::CREATED, Json(JobView::from(&job))))
}

#[tracing::instrument(skip(state))]
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    let mut jobs = state.controller.store.jobs().list();
    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    Json(jobs.iter().map(JobView::from).collect())
}

#[tracing::instrument(skip(state))]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ErrorResponse> {
    let job = state
        .controller
        .store
        .jobs()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(JobView::from(&job)))
}

/// Replace the job definition, preserving id, counters and webhook token
#[tracing::instrument(skip(state, body))]
pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<JobRequest>,
) -> Result<Json<JobView>, ErrorResponse> {
    validate_job(&body)?;
    let existing = state
        .controller
        .store
        .jobs()
        .get(id)
        .map_err(error_response)?;
    let JobTriggers {
        webhook_enabled,
        webhook_secret,
        cron,
    } = body.triggers;
    let updated = FreestyleJob {
        id: existing.id,
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        scm: body.scm,
        environment: body.environment,
        parameters: body.parameters,
        steps: body.steps,
        triggers: JobTriggers {
            webhook_enabled,
            // A secret omitted on update keeps its stored value
            webhook_secret: webhook_secret.or(existing.triggers.webhook_secret),
            cron,
        },
        status: existing.status,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    state
        .controller
        .store
        .jobs()
        .save(updated.clone())
        .map_err(error_response)?;
    state
        .controller
        .cron
        .register_job(&updated)
        .map_err(error_response)?;
    Ok(Json(JobView::from(&updated)))
}

#[tracing::instrument(skip(state))]
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state.controller.delete_job(id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
pub async fn enable_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ErrorResponse> {
    set_enabled(&state, id, true).await
}

#[tracing::instrument(skip(state))]
pub async fn disable_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ErrorResponse> {
    set_enabled(&state, id, false).await
}

async fn set_enabled(
    state: &AppState,
    id: Uuid,
    enabled: bool,
) -> Result<Json<JobView>, ErrorResponse> {
    let job = state
        .controller
        .store
        .jobs()
        .update_with(id, |j| {
            j.enabled = enabled;
            j.updated_at = Utc::now();
        })
        .map_err(error_response)?;
    // Registration follows the enabled flag
    state
        .controller
        .cron
        .register_job(&job)
        .map_err(error_response)?;
    Ok(Json(JobView::from(&job)))
}

#[tracing::instrument(skip(state, body))]
pub async fn trigger_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TriggerBuildRequest>>,
) -> Result<(StatusCode, Json<BuildAccepted>), ErrorResponse> {
    let parameters = body
        .map(|Json(b)| b.parameters.unwrap_or_default())
        .unwrap_or_default();
    let build = state
        .controller
        .factory
        .trigger_job(id, parameters, TriggerSource::Manual, None, None)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(BuildAccepted {
            build_id: build.id,
            build_number: build.build_number,
            status: build.status,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct BuildsQuery {
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

#[tracing::instrument(skip(state))]
pub async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<BuildsQuery>,
) -> Json<Vec<FreestyleBuild>> {
    let builds = match query.job_id {
        Some(job_id) => state.controller.store.builds_for_job(job_id),
        None => {
            let mut builds = state.controller.store.builds().list();
            builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            builds
        }
    };
    Json(builds)
}

#[tracing::instrument(skip(state))]
pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FreestyleBuild>, ErrorResponse> {
    let build = state
        .controller
        .store
        .builds()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(build))
}

#[tracing::instrument(skip(state))]
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelAccepted>), ErrorResponse> {
    state
        .controller
        .store
        .builds()
        .get(id)
        .map_err(error_response)?;
    let delivered = state.controller.cancel(id);
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelAccepted {
            id,
            cancel_requested: delivered,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn delete_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state.controller.delete_build(id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
pub async fn build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TailQuery>,
) -> Result<Json<LogsResponse>, ErrorResponse> {
    state
        .controller
        .store
        .builds()
        .get(id)
        .map_err(error_response)?;
    let key = loghub::build_key(id);
    match logs::tail_lines(&state.controller.loghub, &key, query.tail) {
        Some(response) => Ok(Json(response)),
        None => Err(ErrorResponse::new(
            "NOT_FOUND",
            format!("no logs for build {}", id),
        )),
    }
}

#[tracing::instrument(skip(state, ws))]
pub async fn build_logs_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ErrorResponse> {
    state
        .controller
        .store
        .builds()
        .get(id)
        .map_err(error_response)?;
    let key = loghub::build_key(id);
    logs::stream(Arc::clone(&state.controller.loghub), key, ws)
        .ok_or_else(|| ErrorResponse::new("NOT_FOUND", format!("no logs for build {}", id)))
}

#[tracing::instrument(skip(state))]
pub async fn job_badge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ErrorResponse> {
    state
        .controller
        .store
        .jobs()
        .get(id)
        .map_err(error_response)?;
    // The newest build decides the badge, so an in-flight build reads as running
    let status = state
        .controller
        .store
        .builds_for_job(id)
        .first()
        .map(|b| b.status);
    let svg = badge::render(status);
    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        svg,
    )
        .into_response())
}
