use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common::models::{Pipeline, PipelineSpec, Run, RunStatus, TriggerSource};
use common::{badge, spec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PipelineYamlRequest {
    pub yaml: String,
    /// Optional HMAC secret verified on inbound webhook calls. Omitted on
    /// update, the stored secret is kept.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PipelineCreated {
    pub id: Uuid,
    pub name: String,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
}

/// Read projection; the webhook token only appears embedded in the URL and
/// the HMAC secret never leaves the store
#[derive(Debug, Serialize)]
pub struct PipelineView {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub yaml: String,
    pub spec: PipelineSpec,
    pub webhook_url: String,
    pub total_runs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Pipeline> for PipelineView {
    fn from(p: &Pipeline) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            description: p.description.clone(),
            yaml: p.yaml.clone(),
            spec: p.spec.clone(),
            webhook_url: p.webhook_url(),
            total_runs: p.status.total_runs,
            last_run_id: p.status.last_run_id,
            last_run_status: p.status.last_run_status,
            last_run_at: p.status.last_run_at,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRunRequest {
    #[serde(default)]
    pub variables: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
    pub run_number: i64,
    pub status: RunStatus,
}

#[tracing::instrument(skip(state, body))]
pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(body): Json<PipelineYamlRequest>,
) -> Result<(StatusCode, Json<PipelineCreated>), ErrorResponse> {
    let mut pipeline = spec::new_pipeline(&body.yaml).map_err(error_response)?;
    pipeline.status.webhook_secret = body.webhook_secret;
    state
        .controller
        .store
        .pipelines()
        .insert(pipeline.clone())
        .map_err(error_response)?;
    state
        .controller
        .cron
        .register_pipeline(&pipeline)
        .map_err(error_response)?;
    tracing::info!(pipeline = %pipeline.name, id = %pipeline.id, "Pipeline created");
    Ok((
        StatusCode::CREATED,
        Json(PipelineCreated {
            id: pipeline.id,
            name: pipeline.name.clone(),
            webhook_url: pipeline.webhook_url(),
            created_at: pipeline.created_at,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineView>> {
    let mut pipelines = state.controller.store.pipelines().list();
    pipelines.sort_by(|a, b| a.name.cmp(&b.name));
    Json(pipelines.iter().map(PipelineView::from).collect())
}

#[tracing::instrument(skip(state))]
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineView>, ErrorResponse> {
    let pipeline = state
        .controller
        .store
        .pipelines()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(PipelineView::from(&pipeline)))
}

/// Re-parse updated YAML onto the pipeline, preserving id, counters and the
/// webhook token
#[tracing::instrument(skip(state, body))]
pub async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PipelineYamlRequest>,
) -> Result<Json<PipelineView>, ErrorResponse> {
    let existing = state
        .controller
        .store
        .pipelines()
        .get(id)
        .map_err(error_response)?;
    let mut updated = spec::update_pipeline(&existing, &body.yaml).map_err(error_response)?;
    if let Some(secret) = body.webhook_secret {
        updated.status.webhook_secret = Some(secret);
    }
    state
        .controller
        .store
        .pipelines()
        .save(updated.clone())
        .map_err(error_response)?;
    state
        .controller
        .cron
        .register_pipeline(&updated)
        .map_err(error_response)?;
    Ok(Json(PipelineView::from(&updated)))
}

#[tracing::instrument(skip(state))]
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state
        .controller
        .delete_pipeline(id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state, body))]
pub async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TriggerRunRequest>>,
) -> Result<(StatusCode, Json<RunAccepted>), ErrorResponse> {
    let variables = body
        .map(|Json(b)| b.variables.unwrap_or_default())
        .unwrap_or_default();
    let run = state
        .controller
        .factory
        .trigger_pipeline(id, variables, TriggerSource::Manual, None, None)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(RunAccepted {
            run_id: run.id,
            run_number: run.run_number,
            status: run.status,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn list_pipeline_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Run>>, ErrorResponse> {
    // 404 for an unknown pipeline rather than an empty list
    state
        .controller
        .store
        .pipelines()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(state.controller.store.runs_for_pipeline(id)))
}

#[tracing::instrument(skip(state))]
pub async fn pipeline_badge(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ErrorResponse> {
    state
        .controller
        .store
        .pipelines()
        .get(id)
        .map_err(error_response)?;
    // The newest run decides the badge, so an in-flight run reads as running
    let status = state
        .controller
        .store
        .runs_for_pipeline(id)
        .first()
        .map(|r| r.status);
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
