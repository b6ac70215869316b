use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use common::loghub;
use common::models::Run;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::handlers::logs::{self, LogsResponse, TailQuery};
use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CancelAccepted {
    pub id: Uuid,
    pub cancel_requested: bool,
}

#[tracing::instrument(skip(state))]
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<Run>> {
    let mut runs = state.controller.store.runs().list();
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(runs)
}

#[tracing::instrument(skip(state))]
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ErrorResponse> {
    let run = state
        .controller
        .store
        .runs()
        .get(id)
        .map_err(error_response)?;
    Ok(Json(run))
}

/// Request cancellation; executors observe the signal at the next boundary
#[tracing::instrument(skip(state))]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelAccepted>), ErrorResponse> {
    // Unknown ids are a 404; an already-terminal run accepts the request
    // idempotently and changes nothing
    state
        .controller
        .store
        .runs()
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
pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ErrorResponse> {
    state.controller.delete_run(id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
pub async fn job_logs(
    State(state): State<AppState>,
    Path((id, job)): Path<(Uuid, String)>,
    Query(query): Query<TailQuery>,
) -> Result<Json<LogsResponse>, ErrorResponse> {
    state
        .controller
        .store
        .runs()
        .get(id)
        .map_err(error_response)?;
    let key = loghub::run_job_key(id, &job);
    match logs::tail_lines(&state.controller.loghub, &key, query.tail) {
        Some(response) => Ok(Json(response)),
        None => Err(ErrorResponse::new(
            "NOT_FOUND",
            format!("no logs for job '{}' of run {}", job, id),
        )),
    }
}

#[tracing::instrument(skip(state, ws))]
pub async fn job_logs_stream(
    State(state): State<AppState>,
    Path((id, job)): Path<(Uuid, String)>,
    ws: WebSocketUpgrade,
) -> Result<Response, ErrorResponse> {
    state
        .controller
        .store
        .runs()
        .get(id)
        .map_err(error_response)?;
    let key = loghub::run_job_key(id, &job);
    logs::stream(Arc::clone(&state.controller.loghub), key, ws).ok_or_else(|| {
        ErrorResponse::new(
            "NOT_FOUND",
            format!("no logs for job '{}' of run {}", job, id),
        )
    })
}
