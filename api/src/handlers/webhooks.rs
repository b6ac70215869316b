// Public webhook endpoints: the only session-free routes. Admission logic
// lives in the gateway; this layer extracts headers and maps errors.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use common::webhook::SIGNATURE_HEADERS;
use uuid::Uuid;

use crate::handlers::freestyle::BuildAccepted;
use crate::handlers::pipelines::RunAccepted;
use crate::handlers::{error_response, ErrorResponse};
use crate::state::AppState;

/// First recognized signature header, in precedence order
fn signature_from(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn pipeline_webhook(
    State(state): State<AppState>,
    Path((pipeline_id, token)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<RunAccepted>), ErrorResponse> {
    let signature = signature_from(&headers);
    let run = state
        .controller
        .gateway
        .admit_pipeline(pipeline_id, &token, signature, &body)
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

#[tracing::instrument(skip(state, headers, body))]
pub async fn freestyle_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<BuildAccepted>), ErrorResponse> {
    let signature = signature_from(&headers);
    let build = state
        .controller
        .gateway
        .admit_job(&token, signature, &body)
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
