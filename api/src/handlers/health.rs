use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cluster_runtime: bool,
    pub pipelines: usize,
    pub jobs: usize,
}

#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cluster_runtime: state.controller.engine.cluster_available(),
        pipelines: state.controller.store.pipelines().len(),
        jobs: state.controller.store.jobs().len(),
    })
}

/// Prometheus text exposition
#[tracing::instrument(skip(state))]
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
