use common::supervisor::Controller;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub metrics: PrometheusHandle,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("controller", &"<Controller>")
            .field("metrics", &"<PrometheusHandle>")
            .finish()
    }
}

impl AppState {
    pub fn new(controller: Arc<Controller>, metrics: PrometheusHandle) -> Self {
        Self {
            controller,
            metrics,
        }
    }
}
