// Telemetry: structured logging via tracing-subscriber and a Prometheus
// metrics recorder served by the API's /metrics endpoint.

use crate::config::ObservabilityConfig;
use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber. RUST_LOG wins over the configured
/// level; JSON formatting is a config switch.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    if config.log_json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_filter(env_filter);
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("init tracing: {}", e))?;
    } else {
        let layer = fmt::layer().with_target(true).with_filter(env_filter);
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("init tracing: {}", e))?;
    }

    tracing::info!(log_level = %config.log_level, json = config.log_json, "Logging initialized");
    Ok(())
}

/// Install the global Prometheus recorder and hand back the render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("install metrics recorder: {}", e))?;
    Ok(handle)
}
