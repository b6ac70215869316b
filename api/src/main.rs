use anyhow::Result;
use api::{create_router, AppState};
use common::config::{ClusterRuntime, Settings};
use common::{supervisor, telemetry};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    telemetry::init_tracing(&settings.observability)?;
    let metrics = telemetry::init_metrics()?;

    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        base_dir = %settings.storage.base_dir.display(),
        "Starting controller"
    );

    // The cluster backend is a collaborator wired in by the deployment; the
    // stock binary only reports whether one was requested
    let cluster = match ClusterRuntime::from_env() {
        Some(runtime) => {
            tracing::warn!(
                runtime = ?runtime,
                "GAGOS_RUNTIME set but no cluster backend is linked into this build; \
                 pipeline execution stays unavailable"
            );
            None
        }
        None => {
            tracing::info!("GAGOS_RUNTIME unset, cluster executor unavailable");
            None
        }
    };

    let controller = Arc::new(supervisor::boot(settings.clone(), cluster).await?);
    let state = AppState::new(Arc::clone(&controller), metrics);
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(controller))
        .await?;
    Ok(())
}

async fn shutdown_signal(controller: Arc<common::supervisor::Controller>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
    controller.shutdown();
}
