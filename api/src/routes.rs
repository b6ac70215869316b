use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Create the application router with all routes and middleware. Session
/// auth is handled by an outer layer; the webhook endpoints are the only
/// routes meant to be reachable without it.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        // Pipelines
        .route("/cicd/pipelines", post(handlers::pipelines::create_pipeline))
        .route("/cicd/pipelines", get(handlers::pipelines::list_pipelines))
        .route("/cicd/pipelines/:id", get(handlers::pipelines::get_pipeline))
        .route("/cicd/pipelines/:id", put(handlers::pipelines::update_pipeline))
        .route(
            "/cicd/pipelines/:id",
            delete(handlers::pipelines::delete_pipeline),
        )
        .route(
            "/cicd/pipelines/:id/trigger",
            post(handlers::pipelines::trigger_pipeline),
        )
        .route(
            "/cicd/pipelines/:id/runs",
            get(handlers::pipelines::list_pipeline_runs),
        )
        .route(
            "/cicd/pipelines/:id/badge",
            get(handlers::pipelines::pipeline_badge),
        )
        // Pipeline runs
        .route("/cicd/runs", get(handlers::runs::list_runs))
        .route("/cicd/runs/:id", get(handlers::runs::get_run))
        .route("/cicd/runs/:id", delete(handlers::runs::delete_run))
        .route("/cicd/runs/:id/cancel", post(handlers::runs::cancel_run))
        .route(
            "/cicd/runs/:id/jobs/:job/logs",
            get(handlers::runs::job_logs),
        )
        .route(
            "/cicd/runs/:id/jobs/:job/logs/stream",
            get(handlers::runs::job_logs_stream),
        )
        // Inbound webhooks (public, token-addressed)
        .route(
            "/cicd/webhooks/:pipeline_id/:token",
            post(handlers::webhooks::pipeline_webhook),
        )
        .route(
            "/cicd/freestyle/webhook/:token",
            post(handlers::webhooks::freestyle_webhook),
        )
        // Freestyle jobs
        .route("/cicd/freestyle/jobs", post(handlers::freestyle::create_job))
        .route("/cicd/freestyle/jobs", get(handlers::freestyle::list_jobs))
        .route("/cicd/freestyle/jobs/:id", get(handlers::freestyle::get_job))
        .route("/cicd/freestyle/jobs/:id", put(handlers::freestyle::update_job))
        .route(
            "/cicd/freestyle/jobs/:id",
            delete(handlers::freestyle::delete_job),
        )
        .route(
            "/cicd/freestyle/jobs/:id/enable",
            put(handlers::freestyle::enable_job),
        )
        .route(
            "/cicd/freestyle/jobs/:id/disable",
            put(handlers::freestyle::disable_job),
        )
        .route(
            "/cicd/freestyle/jobs/:id/build",
            post(handlers::freestyle::trigger_build),
        )
        .route(
            "/cicd/freestyle/jobs/:id/badge",
            get(handlers::freestyle::job_badge),
        )
        // Freestyle builds
        .route("/cicd/freestyle/builds", get(handlers::freestyle::list_builds))
        .route(
            "/cicd/freestyle/builds/:id",
            get(handlers::freestyle::get_build),
        )
        .route(
            "/cicd/freestyle/builds/:id",
            delete(handlers::freestyle::delete_build),
        )
        .route(
            "/cicd/freestyle/builds/:id/cancel",
            post(handlers::freestyle::cancel_build),
        )
        .route(
            "/cicd/freestyle/builds/:id/logs",
            get(handlers::freestyle::build_logs),
        )
        .route(
            "/cicd/freestyle/builds/:id/logs/stream",
            get(handlers::freestyle::build_logs_stream),
        )
        // Artifacts
        .route("/cicd/artifacts", get(handlers::artifacts::list_artifacts))
        .route(
            "/cicd/artifacts/:id/download",
            get(handlers::artifacts::download_artifact),
        )
        .route(
            "/cicd/artifacts/:id",
            delete(handlers::artifacts::delete_artifact),
        )
        // SSH hosts
        .route("/cicd/ssh-hosts", post(handlers::ssh_hosts::create_host))
        .route("/cicd/ssh-hosts", get(handlers::ssh_hosts::list_hosts))
        .route("/cicd/ssh-hosts/:id", get(handlers::ssh_hosts::get_host))
        .route("/cicd/ssh-hosts/:id", put(handlers::ssh_hosts::update_host))
        .route(
            "/cicd/ssh-hosts/:id",
            delete(handlers::ssh_hosts::delete_host),
        )
        .route("/cicd/ssh-hosts/:id/test", post(handlers::ssh_hosts::test_host))
        // Git credentials
        .route(
            "/cicd/git-credentials",
            post(handlers::git_credentials::create_credential),
        )
        .route(
            "/cicd/git-credentials",
            get(handlers::git_credentials::list_credentials),
        )
        .route(
            "/cicd/git-credentials/:id",
            get(handlers::git_credentials::get_credential),
        )
        .route(
            "/cicd/git-credentials/:id",
            put(handlers::git_credentials::update_credential),
        )
        .route(
            "/cicd/git-credentials/:id",
            delete(handlers::git_credentials::delete_credential),
        )
        .route(
            "/cicd/git-credentials/:id/test",
            post(handlers::git_credentials::test_credential),
        )
        // Notifications
        .route(
            "/cicd/notifications",
            post(handlers::notifications::create_notification),
        )
        .route(
            "/cicd/notifications",
            get(handlers::notifications::list_notifications),
        )
        .route(
            "/cicd/notifications/:id",
            get(handlers::notifications::get_notification),
        )
        .route(
            "/cicd/notifications/:id",
            put(handlers::notifications::update_notification),
        )
        .route(
            "/cicd/notifications/:id",
            delete(handlers::notifications::delete_notification),
        )
        .route(
            "/cicd/notifications/:id/test",
            post(handlers::notifications::test_notification),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
