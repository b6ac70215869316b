// API crate: axum router and handlers over the engine. Exposed as a library
// so the integration tests can drive the real router in-process.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
