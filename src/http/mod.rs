//! HTTP command surface for the lifecycle coordinator
//!
//! - POST /recording/start - Start a recording (no-op if one is active)
//! - POST /recording/stop - Request a graceful stop
//! - GET /recording/status - Current recording status
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
