//! Recording sessions and their lifecycle
//!
//! - `SessionConfig`: the immutable parameters of one session
//! - `RecordingSession`: one pipeline controller running on a blocking worker
//! - `Coordinator`: start/stop/status commands against at most one session

mod config;
mod coordinator;
mod session;
mod stats;

pub use config::SessionConfig;
pub use coordinator::{
    CaptureGrant, Coordinator, CoordinatorEvent, CoordinatorHandle, RecorderStatus, StartOutcome,
};
pub use session::RecordingSession;
pub use stats::SessionStats;
