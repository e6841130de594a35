//! Pipeline controller: drains both encoders into the muxer and tears the
//! session down in dependency order.

mod backend;
mod controller;
mod signal;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use backend::{DisplayMetrics, MediaBackend, SoftwareBackend};
pub use controller::PipelineController;
pub use signal::AsyncErrorFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Configuring encoders, capture sources and the muxer
    Starting,
    Capturing,
    /// Finalizing after a stop request or end of stream
    Draining,
    Closed,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Capturing => "capturing",
            PipelineState::Draining => "draining",
            PipelineState::Closed => "closed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why the capture loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StopRequested,
    EndOfStream,
    SetupFailed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReport {
    pub track: Option<usize>,
    pub samples_written: u64,
    pub bytes_written: u64,
    /// Samples discarded before the muxer started or by the timestamp guard
    pub samples_dropped: u64,
    pub first_pts_us: Option<u64>,
    pub last_pts_us: Option<u64>,
    pub end_of_stream: bool,
}

/// Outcome of one session, produced after teardown completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub state: PipelineState,
    pub stop_reason: StopReason,
    /// Set only when a finalized container was written
    pub output_path: Option<PathBuf>,
    pub muxer_started: bool,
    pub video: StreamReport,
    pub audio: StreamReport,
    pub audio_buffers_captured: u64,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}
