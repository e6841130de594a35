use crate::pipeline::{PipelineState, SessionReport, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Statistics about a finished recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// When the recording started
    pub started_at: DateTime<Utc>,

    pub ended_at: DateTime<Utc>,

    /// Wall time from setup to the end of teardown, in seconds
    pub duration_secs: f64,

    pub state: PipelineState,

    pub stop_reason: StopReason,

    /// Finalized container, if one was written
    pub output_path: Option<PathBuf>,

    pub video_samples: u64,

    pub audio_samples: u64,

    /// Samples discarded on either stream
    pub samples_dropped: u64,

    /// Total payload bytes written to the container
    pub bytes_written: u64,

    pub error: Option<String>,
}

impl SessionStats {
    pub fn from_report(
        session_id: &str,
        started_at: DateTime<Utc>,
        report: &SessionReport,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at,
            ended_at: Utc::now(),
            duration_secs: report.elapsed_ms as f64 / 1000.0,
            state: report.state,
            stop_reason: report.stop_reason,
            output_path: report.output_path.clone(),
            video_samples: report.video.samples_written,
            audio_samples: report.audio.samples_written,
            samples_dropped: report.video.samples_dropped + report.audio.samples_dropped,
            bytes_written: report.video.bytes_written + report.audio.bytes_written,
            error: report.error.clone(),
        }
    }

    /// Stats for a session whose run loop never returned a report
    pub fn aborted(session_id: &str, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        let ended_at = Utc::now();
        Self {
            session_id: session_id.to_string(),
            started_at,
            ended_at,
            duration_secs: ended_at.signed_duration_since(started_at).num_milliseconds() as f64
                / 1000.0,
            state: PipelineState::Failed,
            stop_reason: StopReason::Error,
            output_path: None,
            video_samples: 0,
            audio_samples: 0,
            samples_dropped: 0,
            bytes_written: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == PipelineState::Failed
    }
}
