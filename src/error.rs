//! Error kinds shared by the capture pipeline.

use thiserror::Error;

use crate::codec::CodecError;
use crate::mux::MuxError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures that end a recording session.
///
/// Every variant funnels into the same finalize path; none is retried.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Codec or device configuration failed before capture began
    #[error("Setup failed while {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    /// A producer failed outside the controller's call stack
    #[error("Asynchronous stream failure: {0}")]
    AsyncStream(String),

    /// An encoder broke the output protocol (e.g. announced its format twice)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Muxer error: {0}")]
    Mux(#[from] MuxError),
}

impl RecorderError {
    pub fn setup(stage: &'static str, source: impl Into<BoxError>) -> Self {
        RecorderError::Setup {
            stage,
            source: source.into(),
        }
    }

    pub fn is_setup_failure(&self) -> bool {
        matches!(self, RecorderError::Setup { .. })
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;
