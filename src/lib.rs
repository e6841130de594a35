pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod mux;
pub mod pipeline;
pub mod session;
pub mod sizing;
pub mod timing;

pub use config::Config;
pub use error::{RecorderError, RecorderResult};
pub use http::{create_router, AppState};
pub use mux::{Container, ContainerMuxer, ContainerReader, MediaMuxer};
pub use pipeline::{
    MediaBackend, PipelineController, PipelineState, SessionReport, SoftwareBackend, StopReason,
};
pub use session::{
    CaptureGrant, Coordinator, CoordinatorEvent, CoordinatorHandle, RecorderStatus,
    RecordingSession, SessionConfig, SessionStats, StartOutcome,
};
pub use timing::PresentationClock;
