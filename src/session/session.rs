use super::config::SessionConfig;
use super::stats::SessionStats;
use crate::pipeline::{MediaBackend, PipelineController, PipelineState, SessionReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A running recording: one pipeline controller on a blocking worker.
///
/// The session only controls the pipeline's existence. Stopping is
/// cooperative; the controller finishes teardown on its own thread and
/// [`wait`](Self::wait) yields the final statistics.
pub struct RecordingSession {
    /// Session identifier
    id: String,

    /// Session configuration
    config: SessionConfig,

    /// When the session started
    started_at: DateTime<Utc>,

    /// Stop request shared with the controller
    cancel: CancellationToken,

    /// Live pipeline state
    state: watch::Receiver<PipelineState>,

    /// Handle for the controller's run loop
    task: Option<JoinHandle<SessionReport>>,

    /// Set once the run loop has been joined
    stats: Option<SessionStats>,
}

impl RecordingSession {
    /// Start a session. Must be called from within a tokio runtime.
    pub fn start(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let id = format!("rec-{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        let controller = PipelineController::new(config.clone(), backend, cancel.clone());
        Self::spawn(id, config, controller, cancel)
    }

    fn spawn(
        id: String,
        config: SessionConfig,
        controller: PipelineController,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            "Starting recording session {} -> {}",
            id,
            config.output_path.display()
        );

        let state = controller.subscribe_state();
        let task = tokio::task::spawn_blocking(move || controller.run());

        Self {
            id,
            config,
            started_at: Utc::now(),
            cancel,
            state,
            task: Some(task),
            stats: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    /// Request a graceful stop; returns immediately
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stop requested for session {}", self.id);
            self.cancel.cancel();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for teardown to complete.
    ///
    /// Cancel-safe; may be called again after completion.
    pub async fn wait(&mut self) -> SessionStats {
        if let Some(task) = self.task.as_mut() {
            let stats = match task.await {
                Ok(report) => SessionStats::from_report(&self.id, self.started_at, &report),
                Err(e) => {
                    error!("Pipeline for session {} panicked: {}", self.id, e);
                    SessionStats::aborted(&self.id, self.started_at, e.to_string())
                }
            };
            self.task = None;
            self.stats = Some(stats);
        }

        match &self.stats {
            Some(stats) => stats.clone(),
            None => SessionStats::aborted(&self.id, self.started_at, "session never ran"),
        }
    }

    /// Stop and wait for teardown
    pub async fn stop_and_wait(mut self) -> SessionStats {
        self.stop();
        self.wait().await
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        // An abandoned session must still tear down its pipeline
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}
