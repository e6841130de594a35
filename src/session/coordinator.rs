use super::config::SessionConfig;
use super::session::RecordingSession;
use super::stats::SessionStats;
use crate::config::RecordingConfig;
use crate::pipeline::MediaBackend;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;

/// Outcome of the host's screen-capture permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureGrant {
    Granted,
    Denied,
}

/// Status event payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub is_recording: bool,
    /// Pausing is not supported by the pipeline; always false
    pub is_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { session_id: String },
    /// A session was already active; nothing was started
    AlreadyRecording { session_id: String },
    PermissionDenied,
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Status(RecorderStatus),
    PermissionDenied,
    SessionEnded(SessionStats),
}

#[derive(Debug)]
enum Command {
    Start {
        grant: CaptureGrant,
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    QueryStatus,
}

/// Holds the single optional recording session and serializes every
/// start/stop/status command against it.
pub struct Coordinator {
    backend: Arc<dyn MediaBackend>,
    recording: RecordingConfig,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<CoordinatorEvent>,
    status: watch::Sender<RecorderStatus>,
    session: Option<RecordingSession>,
}

/// Cloneable command endpoint of a running [`Coordinator`]
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CoordinatorEvent>,
    status: watch::Receiver<RecorderStatus>,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        recording: RecordingConfig,
    ) -> (Self, CoordinatorHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (status_tx, status_rx) = watch::channel(RecorderStatus::default());

        let coordinator = Self {
            backend,
            recording,
            commands: command_rx,
            events: events.clone(),
            status: status_tx,
            session: None,
        };
        let handle = CoordinatorHandle {
            commands: command_tx,
            events,
            status: status_rx,
        };
        (coordinator, handle)
    }

    /// Process commands until every handle is dropped, then stop any
    /// active session and wait for its teardown.
    pub async fn run(mut self) {
        info!("Lifecycle coordinator started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                stats = wait_for(&mut self.session), if self.session.is_some() => {
                    self.session = None;
                    self.session_ended(stats);
                }
            }
        }

        if let Some(session) = self.session.take() {
            info!("Coordinator shutting down; stopping session {}", session.id());
            let stats = session.stop_and_wait().await;
            self.session_ended(stats);
        }
        info!("Lifecycle coordinator stopped");
    }

    fn handle(&mut self, command: Command) {
        debug!("Coordinator command: {:?}", command);
        match command {
            Command::Start { grant, reply } => {
                let outcome = self.start(grant);
                let _ = reply.send(outcome);
            }
            Command::Stop { reply } => {
                let stopping = match &self.session {
                    Some(session) if !session.is_stop_requested() => {
                        session.stop();
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(stopping);
            }
            Command::QueryStatus => {
                let status = self.current_status();
                self.status.send_replace(status);
                self.emit(CoordinatorEvent::Status(status));
            }
        }
    }

    fn start(&mut self, grant: CaptureGrant) -> StartOutcome {
        if grant == CaptureGrant::Denied {
            warn!("Screen capture permission denied");
            self.emit(CoordinatorEvent::PermissionDenied);
            return StartOutcome::PermissionDenied;
        }

        if let Some(session) = &self.session {
            debug!("Start ignored; session {} is active", session.id());
            return StartOutcome::AlreadyRecording {
                session_id: session.id().to_string(),
            };
        }

        let config =
            match SessionConfig::for_display(&self.recording, self.backend.display_metrics()) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Cannot start recording: {:#}", e);
                    return StartOutcome::Failed {
                        error: format!("{:#}", e),
                    };
                }
            };

        let session = RecordingSession::start(config, Arc::clone(&self.backend));
        let session_id = session.id().to_string();
        self.session = Some(session);
        self.publish_status();

        StartOutcome::Started { session_id }
    }

    fn session_ended(&mut self, stats: SessionStats) {
        match &stats.error {
            Some(error) => warn!("Session {} ended with error: {}", stats.session_id, error),
            None => info!(
                "Session {} finished ({:.1}s, {} video / {} audio samples)",
                stats.session_id, stats.duration_secs, stats.video_samples, stats.audio_samples
            ),
        }
        self.emit(CoordinatorEvent::SessionEnded(stats));
        self.publish_status();
    }

    fn current_status(&self) -> RecorderStatus {
        RecorderStatus {
            // A stopping session still blocks a new start until teardown ends
            is_recording: self.session.is_some(),
            is_paused: false,
        }
    }

    /// Emit a status event only when the status actually changed
    fn publish_status(&self) {
        let status = self.current_status();
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            self.emit(CoordinatorEvent::Status(status));
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn wait_for(session: &mut Option<RecordingSession>) -> SessionStats {
    match session {
        Some(session) => session.wait().await,
        None => std::future::pending().await,
    }
}

impl CoordinatorHandle {
    pub async fn start(&self, grant: CaptureGrant) -> Result<StartOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Start { grant, reply }).await?;
        outcome
            .await
            .map_err(|_| anyhow!("coordinator dropped the start request"))
    }

    /// Request a graceful stop; returns whether a running session was asked
    /// to stop
    pub async fn stop(&self) -> Result<bool> {
        let (reply, stopping) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        stopping
            .await
            .map_err(|_| anyhow!("coordinator dropped the stop request"))
    }

    /// Ask for a status event on the event channel
    pub async fn query_status(&self) -> Result<()> {
        self.send(Command::QueryStatus).await
    }

    /// Latest published status
    pub fn status(&self) -> RecorderStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("coordinator is not running"))
    }
}
