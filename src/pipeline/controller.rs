use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backend::MediaBackend;
use super::signal::AsyncErrorFlag;
use super::{PipelineState, SessionReport, StopReason, StreamReport};
use crate::capture::{
    AudioCaptureDevice, AudioDeviceParams, AudioFeeder, DisplayCallback, DisplayRequest,
    FeederContext, VirtualDisplay,
};
use crate::codec::{
    BufferInfo, Encoder, InputSurface, MediaFormat, OutputBuffer, OutputEvent, StreamKind,
};
use crate::error::{RecorderError, RecorderResult};
use crate::mux::MediaMuxer;
use crate::session::SessionConfig;
use crate::timing::PresentationClock;

/// Bounded wait when polling an encoder's output queue
const OUTPUT_POLL: Duration = Duration::from_millis(10);

const DISPLAY_NAME: &str = "screen-recorder";

/// Everything the session acquires, each present only once acquired
#[derive(Default)]
struct Resources {
    muxer: Option<Box<dyn MediaMuxer>>,
    display: Option<Box<dyn VirtualDisplay>>,
    surface: Option<InputSurface>,
    video_encoder: Option<Arc<dyn Encoder>>,
    audio_feeder: Option<AudioFeeder>,
    /// Held here only between creation and handing it to the feeder
    audio_device: Option<Box<dyn AudioCaptureDevice>>,
    audio_encoder: Option<Arc<dyn Encoder>>,
}

#[derive(Debug, Default)]
struct StreamState {
    track: Option<usize>,
    report: StreamReport,
}

enum LoopExit {
    StopRequested,
    EndOfStream(StreamKind),
}

/// Turns an unexpected end of the mirroring session into an async failure
struct ProjectionWatcher {
    session_stop: CancellationToken,
    finalizing: CancellationToken,
    async_error: AsyncErrorFlag,
}

impl DisplayCallback for ProjectionWatcher {
    fn on_stopped(&self) {
        if self.session_stop.is_cancelled() || self.finalizing.is_cancelled() {
            debug!("Virtual display stopped during shutdown");
            return;
        }
        error!("Virtual display stopped unexpectedly");
        self.async_error.raise("virtual display stopped unexpectedly");
    }

    fn on_paused(&self) {
        info!("Virtual display paused");
    }
}

/// Runs one recording session from setup to teardown.
///
/// Owns every encoder, capture source and the muxer for the lifetime of the
/// session. [`run`](Self::run) blocks, so call it from a dedicated thread
/// (or `spawn_blocking`).
pub struct PipelineController {
    config: SessionConfig,
    backend: Arc<dyn MediaBackend>,
    clock: Arc<PresentationClock>,
    /// Stop requested by the coordinator
    cancel: CancellationToken,
    /// Raised when teardown begins
    finalizing: CancellationToken,
    /// Stop flag of the audio capture thread
    audio_stop: CancellationToken,
    async_error: AsyncErrorFlag,
    state: watch::Sender<PipelineState>,
    resources: Resources,
    video: StreamState,
    audio: StreamState,
    muxer_started: bool,
    output_finalized: bool,
    audio_buffers_captured: u64,
}

impl PipelineController {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn MediaBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let clock = Arc::new(PresentationClock::monotonic(config.time_lapse));
        let (state, _) = watch::channel(PipelineState::Starting);
        Self {
            config,
            backend,
            clock,
            cancel,
            finalizing: CancellationToken::new(),
            audio_stop: CancellationToken::new(),
            async_error: AsyncErrorFlag::new(),
            state,
            resources: Resources::default(),
            video: StreamState::default(),
            audio: StreamState::default(),
            muxer_started: false,
            output_finalized: false,
            audio_buffers_captured: 0,
        }
    }

    /// Replace the presentation clock (e.g. with a manual one)
    pub fn with_clock(mut self, clock: Arc<PresentationClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Pipeline state: {} -> {}", previous, state);
        }
    }

    /// Set up, capture until stopped, then tear down
    pub fn run(mut self) -> SessionReport {
        let started = Instant::now();
        self.set_state(PipelineState::Starting);

        let outcome = self.setup().and_then(|()| {
            self.set_state(PipelineState::Capturing);
            self.capture_loop()
        });

        let (stop_reason, error) = match outcome {
            Ok(LoopExit::StopRequested) => {
                info!("Stop requested; finalizing");
                self.set_state(PipelineState::Draining);
                (StopReason::StopRequested, None)
            }
            Ok(LoopExit::EndOfStream(kind)) => {
                info!("{} stream ended; finalizing", kind);
                self.set_state(PipelineState::Draining);
                (StopReason::EndOfStream, None)
            }
            Err(e) => {
                let reason = if e.is_setup_failure() {
                    error!("Session setup failed: {}", e);
                    StopReason::SetupFailed
                } else {
                    error!("Recording failed: {}", e);
                    StopReason::Error
                };
                self.set_state(PipelineState::Failed);
                (reason, Some(e))
            }
        };

        self.finalize();

        let state = if error.is_some() {
            PipelineState::Failed
        } else {
            PipelineState::Closed
        };
        self.set_state(state);

        SessionReport {
            state,
            stop_reason,
            output_path: self
                .output_finalized
                .then(|| self.config.output_path.clone()),
            muxer_started: self.muxer_started,
            video: std::mem::take(&mut self.video.report),
            audio: std::mem::take(&mut self.audio.report),
            audio_buffers_captured: self.audio_buffers_captured,
            error: error.map(|e| e.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn setup(&mut self) -> RecorderResult<()> {
        let config = self.config.clone();
        info!(
            "Setting up session: {}x{} @ {} fps, {} bps video, {} Hz x {} ch audio",
            config.width,
            config.height,
            config.frame_rate,
            config.bit_rate,
            config.sample_rate,
            config.channels
        );

        // Video encoder with surface input
        let video_encoder = self
            .backend
            .create_video_encoder(&config.video_mime)
            .map_err(|e| RecorderError::setup("creating the video encoder", e))?;
        self.resources.video_encoder = Some(Arc::clone(&video_encoder));
        video_encoder
            .configure(&MediaFormat::Video(config.video_format()))
            .map_err(|e| RecorderError::setup("configuring the video encoder", e))?;
        let surface = video_encoder
            .create_input_surface()
            .map_err(|e| RecorderError::setup("creating the input surface", e))?;
        self.resources.surface = Some(surface.clone());
        video_encoder
            .start()
            .map_err(|e| RecorderError::setup("starting the video encoder", e))?;

        // Display mirror into the surface
        let display = self
            .backend
            .create_virtual_display(DisplayRequest {
                name: DISPLAY_NAME.to_string(),
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
                surface,
                callback: Arc::new(ProjectionWatcher {
                    session_stop: self.cancel.clone(),
                    finalizing: self.finalizing.clone(),
                    async_error: self.async_error.clone(),
                }),
            })
            .map_err(|e| RecorderError::setup("creating the virtual display", e))?;
        self.resources.display = Some(display);

        // Audio encoder fed from the capture thread
        let audio_encoder = self
            .backend
            .create_audio_encoder(&config.audio_mime)
            .map_err(|e| RecorderError::setup("creating the audio encoder", e))?;
        self.resources.audio_encoder = Some(Arc::clone(&audio_encoder));
        audio_encoder
            .configure(&MediaFormat::Audio(config.audio_format()))
            .map_err(|e| RecorderError::setup("configuring the audio encoder", e))?;
        audio_encoder
            .start()
            .map_err(|e| RecorderError::setup("starting the audio encoder", e))?;

        let params = AudioDeviceParams::with_headroom(config.sample_rate, config.channels);
        let device = self
            .backend
            .create_audio_device(params)
            .map_err(|e| RecorderError::setup("opening the audio device", e))?;
        let device = self.resources.audio_device.insert(device);
        device
            .start()
            .map_err(|e| RecorderError::setup("starting audio recording", e))?;

        if let Some(device) = self.resources.audio_device.take() {
            let feeder = AudioFeeder::spawn(
                FeederContext {
                    encoder: audio_encoder,
                    clock: Arc::clone(&self.clock),
                    audio_stop: self.audio_stop.clone(),
                    session_stop: self.cancel.clone(),
                    async_error: self.async_error.clone(),
                },
                device,
            )
            .map_err(|e| RecorderError::setup("spawning the audio capture thread", e))?;
            self.resources.audio_feeder = Some(feeder);
        }

        let muxer = self
            .backend
            .create_muxer(&config.output_path)
            .map_err(|e| RecorderError::setup("opening the muxer", e))?;
        self.resources.muxer = Some(muxer);

        Ok(())
    }

    fn capture_loop(&mut self) -> RecorderResult<LoopExit> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(LoopExit::StopRequested);
            }
            if let Some(reason) = self.async_error.reason() {
                return Err(RecorderError::AsyncStream(reason));
            }

            // Hold video back until audio has announced its format too
            let video_waiting = self.video.track.is_some() && self.audio.track.is_none();
            let audio_wait = if video_waiting {
                OUTPUT_POLL
            } else {
                Duration::ZERO
            };

            if self.drain(StreamKind::Audio, audio_wait)? {
                return Ok(LoopExit::EndOfStream(StreamKind::Audio));
            }
            if video_waiting {
                continue;
            }
            if self.drain(StreamKind::Video, OUTPUT_POLL)? {
                return Ok(LoopExit::EndOfStream(StreamKind::Video));
            }
        }
    }

    fn stream(&self, kind: StreamKind) -> &StreamState {
        match kind {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    fn encoder(&self, kind: StreamKind) -> RecorderResult<Arc<dyn Encoder>> {
        let encoder = match kind {
            StreamKind::Video => &self.resources.video_encoder,
            StreamKind::Audio => &self.resources.audio_encoder,
        };
        encoder
            .clone()
            .ok_or_else(|| RecorderError::Protocol(format!("no {} encoder", kind)))
    }

    /// Handle one output event; returns true on end of stream
    fn drain(&mut self, kind: StreamKind, timeout: Duration) -> RecorderResult<bool> {
        let encoder = self.encoder(kind)?;

        match encoder.dequeue_output_buffer(timeout)? {
            OutputEvent::TryAgain => Ok(false),
            OutputEvent::FormatChanged(format) => {
                self.register_track(kind, &format)?;
                Ok(false)
            }
            OutputEvent::Buffer(buffer) => {
                let written = self.write_sample(kind, &buffer);
                let released = encoder.release_output_buffer(buffer.index);
                written?;
                released?;

                let end_of_stream = buffer.info.flags.end_of_stream;
                if end_of_stream {
                    self.stream_mut(kind).report.end_of_stream = true;
                }
                Ok(end_of_stream)
            }
        }
    }

    fn register_track(&mut self, kind: StreamKind, format: &MediaFormat) -> RecorderResult<()> {
        if self.stream(kind).track.is_some() {
            return Err(RecorderError::Protocol(format!(
                "{} format changed twice",
                kind
            )));
        }
        if format.kind() != kind {
            return Err(RecorderError::Protocol(format!(
                "{} encoder announced a {} format",
                kind,
                format.kind()
            )));
        }

        let muxer = self
            .resources
            .muxer
            .as_mut()
            .ok_or_else(|| RecorderError::Protocol("no muxer".to_string()))?;
        let track = muxer.add_track(format)?;
        self.stream_mut(kind).track = Some(track);
        self.stream_mut(kind).report.track = Some(track);
        info!("{} output format: {} (track {})", kind, format.mime(), track);

        self.start_muxer_if_ready()
    }

    fn start_muxer_if_ready(&mut self) -> RecorderResult<()> {
        if self.muxer_started || self.video.track.is_none() || self.audio.track.is_none() {
            return Ok(());
        }
        if let Some(muxer) = self.resources.muxer.as_mut() {
            muxer.start()?;
            self.muxer_started = true;
            info!("Muxer started");
        }
        Ok(())
    }

    fn write_sample(&mut self, kind: StreamKind, buffer: &OutputBuffer) -> RecorderResult<()> {
        let info = buffer.info;
        if info.flags.codec_config {
            debug!("{}: skipping {} bytes of codec config", kind, info.size);
            return Ok(());
        }
        if info.size == 0 {
            return Ok(());
        }
        if !self.muxer_started {
            trace!("{}: muxer not started, dropping sample", kind);
            self.stream_mut(kind).report.samples_dropped += 1;
            return Ok(());
        }

        let last = self.stream(kind).report.last_pts_us;
        let presentation_time_us = match kind {
            StreamKind::Audio => match last {
                Some(last) if info.presentation_time_us <= last => {
                    debug!(
                        "audio: dropping sample at {}us (last written {}us)",
                        info.presentation_time_us, last
                    );
                    self.audio.report.samples_dropped += 1;
                    return Ok(());
                }
                _ => info.presentation_time_us,
            },
            // The encoder's own timestamp is replaced by the shared clock
            StreamKind::Video => {
                let now = self.clock.now_us();
                match last {
                    Some(last) if now <= last => last + 1,
                    _ => now,
                }
            }
        };

        let track = self
            .stream(kind)
            .track
            .ok_or_else(|| RecorderError::Protocol(format!("{} sample before its format", kind)))?;
        let payload = buffer.payload();
        let muxer = self
            .resources
            .muxer
            .as_mut()
            .ok_or_else(|| RecorderError::Protocol("no muxer".to_string()))?;
        muxer.write_sample(
            track,
            payload,
            &BufferInfo {
                offset: 0,
                size: payload.len(),
                presentation_time_us,
                flags: info.flags,
            },
        )?;

        let report = &mut self.stream_mut(kind).report;
        report.samples_written += 1;
        report.bytes_written += payload.len() as u64;
        report.first_pts_us.get_or_insert(presentation_time_us);
        report.last_pts_us = Some(presentation_time_us);
        trace!(
            "{}: wrote {} bytes at {}us",
            kind,
            payload.len(),
            presentation_time_us
        );
        Ok(())
    }

    /// Release everything in dependency order; never fails
    fn finalize(&mut self) {
        self.finalizing.cancel();
        debug!("Releasing session resources");

        if let Some(mut muxer) = self.resources.muxer.take() {
            if self.muxer_started {
                match muxer.stop() {
                    Ok(()) => self.output_finalized = true,
                    Err(e) => warn!("Failed to stop muxer: {}", e),
                }
            } else {
                info!("Muxer never started; no output written");
            }
            muxer.release();
        }

        if let Some(mut virtual_display) = self.resources.display.take() {
            virtual_display.release();
            debug!("Virtual display '{}' released", virtual_display.name());
        }

        if let Some(surface) = self.resources.surface.take() {
            surface.release();
        }

        if let Some(encoder) = self.resources.video_encoder.take() {
            stop_encoder(encoder.as_ref());
        }

        self.audio_stop.cancel();
        if let Some(mut feeder) = self.resources.audio_feeder.take() {
            let stats = feeder.stop_and_join();
            self.audio_buffers_captured = stats.buffers_queued;
        }
        if let Some(mut device) = self.resources.audio_device.take() {
            device.stop();
            device.release();
        }

        if let Some(encoder) = self.resources.audio_encoder.take() {
            stop_encoder(encoder.as_ref());
        }

        info!(
            "Session resources released (video: {} samples, audio: {} samples)",
            self.video.report.samples_written, self.audio.report.samples_written
        );
    }
}

fn stop_encoder(encoder: &dyn Encoder) {
    if let Err(e) = encoder.stop() {
        warn!("Failed to stop {}: {}", encoder.name(), e);
    }
    encoder.release();
}
