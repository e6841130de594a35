// Shared fixtures for pipeline integration tests
//
// `InstrumentedBackend` hands out the real software components wrapped in
// counters, so tests can check that every acquired resource was released,
// and can make any setup stage fail on demand.

#![allow(dead_code)]

use parking_lot::Mutex;
use screen_recorder::capture::{
    AudioCaptureDevice, AudioDeviceParams, DisplayRequest, DisplayStopTrigger, SyntheticDisplay,
    ToneDevice, VirtualDisplay, WavDevice,
};
use screen_recorder::codec::{
    create_encoder_by_type, BufferInfo, CodecError, CodecResult, Encoder, InputBuffer,
    InputSurface, MediaFormat, OutputEvent, SampleFlags,
};
use screen_recorder::error::BoxError;
use screen_recorder::mux::{ContainerMuxer, MediaMuxer, MuxResult};
use screen_recorder::pipeline::{DisplayMetrics, MediaBackend};
use screen_recorder::sizing::calc_bitrate;
use screen_recorder::SessionConfig;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Setup stages a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    VideoEncoder,
    Display,
    AudioEncoder,
    AudioDevice,
    Muxer,
}

#[derive(Debug, Default)]
pub struct Counter {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl Counter {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Output polls seen by an encoder once it has announced its format
#[derive(Debug, Default)]
pub struct OutputLog {
    format_announced: AtomicBool,
    polls_after_format: AtomicUsize,
}

impl OutputLog {
    fn record(&self, event: &CodecResult<OutputEvent>) {
        if self.format_announced.load(Ordering::SeqCst) {
            self.polls_after_format.fetch_add(1, Ordering::SeqCst);
        } else if matches!(event, Ok(OutputEvent::FormatChanged(_))) {
            self.format_announced.store(true, Ordering::SeqCst);
        }
    }

    pub fn format_announced(&self) -> bool {
        self.format_announced.load(Ordering::SeqCst)
    }

    pub fn polls_after_format(&self) -> usize {
        self.polls_after_format.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub video_output: Arc<OutputLog>,
    pub audio_output: Arc<OutputLog>,
    pub video_encoder: Arc<Counter>,
    pub audio_encoder: Arc<Counter>,
    pub display: Arc<Counter>,
    pub audio_device: Arc<Counter>,
    pub muxer: Arc<Counter>,
    pub muxer_starts: Arc<AtomicUsize>,
}

impl Counters {
    fn all(&self) -> [(&'static str, &Counter); 5] {
        [
            ("video encoder", &self.video_encoder),
            ("audio encoder", &self.audio_encoder),
            ("display", &self.display),
            ("audio device", &self.audio_device),
            ("muxer", &self.muxer),
        ]
    }

    /// Every acquired resource was released exactly once
    pub fn assert_balanced(&self) {
        for (name, counter) in self.all() {
            assert_eq!(
                counter.acquired(),
                counter.released(),
                "{} acquired {} times but released {} times",
                name,
                counter.acquired(),
                counter.released()
            );
        }
    }

    pub fn muxer_starts(&self) -> usize {
        self.muxer_starts.load(Ordering::SeqCst)
    }
}

pub enum TestAudio {
    Tone,
    Wav { path: PathBuf, looping: bool },
}

pub struct InstrumentedBackend {
    pub counters: Arc<Counters>,
    display: DisplayMetrics,
    audio: TestAudio,
    fail_at: Option<Stage>,
    audio_encoder_override: Mutex<Option<Arc<dyn Encoder>>>,
    display_trigger: Mutex<Option<DisplayStopTrigger>>,
}

impl InstrumentedBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            display: DisplayMetrics { width, height },
            audio: TestAudio::Tone,
            fail_at: None,
            audio_encoder_override: Mutex::new(None),
            display_trigger: Mutex::new(None),
        }
    }

    pub fn failing_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn with_audio(mut self, audio: TestAudio) -> Self {
        self.audio = audio;
        self
    }

    /// Hand out `encoder` instead of a real audio encoder
    pub fn with_audio_encoder(self, encoder: Arc<dyn Encoder>) -> Self {
        *self.audio_encoder_override.lock() = Some(encoder);
        self
    }

    /// Stop trigger of the most recently created display
    pub fn display_trigger(&self) -> Option<DisplayStopTrigger> {
        self.display_trigger.lock().clone()
    }

    fn check(&self, stage: Stage) -> Result<(), BoxError> {
        if self.fail_at == Some(stage) {
            return Err(format!("injected failure at {:?}", stage).into());
        }
        Ok(())
    }
}

impl MediaBackend for InstrumentedBackend {
    fn display_metrics(&self) -> DisplayMetrics {
        self.display
    }

    fn create_video_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError> {
        self.check(Stage::VideoEncoder)?;
        let inner = create_encoder_by_type(mime)?;
        Ok(Arc::new(CountingEncoder::new(
            inner,
            Arc::clone(&self.counters.video_encoder),
            Arc::clone(&self.counters.video_output),
        )))
    }

    fn create_audio_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError> {
        self.check(Stage::AudioEncoder)?;
        let inner = match self.audio_encoder_override.lock().take() {
            Some(encoder) => encoder,
            None => create_encoder_by_type(mime)?,
        };
        Ok(Arc::new(CountingEncoder::new(
            inner,
            Arc::clone(&self.counters.audio_encoder),
            Arc::clone(&self.counters.audio_output),
        )))
    }

    fn create_virtual_display(
        &self,
        request: DisplayRequest,
    ) -> Result<Box<dyn VirtualDisplay>, BoxError> {
        self.check(Stage::Display)?;
        let display = SyntheticDisplay::start(request)?;
        *self.display_trigger.lock() = Some(display.stop_trigger());
        self.counters.display.acquire();
        Ok(Box::new(CountingDisplay {
            inner: display,
            counter: Arc::clone(&self.counters.display),
            released: false,
        }))
    }

    fn create_audio_device(
        &self,
        params: AudioDeviceParams,
    ) -> Result<Box<dyn AudioCaptureDevice>, BoxError> {
        self.check(Stage::AudioDevice)?;
        let inner: Box<dyn AudioCaptureDevice> = match &self.audio {
            TestAudio::Tone => Box::new(ToneDevice::new(params, 440.0)),
            TestAudio::Wav { path, looping } => Box::new(WavDevice::open(path, params, *looping)?),
        };
        self.counters.audio_device.acquire();
        Ok(Box::new(CountingDevice {
            inner,
            counter: Arc::clone(&self.counters.audio_device),
            released: false,
        }))
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn MediaMuxer>, BoxError> {
        self.check(Stage::Muxer)?;
        let inner = ContainerMuxer::new(path)?;
        self.counters.muxer.acquire();
        Ok(Box::new(CountingMuxer {
            inner,
            counter: Arc::clone(&self.counters.muxer),
            starts: Arc::clone(&self.counters.muxer_starts),
            released: false,
        }))
    }
}

pub struct CountingEncoder {
    inner: Arc<dyn Encoder>,
    counter: Arc<Counter>,
    outputs: Arc<OutputLog>,
    released: AtomicBool,
}

impl CountingEncoder {
    fn new(inner: Arc<dyn Encoder>, counter: Arc<Counter>, outputs: Arc<OutputLog>) -> Self {
        counter.acquire();
        Self {
            inner,
            counter,
            outputs,
            released: AtomicBool::new(false),
        }
    }
}

impl Encoder for CountingEncoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure(&self, format: &MediaFormat) -> CodecResult<()> {
        self.inner.configure(format)
    }

    fn create_input_surface(&self) -> CodecResult<InputSurface> {
        self.inner.create_input_surface()
    }

    fn start(&self) -> CodecResult<()> {
        self.inner.start()
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<Option<InputBuffer>> {
        self.inner.dequeue_input_buffer(timeout)
    }

    fn queue_input_buffer(
        &self,
        buffer: InputBuffer,
        size: usize,
        presentation_time_us: u64,
        flags: SampleFlags,
    ) -> CodecResult<()> {
        self.inner
            .queue_input_buffer(buffer, size, presentation_time_us, flags)
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> CodecResult<OutputEvent> {
        let event = self.inner.dequeue_output_buffer(timeout);
        self.outputs.record(&event);
        event
    }

    fn output_format(&self) -> CodecResult<MediaFormat> {
        self.inner.output_format()
    }

    fn release_output_buffer(&self, index: usize) -> CodecResult<()> {
        self.inner.release_output_buffer(index)
    }

    fn stop(&self) -> CodecResult<()> {
        self.inner.stop()
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counter.release();
        }
        self.inner.release();
    }
}

struct CountingDisplay {
    inner: SyntheticDisplay,
    counter: Arc<Counter>,
    released: bool,
}

impl VirtualDisplay for CountingDisplay {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counter.release();
        }
        self.inner.release();
    }
}

struct CountingDevice {
    inner: Box<dyn AudioCaptureDevice>,
    counter: Arc<Counter>,
    released: bool,
}

impl AudioCaptureDevice for CountingDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> io::Result<()> {
        self.inner.start()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn stop(&mut self) {
        self.inner.stop()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counter.release();
        }
        self.inner.release();
    }
}

struct CountingMuxer {
    inner: ContainerMuxer,
    counter: Arc<Counter>,
    starts: Arc<AtomicUsize>,
    released: bool,
}

impl MediaMuxer for CountingMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> MuxResult<usize> {
        self.inner.add_track(format)
    }

    fn start(&mut self) -> MuxResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start()
    }

    fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MuxResult<()> {
        self.inner.write_sample(track, data, info)
    }

    fn stop(&mut self) -> MuxResult<()> {
        self.inner.stop()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counter.release();
        }
        self.inner.release();
    }
}

/// Audio encoder replaying a fixed list of output events
pub struct ScriptedEncoder {
    events: Mutex<VecDeque<OutputEvent>>,
    delay: Duration,
    started_at: Mutex<Option<Instant>>,
}

impl ScriptedEncoder {
    pub fn new(events: Vec<OutputEvent>) -> Self {
        Self::delayed(Duration::ZERO, events)
    }

    /// Hold every event back until `delay` after `start`
    pub fn delayed(delay: Duration, events: Vec<OutputEvent>) -> Self {
        Self {
            events: Mutex::new(events.into()),
            delay,
            started_at: Mutex::new(None),
        }
    }

    fn releasing(&self) -> bool {
        self.started_at
            .lock()
            .is_some_and(|started| started.elapsed() >= self.delay)
    }
}

impl Encoder for ScriptedEncoder {
    fn name(&self) -> &str {
        "scripted-encoder"
    }

    fn configure(&self, _format: &MediaFormat) -> CodecResult<()> {
        Ok(())
    }

    fn start(&self) -> CodecResult<()> {
        *self.started_at.lock() = Some(Instant::now());
        Ok(())
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<Option<InputBuffer>> {
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn queue_input_buffer(
        &self,
        _buffer: InputBuffer,
        _size: usize,
        _presentation_time_us: u64,
        _flags: SampleFlags,
    ) -> CodecResult<()> {
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> CodecResult<OutputEvent> {
        let next = if self.releasing() {
            self.events.lock().pop_front()
        } else {
            None
        };
        match next {
            Some(event) => Ok(event),
            None => {
                std::thread::sleep(timeout);
                Ok(OutputEvent::TryAgain)
            }
        }
    }

    fn output_format(&self) -> CodecResult<MediaFormat> {
        Err(CodecError::InvalidFormat("scripted".to_string()))
    }

    fn release_output_buffer(&self, _index: usize) -> CodecResult<()> {
        Ok(())
    }

    fn stop(&self) -> CodecResult<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Small session so tests stay fast
pub fn small_session(dir: &Path) -> SessionConfig {
    let (width, height) = (320, 180);
    SessionConfig {
        output_path: dir.join("recording.srec"),
        width,
        height,
        bit_rate: calc_bitrate(30, width, height),
        frame_rate: 30,
        key_frame_interval_secs: 5,
        repeat_previous_frame_after_ms: 1000,
        sample_rate: 44100,
        channels: 1,
        audio_bit_rate: 64000,
        time_lapse: 1,
        video_mime: screen_recorder::codec::MIME_VIDEO_SCREEN_RLE.to_string(),
        audio_mime: screen_recorder::codec::MIME_AUDIO_IMA_ADPCM.to_string(),
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Write a mono 16-bit WAV of `secs` seconds of a 440 Hz tone
pub fn write_tone_wav(path: &Path, sample_rate: u32, secs: f32) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let frames = (sample_rate as f32 * secs) as u32;
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 8000.0;
        writer.write_sample(sample as i16)?;
    }
    writer.finalize()?;
    Ok(())
}
