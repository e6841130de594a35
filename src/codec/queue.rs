//! Generic buffer-queue encoder running a [`Compressor`] on a worker thread.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::surface::{InputSurface, SurfaceSink};
use super::{
    BufferInfo, CodecError, CodecResult, Encoder, InputBuffer, MediaFormat, OutputBuffer,
    OutputEvent, SampleFlags,
};

/// Input slots per byte-buffer encoder
const INPUT_SLOTS: usize = 4;
/// Queued plus held output buffers before the worker blocks
const MAX_OUTSTANDING_OUTPUTS: usize = 8;
/// Surface frames waiting for the worker; older frames are dropped beyond this
const MAX_PENDING_FRAMES: usize = 3;

/// The compression step of an encoder.
pub trait Compressor: Send {
    /// Final stream format, announced once before the first sample
    fn output_format(&self) -> MediaFormat;

    /// Setup data emitted right after the format announcement
    fn codec_config(&self) -> Option<Bytes> {
        None
    }

    /// Capacity of each input slot
    fn input_buffer_size(&self) -> usize;

    /// Byte length of one surface frame, if surface input is supported
    fn surface_frame_size(&self) -> Option<usize> {
        None
    }

    /// Compress one input unit into `out`; returns whether it is a sync sample
    fn compress(&mut self, input: &[u8], out: &mut BytesMut) -> CodecResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPhase {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}

impl std::fmt::Display for CodecPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecPhase::Uninitialized => "uninitialized",
            CodecPhase::Configured => "configured",
            CodecPhase::Running => "running",
            CodecPhase::Stopped => "stopped",
            CodecPhase::Released => "released",
        };
        f.write_str(name)
    }
}

type CompressorFactory = dyn Fn(&MediaFormat) -> CodecResult<Box<dyn Compressor>> + Send + Sync;

struct PendingInput {
    slot_index: Option<usize>,
    data: Vec<u8>,
    size: usize,
    presentation_time_us: u64,
    flags: SampleFlags,
}

enum QueuedOutput {
    Format(MediaFormat),
    Sample(OutputBuffer),
}

struct QueueState {
    phase: CodecPhase,
    output_format: Option<MediaFormat>,
    surface_mode: bool,
    repeat_after: Option<Duration>,
    slot_capacity: usize,
    free_slots: Vec<InputBuffer>,
    pending: VecDeque<PendingInput>,
    outputs: VecDeque<QueuedOutput>,
    held: HashSet<usize>,
    next_output_index: usize,
    input_eos: bool,
    failure: Option<String>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            phase: CodecPhase::Uninitialized,
            output_format: None,
            surface_mode: false,
            repeat_after: None,
            slot_capacity: 0,
            free_slots: Vec::new(),
            pending: VecDeque::new(),
            outputs: VecDeque::new(),
            held: HashSet::new(),
            next_output_index: 0,
            input_eos: false,
            failure: None,
        }
    }

    fn ensure_running(&self, codec: &str, operation: &'static str) -> CodecResult<()> {
        if let Some(message) = &self.failure {
            return Err(CodecError::Failed {
                codec: codec.to_string(),
                message: message.clone(),
            });
        }
        if self.phase != CodecPhase::Running {
            return Err(CodecError::IllegalState {
                codec: codec.to_string(),
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn push_sample(&mut self, data: Bytes, presentation_time_us: u64, flags: SampleFlags) {
        let index = self.next_output_index;
        self.next_output_index += 1;
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us,
            flags,
        };
        self.outputs
            .push_back(QueuedOutput::Sample(OutputBuffer { index, data, info }));
    }

    fn clear_queues(&mut self) {
        self.pending.clear();
        self.outputs.clear();
        self.held.clear();
        self.free_slots.clear();
    }
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    /// A free input slot was returned
    input_available: Condvar,
    /// Pending input (or a phase change) for the worker
    work_available: Condvar,
    /// Output queued (or a failure / phase change) for the consumer
    output_available: Condvar,
    /// The consumer released an output buffer
    output_released: Condvar,
}

impl Shared {
    fn notify_all(&self) {
        self.input_available.notify_all();
        self.work_available.notify_all();
        self.output_available.notify_all();
        self.output_released.notify_all();
    }
}

/// Encoder state machine: Uninitialized → Configured → Running → Stopped → Released.
pub struct BufferQueueCodec {
    shared: Arc<Shared>,
    factory: Box<CompressorFactory>,
    compressor: Mutex<Option<Box<dyn Compressor>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferQueueCodec {
    pub fn new<F>(name: &str, factory: F) -> Self
    where
        F: Fn(&MediaFormat) -> CodecResult<Box<dyn Compressor>> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(QueueState::new()),
                input_available: Condvar::new(),
                work_available: Condvar::new(),
                output_available: Condvar::new(),
                output_released: Condvar::new(),
            }),
            factory: Box::new(factory),
            compressor: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> CodecPhase {
        self.shared.state.lock().phase
    }

    fn illegal(&self, operation: &'static str, phase: CodecPhase) -> CodecError {
        CodecError::IllegalState {
            codec: self.shared.name.clone(),
            operation,
            phase,
        }
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("{}: worker thread panicked", self.shared.name);
            }
        }
    }
}

impl Encoder for BufferQueueCodec {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn configure(&self, format: &MediaFormat) -> CodecResult<()> {
        let mut state = self.shared.state.lock();
        if !matches!(state.phase, CodecPhase::Uninitialized | CodecPhase::Stopped) {
            return Err(self.illegal("configure", state.phase));
        }

        let compressor = (self.factory)(format)?;
        state.slot_capacity = compressor.input_buffer_size();
        state.repeat_after = match format {
            MediaFormat::Video(video) => video
                .repeat_previous_frame_after_us
                .map(Duration::from_micros),
            MediaFormat::Audio(_) => None,
        };
        state.surface_mode = false;
        state.output_format = None;
        state.input_eos = false;
        state.failure = None;
        state.phase = CodecPhase::Configured;
        *self.compressor.lock() = Some(compressor);

        debug!("{} configured for {}", self.shared.name, format.mime());
        Ok(())
    }

    fn create_input_surface(&self) -> CodecResult<InputSurface> {
        let mut state = self.shared.state.lock();
        if state.phase != CodecPhase::Configured {
            return Err(self.illegal("create an input surface", state.phase));
        }

        let frame_size = self
            .compressor
            .lock()
            .as_ref()
            .and_then(|c| c.surface_frame_size())
            .ok_or_else(|| {
                CodecError::InvalidFormat(format!(
                    "{} does not accept surface input",
                    self.shared.name
                ))
            })?;

        state.surface_mode = true;
        Ok(InputSurface::new(Arc::new(CodecSurface {
            shared: Arc::clone(&self.shared),
            frame_size,
            released: AtomicBool::new(false),
        })))
    }

    fn start(&self) -> CodecResult<()> {
        let compressor = {
            let mut state = self.shared.state.lock();
            if state.phase != CodecPhase::Configured {
                return Err(self.illegal("start", state.phase));
            }
            let compressor = self
                .compressor
                .lock()
                .take()
                .ok_or_else(|| self.illegal("start", state.phase))?;

            if !state.surface_mode {
                let capacity = state.slot_capacity;
                state.free_slots = (0..INPUT_SLOTS)
                    .map(|index| InputBuffer::new(index, capacity))
                    .collect();
            }
            state.phase = CodecPhase::Running;
            compressor
        };

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_worker(shared, compressor))
            .map_err(|e| CodecError::Failed {
                codec: self.shared.name.clone(),
                message: format!("failed to spawn worker: {}", e),
            })?;
        *self.worker.lock() = Some(handle);

        info!("{} started", self.shared.name);
        Ok(())
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<Option<InputBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        if state.surface_mode {
            return Err(self.illegal("dequeue an input buffer in surface mode", state.phase));
        }

        loop {
            state.ensure_running(&self.shared.name, "dequeue an input buffer")?;
            if let Some(buffer) = state.free_slots.pop() {
                return Ok(Some(buffer));
            }
            if self
                .shared
                .input_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                state.ensure_running(&self.shared.name, "dequeue an input buffer")?;
                return Ok(state.free_slots.pop());
            }
        }
    }

    fn queue_input_buffer(
        &self,
        buffer: InputBuffer,
        size: usize,
        presentation_time_us: u64,
        flags: SampleFlags,
    ) -> CodecResult<()> {
        let mut state = self.shared.state.lock();
        let capacity = buffer.capacity();
        let (index, data) = buffer.into_parts();

        state.ensure_running(&self.shared.name, "queue an input buffer")?;
        if size > capacity {
            state.free_slots.push(InputBuffer { index, data });
            self.shared.input_available.notify_one();
            return Err(CodecError::BufferOverflow {
                codec: self.shared.name.clone(),
                size,
                capacity,
            });
        }
        if state.input_eos {
            state.free_slots.push(InputBuffer { index, data });
            return Err(self.illegal("queue input after end of stream", state.phase));
        }

        state.input_eos = flags.end_of_stream;
        state.pending.push_back(PendingInput {
            slot_index: Some(index),
            data,
            size,
            presentation_time_us,
            flags,
        });
        self.shared.work_available.notify_one();
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> CodecResult<OutputEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            state.ensure_running(&self.shared.name, "dequeue an output buffer")?;

            match state.outputs.pop_front() {
                Some(QueuedOutput::Format(format)) => {
                    state.output_format = Some(format.clone());
                    return Ok(OutputEvent::FormatChanged(format));
                }
                Some(QueuedOutput::Sample(buffer)) => {
                    state.held.insert(buffer.index);
                    return Ok(OutputEvent::Buffer(buffer));
                }
                None => {}
            }

            if timeout.is_zero()
                || self
                    .shared
                    .output_available
                    .wait_until(&mut state, deadline)
                    .timed_out()
            {
                if state.outputs.is_empty() {
                    return Ok(OutputEvent::TryAgain);
                }
            }
        }
    }

    fn output_format(&self) -> CodecResult<MediaFormat> {
        let state = self.shared.state.lock();
        state
            .output_format
            .clone()
            .ok_or_else(|| self.illegal("report an output format before announcing it", state.phase))
    }

    fn release_output_buffer(&self, index: usize) -> CodecResult<()> {
        let mut state = self.shared.state.lock();
        state.ensure_running(&self.shared.name, "release an output buffer")?;
        if !state.held.remove(&index) {
            return Err(CodecError::UnknownBuffer {
                codec: self.shared.name.clone(),
                index,
            });
        }
        self.shared.output_released.notify_one();
        Ok(())
    }

    fn stop(&self) -> CodecResult<()> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                CodecPhase::Running | CodecPhase::Configured => {
                    state.phase = CodecPhase::Stopped;
                    state.clear_queues();
                }
                CodecPhase::Stopped => return Ok(()),
                phase => return Err(self.illegal("stop", phase)),
            }
            self.shared.notify_all();
        }
        self.join_worker();

        info!("{} stopped", self.shared.name);
        Ok(())
    }

    fn release(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.phase == CodecPhase::Released {
                return;
            }
            state.phase = CodecPhase::Released;
            state.clear_queues();
            self.shared.notify_all();
        }
        self.join_worker();
        self.compressor.lock().take();

        debug!("{} released", self.shared.name);
    }
}

impl Drop for BufferQueueCodec {
    fn drop(&mut self) {
        self.release();
    }
}

/// Input surface writing frames straight into the codec's pending queue
struct CodecSurface {
    shared: Arc<Shared>,
    frame_size: usize,
    released: AtomicBool,
}

impl SurfaceSink for CodecSurface {
    fn post_frame(&self, frame: &[u8], timestamp_us: u64) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        if frame.len() != self.frame_size {
            warn!(
                "{}: rejecting frame of {} bytes (expected {})",
                self.shared.name,
                frame.len(),
                self.frame_size
            );
            return false;
        }

        let mut state = self.shared.state.lock();
        if state.phase != CodecPhase::Running || state.failure.is_some() {
            return false;
        }
        if state.pending.len() >= MAX_PENDING_FRAMES {
            state.pending.pop_front();
            trace!("{}: encoder behind, dropped oldest frame", self.shared.name);
        }
        state.pending.push_back(PendingInput {
            slot_index: None,
            data: frame.to_vec(),
            size: frame.len(),
            presentation_time_us: timestamp_us,
            flags: SampleFlags::NONE,
        });
        self.shared.work_available.notify_one();
        true
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!("{}: input surface released", self.shared.name);
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

enum WorkItem {
    Input(PendingInput),
    RepeatLastFrame,
}

fn next_work_item(
    shared: &Shared,
    state: &mut MutexGuard<'_, QueueState>,
    last_input_at: Instant,
    has_last_frame: bool,
) -> Option<WorkItem> {
    loop {
        if state.phase != CodecPhase::Running {
            return None;
        }
        if let Some(input) = state.pending.pop_front() {
            return Some(WorkItem::Input(input));
        }
        match state.repeat_after {
            Some(after) if state.surface_mode && has_last_frame => {
                let deadline = last_input_at + after;
                if shared.work_available.wait_until(state, deadline).timed_out()
                    && state.pending.is_empty()
                    && state.phase == CodecPhase::Running
                {
                    return Some(WorkItem::RepeatLastFrame);
                }
            }
            _ => shared.work_available.wait(state),
        }
    }
}

fn run_worker(shared: Arc<Shared>, mut compressor: Box<dyn Compressor>) {
    let mut announced = false;
    let mut last_frame: Option<Vec<u8>> = None;
    let mut last_pts_us = 0u64;
    let mut last_input_at = Instant::now();

    debug!("{}: worker running", shared.name);

    loop {
        let item = {
            let mut state = shared.state.lock();
            next_work_item(&shared, &mut state, last_input_at, last_frame.is_some())
        };

        let input = match item {
            None => break,
            Some(WorkItem::Input(input)) => input,
            Some(WorkItem::RepeatLastFrame) => match last_frame.take() {
                Some(data) => {
                    trace!("{}: repeating previous frame", shared.name);
                    PendingInput {
                        slot_index: None,
                        size: data.len(),
                        data,
                        presentation_time_us: last_pts_us
                            + last_input_at.elapsed().as_micros() as u64,
                        flags: SampleFlags::NONE,
                    }
                }
                None => continue,
            },
        };
        last_input_at = Instant::now();
        last_pts_us = input.presentation_time_us;

        let mut out = BytesMut::with_capacity(input.size / 4 + 16);
        let result = if input.size == 0 {
            Ok(false)
        } else {
            compressor.compress(&input.data[..input.size], &mut out)
        };

        let mut state = shared.state.lock();
        match input.slot_index {
            Some(index) => {
                state.free_slots.push(InputBuffer {
                    index,
                    data: input.data,
                });
                shared.input_available.notify_one();
            }
            None => last_frame = Some(input.data),
        }

        let key_frame = match result {
            Ok(key_frame) => key_frame,
            Err(e) => {
                error!("{}: compression failed: {}", shared.name, e);
                state.failure = Some(e.to_string());
                shared.output_available.notify_all();
                break;
            }
        };

        while state.phase == CodecPhase::Running
            && state.outputs.len() + state.held.len() >= MAX_OUTSTANDING_OUTPUTS
        {
            shared.output_released.wait(&mut state);
        }
        if state.phase != CodecPhase::Running {
            break;
        }

        if !announced {
            state
                .outputs
                .push_back(QueuedOutput::Format(compressor.output_format()));
            if let Some(config) = compressor.codec_config() {
                state.push_sample(
                    config,
                    0,
                    SampleFlags {
                        codec_config: true,
                        ..SampleFlags::NONE
                    },
                );
            }
            announced = true;
        }

        let end_of_stream = input.flags.end_of_stream;
        if !out.is_empty() || end_of_stream {
            state.push_sample(
                out.freeze(),
                input.presentation_time_us,
                SampleFlags {
                    key_frame,
                    codec_config: false,
                    end_of_stream,
                },
            );
        }
        shared.output_available.notify_all();

        if end_of_stream {
            debug!("{}: end of input stream", shared.name);
            break;
        }
    }

    debug!("{}: worker exiting", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioFormat, MIME_AUDIO_IMA_ADPCM};

    /// Copies input through, marking every sample as sync
    struct Passthrough;

    impl Compressor for Passthrough {
        fn output_format(&self) -> MediaFormat {
            test_format()
        }

        fn codec_config(&self) -> Option<Bytes> {
            Some(Bytes::from_static(b"cfg"))
        }

        fn input_buffer_size(&self) -> usize {
            16
        }

        fn compress(&mut self, input: &[u8], out: &mut BytesMut) -> CodecResult<bool> {
            out.extend_from_slice(input);
            Ok(true)
        }
    }

    fn test_format() -> MediaFormat {
        MediaFormat::Audio(AudioFormat {
            mime: MIME_AUDIO_IMA_ADPCM.to_string(),
            sample_rate: 8000,
            channel_count: 1,
            bit_rate: 32000,
            max_input_size: 16,
        })
    }

    fn passthrough_codec() -> BufferQueueCodec {
        BufferQueueCodec::new("passthrough", |_format: &MediaFormat| {
            Ok(Box::new(Passthrough) as Box<dyn Compressor>)
        })
    }

    fn next_event(codec: &BufferQueueCodec) -> OutputEvent {
        for _ in 0..100 {
            match codec.dequeue_output_buffer(Duration::from_millis(20)).unwrap() {
                OutputEvent::TryAgain => continue,
                event => return event,
            }
        }
        panic!("codec produced no output");
    }

    #[test]
    fn test_dequeue_before_start_is_illegal() {
        let codec = passthrough_codec();
        assert!(matches!(
            codec.dequeue_input_buffer(Duration::ZERO),
            Err(CodecError::IllegalState { .. })
        ));
        codec.configure(&test_format()).unwrap();
        assert!(matches!(
            codec.dequeue_output_buffer(Duration::ZERO),
            Err(CodecError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_format_announced_once_before_data() {
        let codec = passthrough_codec();
        codec.configure(&test_format()).unwrap();
        codec.start().unwrap();

        assert!(matches!(
            codec.dequeue_output_buffer(Duration::ZERO).unwrap(),
            OutputEvent::TryAgain
        ));

        for pts in [10u64, 20] {
            let mut input = codec
                .dequeue_input_buffer(Duration::from_millis(100))
                .unwrap()
                .expect("free slot");
            input.as_mut_slice()[..4].copy_from_slice(b"abcd");
            codec
                .queue_input_buffer(input, 4, pts, SampleFlags::NONE)
                .unwrap();
        }

        assert!(matches!(next_event(&codec), OutputEvent::FormatChanged(_)));
        assert_eq!(codec.output_format().unwrap(), test_format());

        let config = match next_event(&codec) {
            OutputEvent::Buffer(b) => b,
            other => panic!("expected codec config, got {:?}", other),
        };
        assert!(config.info.flags.codec_config);
        codec.release_output_buffer(config.index).unwrap();

        for expected_pts in [10u64, 20] {
            match next_event(&codec) {
                OutputEvent::Buffer(b) => {
                    assert_eq!(b.payload(), b"abcd");
                    assert_eq!(b.info.presentation_time_us, expected_pts);
                    codec.release_output_buffer(b.index).unwrap();
                }
                other => panic!("expected sample, got {:?}", other),
            }
        }

        codec.stop().unwrap();
        codec.release();
        assert_eq!(codec.phase(), CodecPhase::Released);
    }

    #[test]
    fn test_release_unknown_buffer_fails() {
        let codec = passthrough_codec();
        codec.configure(&test_format()).unwrap();
        codec.start().unwrap();
        assert!(matches!(
            codec.release_output_buffer(42),
            Err(CodecError::UnknownBuffer { index: 42, .. })
        ));
    }

    #[test]
    fn test_oversized_input_returns_slot() {
        let codec = passthrough_codec();
        codec.configure(&test_format()).unwrap();
        codec.start().unwrap();

        let mut claimed = Vec::new();
        while let Some(buffer) = codec.dequeue_input_buffer(Duration::ZERO).unwrap() {
            claimed.push(buffer);
        }
        assert_eq!(claimed.len(), INPUT_SLOTS);

        let buffer = claimed.pop().unwrap();
        assert!(matches!(
            codec.queue_input_buffer(buffer, 17, 0, SampleFlags::NONE),
            Err(CodecError::BufferOverflow { .. })
        ));
        assert!(codec.dequeue_input_buffer(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn test_end_of_stream_propagates() {
        let codec = passthrough_codec();
        codec.configure(&test_format()).unwrap();
        codec.start().unwrap();

        let input = codec
            .dequeue_input_buffer(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        codec
            .queue_input_buffer(input, 0, 5, SampleFlags::END_OF_STREAM)
            .unwrap();

        let mut saw_eos = false;
        for _ in 0..3 {
            if let OutputEvent::Buffer(b) = next_event(&codec) {
                codec.release_output_buffer(b.index).unwrap();
                if b.info.flags.end_of_stream {
                    saw_eos = true;
                    break;
                }
            }
        }
        assert!(saw_eos);
    }

    #[test]
    fn test_surface_requires_surface_capable_compressor() {
        let codec = passthrough_codec();
        codec.configure(&test_format()).unwrap();
        assert!(codec.create_input_surface().is_err());
    }
}
