//! Real-time encoders exposed as buffer-queue state machines.
//!
//! An encoder has two independent queues: producers claim input slots with
//! [`Encoder::dequeue_input_buffer`] and hand them back filled with
//! [`Encoder::queue_input_buffer`]; the controller drains compressed output
//! with [`Encoder::dequeue_output_buffer`] and returns each buffer with
//! [`Encoder::release_output_buffer`]. Surface encoders take their input from
//! an [`InputSurface`] instead of input slots.

pub mod adpcm;
pub mod queue;
pub mod screen;
pub mod surface;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use adpcm::{AdpcmCompressor, AdpcmDecoder};
pub use queue::{BufferQueueCodec, CodecPhase, Compressor};
pub use screen::{ScreenCompressor, ScreenDecoder};
pub use surface::{InputSurface, SurfaceSink};

/// Lossless delta/run-length screen codec
pub const MIME_VIDEO_SCREEN_RLE: &str = "video/x-screen-rle";
/// 4-bit IMA ADPCM
pub const MIME_AUDIO_IMA_ADPCM: &str = "audio/x-ima-adpcm";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{codec}: cannot {operation} while {phase}")]
    IllegalState {
        codec: String,
        operation: &'static str,
        phase: CodecPhase,
    },

    #[error("No encoder available for {0}")]
    UnsupportedMime(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("{codec}: unknown buffer index {index}")]
    UnknownBuffer { codec: String, index: usize },

    #[error("{codec}: {size} bytes exceed buffer capacity {capacity}")]
    BufferOverflow {
        codec: String,
        size: usize,
        capacity: usize,
    },

    #[error("Corrupt sample: {0}")]
    CorruptSample(String),

    #[error("{codec}: {message}")]
    Failed { codec: String, message: String },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// One of the two elementary streams of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    /// Frames arrive through an input surface
    Surface,
    /// Packed 8-bit BGRA
    Bgra8888,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub i_frame_interval_secs: u32,
    pub color_format: ColorFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_previous_frame_after_us: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub mime: String,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_rate: u32,
    /// Size of each input slot in bytes (0 = codec default)
    #[serde(default)]
    pub max_input_size: usize,
}

/// Encoder configuration and, once announced, the final stream format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl MediaFormat {
    pub fn kind(&self) -> StreamKind {
        match self {
            MediaFormat::Video(_) => StreamKind::Video,
            MediaFormat::Audio(_) => StreamKind::Audio,
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            MediaFormat::Video(v) => &v.mime,
            MediaFormat::Audio(a) => &a.mime,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub key_frame: bool,
    /// Codec-specific setup data, not media
    pub codec_config: bool,
    pub end_of_stream: bool,
}

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags {
        key_frame: false,
        codec_config: false,
        end_of_stream: false,
    };

    pub const END_OF_STREAM: SampleFlags = SampleFlags {
        key_frame: false,
        codec_config: false,
        end_of_stream: true,
    };

    const KEY_FRAME_BIT: u8 = 0x01;
    const CODEC_CONFIG_BIT: u8 = 0x02;
    const END_OF_STREAM_BIT: u8 = 0x04;

    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.key_frame {
            bits |= Self::KEY_FRAME_BIT;
        }
        if self.codec_config {
            bits |= Self::CODEC_CONFIG_BIT;
        }
        if self.end_of_stream {
            bits |= Self::END_OF_STREAM_BIT;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            key_frame: bits & Self::KEY_FRAME_BIT != 0,
            codec_config: bits & Self::CODEC_CONFIG_BIT != 0,
            end_of_stream: bits & Self::END_OF_STREAM_BIT != 0,
        }
    }
}

/// Metadata of one compressed sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: u64,
    pub flags: SampleFlags,
}

/// An input slot claimed from an encoder.
///
/// The backing storage moves to the caller on dequeue and back to the encoder
/// on queue, so a slot is never visible to both sides at once.
#[derive(Debug)]
pub struct InputBuffer {
    index: usize,
    data: Vec<u8>,
}

impl InputBuffer {
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0; capacity],
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn into_parts(self) -> (usize, Vec<u8>) {
        (self.index, self.data)
    }
}

/// A compressed sample held by the consumer until released
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub data: Bytes,
    pub info: BufferInfo,
}

impl OutputBuffer {
    /// The valid payload bytes described by `info`
    pub fn payload(&self) -> &[u8] {
        let end = (self.info.offset + self.info.size).min(self.data.len());
        &self.data[self.info.offset.min(end)..end]
    }
}

/// Result of polling an encoder's output queue
#[derive(Debug)]
pub enum OutputEvent {
    /// Nothing ready yet; poll again later
    TryAgain,
    /// The stream format is final; emitted once before any data
    FormatChanged(MediaFormat),
    /// A compressed sample is ready
    Buffer(OutputBuffer),
}

/// Buffer-queue encoder contract.
///
/// All methods take `&self`: the input side is driven by a capture thread
/// while the output side is drained by the pipeline controller.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, format: &MediaFormat) -> CodecResult<()>;

    /// Must be called after `configure` and before `start`
    fn create_input_surface(&self) -> CodecResult<InputSurface> {
        Err(CodecError::InvalidFormat(format!(
            "{} does not accept surface input",
            self.name()
        )))
    }

    fn start(&self) -> CodecResult<()>;

    /// Claim a free input slot, waiting at most `timeout`
    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<Option<InputBuffer>>;

    /// Submit `size` bytes of a claimed slot for compression
    fn queue_input_buffer(
        &self,
        buffer: InputBuffer,
        size: usize,
        presentation_time_us: u64,
        flags: SampleFlags,
    ) -> CodecResult<()>;

    /// Poll the output queue, waiting at most `timeout`
    fn dequeue_output_buffer(&self, timeout: Duration) -> CodecResult<OutputEvent>;

    fn output_format(&self) -> CodecResult<MediaFormat>;

    fn release_output_buffer(&self, index: usize) -> CodecResult<()>;

    fn stop(&self) -> CodecResult<()>;

    /// Free all resources; safe to call in any phase
    fn release(&self);
}

/// Create an unconfigured encoder for `mime`
pub fn create_encoder_by_type(mime: &str) -> CodecResult<Arc<dyn Encoder>> {
    match mime {
        MIME_VIDEO_SCREEN_RLE => Ok(Arc::new(BufferQueueCodec::new(
            "screen-rle-encoder",
            |format: &MediaFormat| match format {
                MediaFormat::Video(video) => {
                    Ok(Box::new(ScreenCompressor::new(video)?) as Box<dyn Compressor>)
                }
                other => Err(CodecError::InvalidFormat(format!(
                    "screen encoder cannot take {} input",
                    other.kind()
                ))),
            },
        ))),
        MIME_AUDIO_IMA_ADPCM => Ok(Arc::new(BufferQueueCodec::new(
            "ima-adpcm-encoder",
            |format: &MediaFormat| match format {
                MediaFormat::Audio(audio) => {
                    Ok(Box::new(AdpcmCompressor::new(audio)?) as Box<dyn Compressor>)
                }
                other => Err(CodecError::InvalidFormat(format!(
                    "ADPCM encoder cannot take {} input",
                    other.kind()
                ))),
            },
        ))),
        other => Err(CodecError::UnsupportedMime(other.to_string())),
    }
}
