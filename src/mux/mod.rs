//! Container muxing.
//!
//! A muxer registers one track per stream as each encoder announces its final
//! format, starts once every track is known, and from then on interleaves
//! compressed samples in the order they are written.

mod reader;
mod writer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{BufferInfo, MediaFormat, StreamKind};

pub use reader::{Container, ContainerReader, SampleRecord};
pub use writer::ContainerMuxer;

const MAGIC: &[u8; 4] = b"SREC";
const END_MAGIC: &[u8; 4] = b"SEND";
const FORMAT_VERSION: u16 = 1;
const TAG_SAMPLE: u8 = 0x01;
const TAG_TRAILER: u8 = 0xFF;
/// tag + track + flags + pts + size
const SAMPLE_HEADER_LEN: usize = 1 + 1 + 1 + 8 + 4;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Muxer has not been started")]
    NotStarted,

    #[error("Muxer was already started")]
    AlreadyStarted,

    #[error("Muxer was released")]
    Released,

    #[error("A {0} track is already registered")]
    DuplicateTrack(StreamKind),

    #[error("Unknown track index {0}")]
    UnknownTrack(usize),

    #[error("Cannot start without tracks")]
    NoTracks,

    #[error("Track {track}: timestamp {pts_us}us precedes {last_us}us")]
    TimestampRegression { track: usize, pts_us: u64, last_us: u64 },

    #[error("Malformed container: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Track table encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MuxResult<T> = Result<T, MuxError>;

/// One registered track, as stored in the container header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub index: usize,
    pub kind: StreamKind,
    pub format: MediaFormat,
}

/// Per-track totals written in the trailer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub index: usize,
    pub kind: StreamKind,
    pub samples: u64,
    pub bytes: u64,
    pub first_pts_us: Option<u64>,
    pub last_pts_us: Option<u64>,
}

impl TrackSummary {
    fn new(entry: &TrackEntry) -> Self {
        Self {
            index: entry.index,
            kind: entry.kind,
            samples: 0,
            bytes: 0,
            first_pts_us: None,
            last_pts_us: None,
        }
    }

    pub fn duration_us(&self) -> u64 {
        match (self.first_pts_us, self.last_pts_us) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub tracks: Vec<TrackSummary>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Writer side of the container contract.
///
/// `write_sample` is only valid between `start` and `stop`; `release` frees
/// the muxer in any state and discards anything not yet finalized by `stop`.
pub trait MediaMuxer: Send {
    /// Register a track for a final stream format; returns its index
    fn add_track(&mut self, format: &MediaFormat) -> MuxResult<usize>;

    fn start(&mut self) -> MuxResult<()>;

    fn is_started(&self) -> bool;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MuxResult<()>;

    fn stop(&mut self) -> MuxResult<()>;

    fn release(&mut self);
}
