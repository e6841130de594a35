use bytes::{BufMut, BytesMut};
use chrono::Utc;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{
    ContainerSummary, MediaMuxer, MuxError, MuxResult, TrackEntry, TrackSummary, END_MAGIC,
    FORMAT_VERSION, MAGIC, SAMPLE_HEADER_LEN, TAG_SAMPLE, TAG_TRAILER,
};
use crate::codec::{BufferInfo, MediaFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    Stopped,
    Released,
}

/// Muxer writing the `.srec` container.
///
/// Nothing touches the destination until `start`; samples then go to a
/// temporary file beside it, which `stop` completes and renames into place.
pub struct ContainerMuxer {
    path: PathBuf,
    tracks: Vec<TrackEntry>,
    summaries: Vec<TrackSummary>,
    output: Option<BufWriter<NamedTempFile>>,
    record: BytesMut,
    phase: Phase,
}

impl ContainerMuxer {
    pub fn new(path: impl Into<PathBuf>) -> MuxResult<Self> {
        let path = path.into();
        fs::create_dir_all(output_dir(&path))?;

        Ok(Self {
            path,
            tracks: Vec::new(),
            summaries: Vec::new(),
            output: None,
            record: BytesMut::with_capacity(SAMPLE_HEADER_LEN),
            phase: Phase::Idle,
        })
    }

    fn writer(&mut self) -> MuxResult<&mut BufWriter<NamedTempFile>> {
        match self.phase {
            Phase::Started => self.output.as_mut().ok_or(MuxError::NotStarted),
            Phase::Released => Err(MuxError::Released),
            Phase::Idle | Phase::Stopped => Err(MuxError::NotStarted),
        }
    }
}

fn output_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

impl MediaMuxer for ContainerMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> MuxResult<usize> {
        match self.phase {
            Phase::Idle => {}
            Phase::Released => return Err(MuxError::Released),
            Phase::Started | Phase::Stopped => return Err(MuxError::AlreadyStarted),
        }
        let kind = format.kind();
        if self.tracks.iter().any(|t| t.kind == kind) {
            return Err(MuxError::DuplicateTrack(kind));
        }

        let index = self.tracks.len();
        let entry = TrackEntry {
            index,
            kind,
            format: format.clone(),
        };
        self.summaries.push(TrackSummary::new(&entry));
        self.tracks.push(entry);

        info!("Added {} track {} ({})", kind, index, format.mime());
        Ok(index)
    }

    fn start(&mut self) -> MuxResult<()> {
        match self.phase {
            Phase::Idle => {}
            Phase::Released => return Err(MuxError::Released),
            Phase::Started | Phase::Stopped => return Err(MuxError::AlreadyStarted),
        }
        if self.tracks.is_empty() {
            return Err(MuxError::NoTracks);
        }

        let temp = tempfile::Builder::new()
            .prefix(".screen-recording-")
            .suffix(".part")
            .tempfile_in(output_dir(&self.path))?;
        let mut output = BufWriter::new(temp);

        let table = serde_json::to_vec(&self.tracks)?;
        let mut header = BytesMut::with_capacity(MAGIC.len() + 6 + table.len());
        header.put_slice(MAGIC);
        header.put_u16_le(FORMAT_VERSION);
        header.put_u32_le(table.len() as u32);
        header.put_slice(&table);
        output.write_all(&header)?;

        self.output = Some(output);
        self.phase = Phase::Started;
        info!(
            "Muxer started with {} tracks -> {}",
            self.tracks.len(),
            self.path.display()
        );
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.phase == Phase::Started
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MuxResult<()> {
        self.writer()?;
        let summary = self
            .summaries
            .get_mut(track)
            .ok_or(MuxError::UnknownTrack(track))?;
        if let Some(last_us) = summary.last_pts_us {
            if info.presentation_time_us < last_us {
                return Err(MuxError::TimestampRegression {
                    track,
                    pts_us: info.presentation_time_us,
                    last_us,
                });
            }
        }

        let end = (info.offset + info.size).min(data.len());
        let payload = &data[info.offset.min(end)..end];

        summary.samples += 1;
        summary.bytes += payload.len() as u64;
        summary.first_pts_us.get_or_insert(info.presentation_time_us);
        summary.last_pts_us = Some(info.presentation_time_us);

        self.record.clear();
        self.record.put_u8(TAG_SAMPLE);
        self.record.put_u8(track as u8);
        self.record.put_u8(info.flags.to_bits());
        self.record.put_u64_le(info.presentation_time_us);
        self.record.put_u32_le(payload.len() as u32);

        let record = std::mem::take(&mut self.record);
        let result = self.writer().and_then(|output| {
            output.write_all(&record)?;
            output.write_all(payload)?;
            Ok(())
        });
        self.record = record;
        result
    }

    fn stop(&mut self) -> MuxResult<()> {
        self.writer()?;
        let mut output = self.output.take().ok_or(MuxError::NotStarted)?;

        let summary = serde_json::to_vec(&ContainerSummary {
            tracks: self.summaries.clone(),
            finished_at: Utc::now(),
        })?;
        let mut trailer = BytesMut::with_capacity(1 + 4 + summary.len() + END_MAGIC.len());
        trailer.put_u8(TAG_TRAILER);
        trailer.put_u32_le(summary.len() as u32);
        trailer.put_slice(&summary);
        trailer.put_slice(END_MAGIC);
        output.write_all(&trailer)?;
        output.flush()?;

        let temp = output.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| MuxError::Io(e.error))?;
        self.phase = Phase::Stopped;

        for track in &self.summaries {
            info!(
                "Track {} ({}): {} samples, {} bytes, {:.2}s",
                track.index,
                track.kind,
                track.samples,
                track.bytes,
                track.duration_us() as f64 / 1_000_000.0
            );
        }
        info!("Recording saved to {}", self.path.display());
        Ok(())
    }

    fn release(&mut self) {
        if self.phase == Phase::Released {
            return;
        }
        if self.output.take().is_some() {
            warn!(
                "Muxer released before stop; discarding partial output for {}",
                self.path.display()
            );
        }
        self.phase = Phase::Released;
        debug!("Muxer released");
    }
}

impl Drop for ContainerMuxer {
    fn drop(&mut self) {
        self.release();
    }
}
