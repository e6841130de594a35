use bytes::{Buf, Bytes};
use std::path::Path;

use super::{
    ContainerSummary, MuxError, MuxResult, TrackEntry, END_MAGIC, FORMAT_VERSION, MAGIC,
    TAG_SAMPLE, TAG_TRAILER,
};
use crate::codec::{SampleFlags, StreamKind};

/// One sample record read back from a container
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub track: usize,
    pub flags: SampleFlags,
    pub presentation_time_us: u64,
    pub data: Bytes,
}

/// A fully parsed and validated container
#[derive(Debug, Clone)]
pub struct Container {
    pub version: u16,
    pub tracks: Vec<TrackEntry>,
    pub samples: Vec<SampleRecord>,
    pub summary: ContainerSummary,
}

impl Container {
    pub fn track(&self, kind: StreamKind) -> Option<&TrackEntry> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn samples_for(&self, track: usize) -> impl Iterator<Item = &SampleRecord> {
        self.samples.iter().filter(move |s| s.track == track)
    }

    /// True when every track's timestamps never decrease
    pub fn timestamps_non_decreasing(&self) -> bool {
        self.tracks.iter().all(|track| {
            self.samples_for(track.index)
                .zip(self.samples_for(track.index).skip(1))
                .all(|(a, b)| b.presentation_time_us >= a.presentation_time_us)
        })
    }

    pub fn timestamps_strictly_increasing(&self, track: usize) -> bool {
        self.samples_for(track)
            .zip(self.samples_for(track).skip(1))
            .all(|(a, b)| b.presentation_time_us > a.presentation_time_us)
    }
}

pub struct ContainerReader;

impl ContainerReader {
    pub fn read_file(path: impl AsRef<Path>) -> MuxResult<Container> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::parse(Bytes::from(bytes))
    }

    pub fn parse(mut buf: Bytes) -> MuxResult<Container> {
        need(&buf, MAGIC.len() + 2 + 4, "header")?;
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(MuxError::Malformed("bad magic".to_string()));
        }
        buf.advance(MAGIC.len());

        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(MuxError::Malformed(format!(
                "unsupported version {}",
                version
            )));
        }

        let table_len = buf.get_u32_le() as usize;
        need(&buf, table_len, "track table")?;
        let tracks: Vec<TrackEntry> = serde_json::from_slice(&buf.split_to(table_len))?;
        for (position, track) in tracks.iter().enumerate() {
            if track.index != position || track.format.kind() != track.kind {
                return Err(MuxError::Malformed(format!(
                    "inconsistent track table entry {}",
                    position
                )));
            }
        }

        let mut samples = Vec::new();
        loop {
            need(&buf, 1, "record tag")?;
            match buf.get_u8() {
                TAG_SAMPLE => {
                    need(&buf, 1 + 1 + 8 + 4, "sample header")?;
                    let track = buf.get_u8() as usize;
                    let flags = SampleFlags::from_bits(buf.get_u8());
                    let presentation_time_us = buf.get_u64_le();
                    let size = buf.get_u32_le() as usize;
                    if track >= tracks.len() {
                        return Err(MuxError::UnknownTrack(track));
                    }
                    need(&buf, size, "sample payload")?;
                    samples.push(SampleRecord {
                        track,
                        flags,
                        presentation_time_us,
                        data: buf.split_to(size),
                    });
                }
                TAG_TRAILER => break,
                other => {
                    return Err(MuxError::Malformed(format!(
                        "unknown record tag 0x{:02x}",
                        other
                    )))
                }
            }
        }

        need(&buf, 4, "trailer")?;
        let summary_len = buf.get_u32_le() as usize;
        need(&buf, summary_len + END_MAGIC.len(), "trailer")?;
        let summary: ContainerSummary = serde_json::from_slice(&buf.split_to(summary_len))?;
        if &buf[..END_MAGIC.len()] != END_MAGIC {
            return Err(MuxError::Malformed("missing end marker".to_string()));
        }
        buf.advance(END_MAGIC.len());
        if buf.has_remaining() {
            return Err(MuxError::Malformed(format!(
                "{} trailing bytes after end marker",
                buf.remaining()
            )));
        }

        for track in &summary.tracks {
            let written = samples.iter().filter(|s| s.track == track.index).count() as u64;
            if written != track.samples {
                return Err(MuxError::Malformed(format!(
                    "track {} summary lists {} samples, found {}",
                    track.index, track.samples, written
                )));
            }
        }

        Ok(Container {
            version,
            tracks,
            samples,
            summary,
        })
    }
}

fn need(buf: &Bytes, len: usize, what: &str) -> MuxResult<()> {
    if buf.remaining() < len {
        return Err(MuxError::Malformed(format!("truncated {}", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        AudioFormat, BufferInfo, ColorFormat, MediaFormat, VideoFormat, MIME_AUDIO_IMA_ADPCM,
        MIME_VIDEO_SCREEN_RLE,
    };
    use crate::mux::{ContainerMuxer, MediaMuxer};
    use tempfile::TempDir;

    fn write_container(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("out.srec");
        let mut muxer = ContainerMuxer::new(&path).unwrap();
        let video = muxer
            .add_track(&MediaFormat::Video(VideoFormat {
                mime: MIME_VIDEO_SCREEN_RLE.to_string(),
                width: 64,
                height: 32,
                bit_rate: 245_760,
                frame_rate: 30,
                i_frame_interval_secs: 5,
                color_format: ColorFormat::Surface,
                repeat_previous_frame_after_us: Some(1_000_000),
            }))
            .unwrap();
        let audio = muxer
            .add_track(&MediaFormat::Audio(AudioFormat {
                mime: MIME_AUDIO_IMA_ADPCM.to_string(),
                sample_rate: 44100,
                channel_count: 1,
                bit_rate: 64000,
                max_input_size: 0,
            }))
            .unwrap();
        muxer.start().unwrap();

        for (i, track) in [audio, video, audio, video].into_iter().enumerate() {
            let payload = vec![i as u8; 10 + i];
            let info = BufferInfo {
                offset: 0,
                size: payload.len(),
                presentation_time_us: i as u64 * 1000,
                flags: SampleFlags {
                    key_frame: track == video,
                    ..SampleFlags::NONE
                },
            };
            muxer.write_sample(track, &payload, &info).unwrap();
        }
        muxer.stop().unwrap();
        path
    }

    #[test]
    fn test_reads_back_tracks_and_samples() {
        let dir = TempDir::new().unwrap();
        let container = ContainerReader::read_file(write_container(&dir)).unwrap();

        assert_eq!(container.tracks.len(), 2);
        let video = container.track(StreamKind::Video).unwrap();
        let audio = container.track(StreamKind::Audio).unwrap();
        assert_eq!(container.samples_for(video.index).count(), 2);
        assert_eq!(container.samples_for(audio.index).count(), 2);
        assert!(container.samples_for(video.index).all(|s| s.flags.key_frame));
        assert_eq!(container.samples[3].data.len(), 13);
        assert!(container.timestamps_non_decreasing());
        assert_eq!(container.summary.tracks[audio.index].last_pts_us, Some(2000));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = TempDir::new().unwrap();
        let bytes = std::fs::read(write_container(&dir)).unwrap();
        for cut in [3, 20, bytes.len() - 10, bytes.len() - 1] {
            let truncated = Bytes::copy_from_slice(&bytes[..cut]);
            assert!(ContainerReader::parse(truncated).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bytes = std::fs::read(write_container(&dir)).unwrap();
        bytes.push(0);
        assert!(ContainerReader::parse(Bytes::from(bytes)).is_err());
    }
}
