use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::{
    AudioFormat, ColorFormat, VideoFormat, MIME_AUDIO_IMA_ADPCM, MIME_VIDEO_SCREEN_RLE,
};
use crate::config::RecordingConfig;
use crate::pipeline::DisplayMetrics;
use crate::sizing::{calc_bitrate, scale_to_fit};

/// Immutable parameters of one recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fixed path of the output container
    pub output_path: PathBuf,

    /// Encode resolution after the sizing policy
    pub width: u32,
    pub height: u32,

    /// Video bitrate in bits/second
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
    pub repeat_previous_frame_after_ms: u64,

    pub sample_rate: u32,
    pub channels: u16,
    pub audio_bit_rate: u32,

    /// Presentation times are divided by this factor
    pub time_lapse: u32,

    pub video_mime: String,
    pub audio_mime: String,
}

impl SessionConfig {
    /// Derive the session parameters for a display of the given native size
    pub fn for_display(recording: &RecordingConfig, display: DisplayMetrics) -> Result<Self> {
        if recording.frame_rate == 0 {
            bail!("recording.frame_rate must be non-zero");
        }
        if recording.sample_rate == 0 || recording.channels == 0 {
            bail!("recording.sample_rate and recording.channels must be non-zero");
        }

        let (width, height) = scale_to_fit(display.width, display.height)?;
        let bit_rate = calc_bitrate(recording.frame_rate, width, height);

        Ok(Self {
            output_path: recording.output_path.clone(),
            width,
            height,
            bit_rate,
            frame_rate: recording.frame_rate,
            key_frame_interval_secs: recording.key_frame_interval_secs,
            repeat_previous_frame_after_ms: recording.repeat_previous_frame_after_ms,
            sample_rate: recording.sample_rate,
            channels: recording.channels,
            audio_bit_rate: recording.audio_bitrate,
            time_lapse: recording.time_lapse.max(1),
            video_mime: MIME_VIDEO_SCREEN_RLE.to_string(),
            audio_mime: MIME_AUDIO_IMA_ADPCM.to_string(),
        })
    }

    pub fn repeat_previous_frame_after(&self) -> Option<Duration> {
        match self.repeat_previous_frame_after_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn video_format(&self) -> VideoFormat {
        VideoFormat {
            mime: self.video_mime.clone(),
            width: self.width,
            height: self.height,
            bit_rate: self.bit_rate,
            frame_rate: self.frame_rate,
            i_frame_interval_secs: self.key_frame_interval_secs,
            color_format: ColorFormat::Surface,
            repeat_previous_frame_after_us: self
                .repeat_previous_frame_after()
                .map(|d| d.as_micros() as u64),
        }
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            mime: self.audio_mime.clone(),
            sample_rate: self.sample_rate,
            channel_count: self.channels,
            bit_rate: self.audio_bit_rate,
            max_input_size: 0,
        }
    }
}
