use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub recording: RecordingConfig,
    pub display: DisplayConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Fixed path of the output container
    pub output_path: PathBuf,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Audio bitrate in bits/second
    pub audio_bitrate: u32,
    /// Presentation times are divided by this factor (1 = real time)
    pub time_lapse: u32,
    pub key_frame_interval_secs: u32,
    /// Re-encode the last frame when the compositor is idle this long (0 = never)
    pub repeat_previous_frame_after_ms: u64,
}

/// Native resolution of the captured display
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    /// Generated sine tone
    Tone,
    /// PCM read from a WAV file
    Wav,
    /// Live input device (requires the `cpal` feature)
    Cpal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub source: AudioSourceKind,
    pub tone_hz: f32,
    pub wav_path: Option<PathBuf>,
    pub loop_wav: bool,
}

impl Config {
    /// Load configuration from `path` (extension optional), layered with
    /// `SCREEN_RECORDER__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SCREEN_RECORDER").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "screen-recorder".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("recordings/screen-recording.srec"),
            frame_rate: 30,
            sample_rate: 44100,
            channels: 1,
            audio_bitrate: 64000,
            time_lapse: 1,
            key_frame_interval_secs: 5,
            repeat_previous_frame_after_ms: 1000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 2560,
            height: 1440,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: AudioSourceKind::Tone,
            tone_hz: 440.0,
            wav_path: None,
            loop_wav: true,
        }
    }
}
