use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::capture::{
    AudioCaptureDevice, AudioDeviceParams, DisplayRequest, SyntheticDisplay, ToneDevice,
    VirtualDisplay, WavDevice,
};
use crate::codec::{create_encoder_by_type, Encoder};
use crate::config::{AudioConfig, AudioSourceKind, Config};
use crate::error::BoxError;
use crate::mux::{ContainerMuxer, MediaMuxer};

/// Native resolution of the display being captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
}

/// Factory for every platform resource a session acquires.
///
/// The controller owns whatever this hands out and releases it itself.
pub trait MediaBackend: Send + Sync {
    fn display_metrics(&self) -> DisplayMetrics;

    fn create_video_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError>;

    fn create_audio_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError>;

    fn create_virtual_display(
        &self,
        request: DisplayRequest,
    ) -> Result<Box<dyn VirtualDisplay>, BoxError>;

    fn create_audio_device(
        &self,
        params: AudioDeviceParams,
    ) -> Result<Box<dyn AudioCaptureDevice>, BoxError>;

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn MediaMuxer>, BoxError>;
}

/// Portable backend: software codecs, a synthetic compositor and the
/// configured audio source
#[derive(Debug, Clone)]
pub struct SoftwareBackend {
    display: DisplayMetrics,
    audio: AudioConfig,
}

impl SoftwareBackend {
    pub fn new(display: DisplayMetrics, audio: AudioConfig) -> Self {
        Self { display, audio }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            DisplayMetrics {
                width: config.display.width,
                height: config.display.height,
            },
            config.audio.clone(),
        )
    }
}

impl MediaBackend for SoftwareBackend {
    fn display_metrics(&self) -> DisplayMetrics {
        self.display
    }

    fn create_video_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError> {
        Ok(create_encoder_by_type(mime)?)
    }

    fn create_audio_encoder(&self, mime: &str) -> Result<Arc<dyn Encoder>, BoxError> {
        Ok(create_encoder_by_type(mime)?)
    }

    fn create_virtual_display(
        &self,
        request: DisplayRequest,
    ) -> Result<Box<dyn VirtualDisplay>, BoxError> {
        Ok(Box::new(SyntheticDisplay::start(request)?))
    }

    fn create_audio_device(
        &self,
        params: AudioDeviceParams,
    ) -> Result<Box<dyn AudioCaptureDevice>, BoxError> {
        match self.audio.source {
            AudioSourceKind::Tone => Ok(Box::new(ToneDevice::new(params, self.audio.tone_hz))),
            AudioSourceKind::Wav => {
                let path = self
                    .audio
                    .wav_path
                    .as_deref()
                    .ok_or("audio.source is 'wav' but audio.wav_path is not set")?;
                Ok(Box::new(WavDevice::open(path, params, self.audio.loop_wav)?))
            }
            #[cfg(feature = "cpal")]
            AudioSourceKind::Cpal => Ok(Box::new(crate::capture::CpalDevice::new(params, None))),
            #[cfg(not(feature = "cpal"))]
            AudioSourceKind::Cpal => {
                Err("audio.source 'cpal' requires building with the `cpal` feature".into())
            }
        }
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn MediaMuxer>, BoxError> {
        info!("Output container: {}", path.display());
        Ok(Box::new(ContainerMuxer::new(path)?))
    }
}
