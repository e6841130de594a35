//! Capture sources: the display mirror feeding the video encoder's surface and
//! the audio capture thread feeding the audio encoder's input queue.

#[cfg(feature = "cpal")]
mod cpal_device;
mod device;
mod display;
mod feeder;

#[cfg(feature = "cpal")]
pub use cpal_device::CpalDevice;
pub use device::{AudioCaptureDevice, AudioDeviceParams, ToneDevice, WavDevice};
pub use display::{
    DisplayCallback, DisplayRequest, DisplayStopTrigger, SyntheticDisplay, VirtualDisplay,
};
pub use feeder::{AudioFeeder, FeederContext, FeederStats, INPUT_TIMEOUT};
