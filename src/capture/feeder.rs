//! Audio capture thread feeding the audio encoder's input queue.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::AudioCaptureDevice;
use crate::codec::{Encoder, SampleFlags};
use crate::pipeline::AsyncErrorFlag;
use crate::timing::PresentationClock;

/// Bounded wait for a free encoder input slot
pub const INPUT_TIMEOUT: Duration = Duration::from_millis(10);

/// Everything the capture thread shares with the controller
pub struct FeederContext {
    pub encoder: Arc<dyn Encoder>,
    pub clock: Arc<PresentationClock>,
    /// Raised by the controller during teardown
    pub audio_stop: CancellationToken,
    /// Raised when the session as a whole is stopping
    pub session_stop: CancellationToken,
    pub async_error: AsyncErrorFlag,
}

impl FeederContext {
    fn is_stopping(&self) -> bool {
        self.audio_stop.is_cancelled() || self.session_stop.is_cancelled()
    }

    /// Report a failure, unless it is an artifact of an ongoing shutdown
    fn fail(&self, message: String) {
        if self.is_stopping() {
            debug!("Audio capture error during shutdown ignored: {}", message);
        } else {
            error!("Audio capture failed: {}", message);
            self.async_error.raise(message);
        }
    }
}

/// Stops and releases the device on every exit path of the thread
struct DeviceGuard(Box<dyn AudioCaptureDevice>);

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.0.stop();
        self.0.release();
        debug!("Audio device {} released", self.0.name());
    }
}

/// Handle to a running audio capture thread
pub struct AudioFeeder {
    audio_stop: CancellationToken,
    handle: Option<JoinHandle<FeederStats>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FeederStats {
    pub buffers_queued: u64,
    pub bytes_read: u64,
    pub end_of_stream: bool,
}

impl AudioFeeder {
    /// Start the capture thread. The device must already be recording.
    pub fn spawn(
        context: FeederContext,
        device: Box<dyn AudioCaptureDevice>,
    ) -> std::io::Result<Self> {
        let audio_stop = context.audio_stop.clone();
        let device = DeviceGuard(device);
        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_feeder(context, device))?;

        Ok(Self {
            audio_stop,
            handle: Some(handle),
        })
    }

    /// Raise the stop flag and wait for the thread to release its device
    pub fn stop_and_join(&mut self) -> FeederStats {
        self.audio_stop.cancel();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!("Audio capture thread panicked");
                FeederStats::default()
            }
            None => FeederStats::default(),
        }
    }
}

impl Drop for AudioFeeder {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_join();
        }
    }
}

/// Best effort; capture continues at normal priority if the OS refuses
fn raise_priority() {
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("Could not raise audio capture thread priority: {:?}", e);
    }
}

fn run_feeder(context: FeederContext, mut device: DeviceGuard) -> FeederStats {
    let mut stats = FeederStats::default();
    raise_priority();
    info!("Audio capture thread started ({})", device.0.name());

    while !context.audio_stop.is_cancelled() {
        let mut input = match context.encoder.dequeue_input_buffer(INPUT_TIMEOUT) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                context.fail(format!("no input buffer: {}", e));
                return stats;
            }
        };

        let read = match device.0.read(input.as_mut_slice()) {
            Ok(read) => read,
            Err(e) => {
                context.fail(format!("read from {} failed: {}", device.0.name(), e));
                break;
            }
        };

        let presentation_time_us = context.clock.now_us();
        let flags = if read == 0 {
            SampleFlags::END_OF_STREAM
        } else {
            SampleFlags::NONE
        };
        if let Err(e) = context
            .encoder
            .queue_input_buffer(input, read, presentation_time_us, flags)
        {
            context.fail(format!("queue input failed: {}", e));
            break;
        }

        if read == 0 {
            info!("Audio source exhausted; end of stream queued");
            stats.end_of_stream = true;
            break;
        }
        stats.buffers_queued += 1;
        stats.bytes_read += read as u64;
    }

    if stats.buffers_queued == 0 && !stats.end_of_stream {
        debug!("Audio capture thread exiting without delivering audio");
    }
    info!(
        "Audio capture thread finished: {} buffers, {} bytes",
        stats.buffers_queued, stats.bytes_read
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_request_is_best_effort() {
        // Unprivileged runs are refused by the OS; the thread must carry on
        let priority = std::thread::spawn(|| {
            raise_priority();
            thread_priority::get_current_thread_priority()
        })
        .join()
        .expect("capture thread panicked");
        assert!(priority.is_ok());
    }
}
