//! Live input device through cpal.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on its own thread and
//! hands converted samples to `read` through a bounded buffer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::device::{convert, AudioCaptureDevice, AudioDeviceParams};

/// Longest `read` waits for the device before reporting a stall
const READ_TIMEOUT: Duration = Duration::from_millis(200);

struct Ring {
    samples: VecDeque<i16>,
    capacity: usize,
    failure: Option<String>,
    overruns: u64,
}

struct Shared {
    ring: Mutex<Ring>,
    ready: Condvar,
}

impl Shared {
    fn push(&self, samples: &[i16]) {
        let mut ring = self.ring.lock();
        for &sample in samples {
            if ring.samples.len() >= ring.capacity {
                ring.samples.pop_front();
                ring.overruns += 1;
            }
            ring.samples.push_back(sample);
        }
        self.ready.notify_one();
    }

    fn fail(&self, message: String) {
        self.ring.lock().failure = Some(message);
        self.ready.notify_all();
    }
}

pub struct CpalDevice {
    params: AudioDeviceParams,
    device_name: Option<String>,
    name: String,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Open the named input device, or the host default when `None`
    pub fn new(params: AudioDeviceParams, device_name: Option<String>) -> Self {
        let capacity = (params.buffer_size / 2).max(params.channels as usize);
        Self {
            params,
            name: format!("cpal:{}", device_name.as_deref().unwrap_or("default")),
            device_name,
            shared: Arc::new(Shared {
                ring: Mutex::new(Ring {
                    samples: VecDeque::with_capacity(capacity),
                    capacity,
                    failure: None,
                    overruns: 0,
                }),
                ready: Condvar::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }

    fn join_stream_thread(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.stream_thread.take() {
            if handle.join().is_err() {
                error!("{}: stream thread panicked", self.name);
            }
        }
    }
}

fn find_device(name: Option<&str>) -> io::Result<cpal::Device> {
    let host = cpal::default_host();
    let device = match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false)),
        None => host.default_input_device(),
    };
    device.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("audio input device '{}' not found", name.unwrap_or("default")),
        )
    })
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
    target: AudioDeviceParams,
    to_i16: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    F: Fn(T) -> i16 + Send + 'static,
{
    let in_channels = config.channels;
    let in_rate = config.sample_rate.0;
    let error_shared = Arc::clone(&shared);
    let mut scratch: Vec<i16> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| to_i16(s)));
            let converted = convert(
                &scratch,
                in_channels,
                in_rate,
                target.channels,
                target.sample_rate,
            );
            shared.push(&converted);
        },
        move |err| {
            error!("Audio input stream error: {}", err);
            error_shared.fail(err.to_string());
        },
        None,
    )
}

impl AudioCaptureDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> io::Result<()> {
        if self.stream_thread.is_some() {
            return Ok(());
        }

        let (init_tx, init_rx) = std::sync::mpsc::channel::<io::Result<String>>();
        let device_name = self.device_name.clone();
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let target = self.params;
        running.store(true, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("cpal-input".to_string())
            .spawn(move || {
                let opened = find_device(device_name.as_deref()).and_then(|device| {
                    let supported = device
                        .default_input_config()
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                    let format = supported.sample_format();
                    let config: StreamConfig = supported.into();
                    let stream = match format {
                        SampleFormat::I16 => build_stream::<i16, _>(&device, &config, shared, target, |s| s),
                        SampleFormat::F32 => build_stream::<f32, _>(&device, &config, shared, target, |s| {
                            (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                        }),
                        SampleFormat::U16 => build_stream::<u16, _>(&device, &config, shared, target, |s| {
                            (s as i32 - 32768) as i16
                        }),
                        other => {
                            return Err(io::Error::new(
                                io::ErrorKind::Unsupported,
                                format!("unsupported input sample format {:?}", other),
                            ))
                        }
                    }
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                    stream
                        .play()
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                    let description = format!(
                        "{} ({} Hz, {} ch, {:?})",
                        device.name().unwrap_or_else(|_| "unknown".to_string()),
                        config.sample_rate.0,
                        config.channels,
                        format
                    );
                    Ok((stream, description))
                });

                match opened {
                    Ok((stream, description)) => {
                        let _ = init_tx.send(Ok(description));
                        while running.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                        debug!("Audio input stream closed");
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })?;
        self.stream_thread = Some(handle);

        match init_rx.recv() {
            Ok(Ok(description)) => {
                info!("{} started: {}", self.name, description);
                Ok(())
            }
            Ok(Err(e)) => {
                self.join_stream_thread();
                Err(e)
            }
            Err(_) => {
                self.join_stream_thread();
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "audio input thread exited during startup",
                ))
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not recording", self.name),
            ));
        }

        let frame_samples = self.params.channels.max(1) as usize;
        let wanted = (buf.len() / 2 / frame_samples) * frame_samples;
        let mut ring = self.shared.ring.lock();
        while ring.samples.len() < frame_samples && ring.failure.is_none() {
            if self.shared.ready.wait_for(&mut ring, READ_TIMEOUT).timed_out() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} delivered no audio", self.name),
                ));
            }
        }
        if let Some(failure) = &ring.failure {
            return Err(io::Error::new(io::ErrorKind::Other, failure.clone()));
        }

        let available = (ring.samples.len() / frame_samples) * frame_samples;
        let count = wanted.min(available);
        for (i, sample) in ring.samples.drain(..count).enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
        }
        Ok(count * 2)
    }

    fn stop(&mut self) {
        self.join_stream_thread();
    }

    fn release(&mut self) {
        self.join_stream_thread();
        let mut ring = self.shared.ring.lock();
        if ring.overruns > 0 {
            warn!("{}: {} samples overwritten before read", self.name, ring.overruns);
        }
        ring.samples.clear();
    }
}
