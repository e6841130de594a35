//! Raw PCM capture devices.
//!
//! All devices deliver interleaved 16-bit little-endian PCM at the rate and
//! channel count they were opened with.

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Sample format parameters a device is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDeviceParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Internal buffer size in bytes
    pub buffer_size: usize,
}

impl AudioDeviceParams {
    /// Smallest workable device buffer: 20 ms of PCM
    pub fn min_buffer_size(sample_rate: u32, channels: u16) -> usize {
        (sample_rate as usize / 50).max(1) * frame_bytes(channels)
    }

    /// Parameters with a buffer of four times the minimum size
    pub fn with_headroom(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            buffer_size: 4 * Self::min_buffer_size(sample_rate, channels),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        frame_bytes(self.channels)
    }
}

fn frame_bytes(channels: u16) -> usize {
    channels.max(1) as usize * 2
}

/// A live source of PCM audio.
pub trait AudioCaptureDevice: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> io::Result<()>;

    /// Block until audio is available and copy whole frames into `buf`.
    ///
    /// `Ok(0)` means the source has no more data.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn stop(&mut self);

    fn release(&mut self);
}

fn not_started(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{} is not recording", name),
    )
}

/// Sleeps so that delivered frames track wall-clock time
#[derive(Debug)]
struct Pacer {
    sample_rate: u32,
    started: Option<Instant>,
    frames: u64,
}

impl Pacer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            started: None,
            frames: 0,
        }
    }

    fn reset(&mut self) {
        self.started = Some(Instant::now());
        self.frames = 0;
    }

    /// Wait until `frames` more frames are due, then account for them
    fn deliver(&mut self, frames: usize) {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.frames += frames as u64;
        let due = started
            + Duration::from_micros(self.frames * 1_000_000 / u64::from(self.sample_rate.max(1)));
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

/// Clamp a read request to whole frames within the device buffer
fn frames_for(buf_len: usize, params: &AudioDeviceParams) -> usize {
    let frame_bytes = params.frame_bytes();
    buf_len.min(params.buffer_size.max(frame_bytes)) / frame_bytes
}

/// Sine tone generator
pub struct ToneDevice {
    params: AudioDeviceParams,
    frequency_hz: f32,
    amplitude: f32,
    phase: f32,
    pacer: Pacer,
    recording: bool,
    released: bool,
}

impl ToneDevice {
    pub fn new(params: AudioDeviceParams, frequency_hz: f32) -> Self {
        Self {
            params,
            frequency_hz,
            amplitude: 0.3,
            phase: 0.0,
            pacer: Pacer::new(params.sample_rate),
            recording: false,
            released: false,
        }
    }
}

impl AudioCaptureDevice for ToneDevice {
    fn name(&self) -> &str {
        "tone"
    }

    fn start(&mut self) -> io::Result<()> {
        if self.released {
            return Err(not_started(self.name()));
        }
        self.recording = true;
        self.pacer.reset();
        info!(
            "Tone device started: {} Hz, {} Hz x {} ch",
            self.frequency_hz, self.params.sample_rate, self.params.channels
        );
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.recording {
            return Err(not_started(self.name()));
        }

        let frames = frames_for(buf.len(), &self.params);
        let channels = self.params.channels.max(1) as usize;
        let step = std::f32::consts::TAU * self.frequency_hz / self.params.sample_rate as f32;

        for frame in buf[..frames * channels * 2].chunks_exact_mut(channels * 2) {
            let sample = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            for channel in frame.chunks_exact_mut(2) {
                channel.copy_from_slice(&sample.to_le_bytes());
            }
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }

        self.pacer.deliver(frames);
        Ok(frames * channels * 2)
    }

    fn stop(&mut self) {
        self.recording = false;
    }

    fn release(&mut self) {
        self.recording = false;
        self.released = true;
    }
}

/// PCM read from a WAV file, converted to the device's format
pub struct WavDevice {
    params: AudioDeviceParams,
    name: String,
    samples: Vec<i16>,
    position: usize,
    looping: bool,
    pacer: Pacer,
    recording: bool,
}

impl WavDevice {
    pub fn open(path: &Path, params: AudioDeviceParams, looping: bool) -> Result<Self> {
        let reader = WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
        let spec = reader.spec();

        let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .into_samples::<i16>()
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read 16-bit samples")?,
            (SampleFormat::Int, bits) if bits <= 32 => reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| scale_to_i16(v, bits)))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read integer samples")?,
            (SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read float samples")?,
            (format, bits) => bail!("Unsupported WAV sample format: {:?} {} bits", format, bits),
        };

        let samples = convert(
            &raw,
            spec.channels,
            spec.sample_rate,
            params.channels,
            params.sample_rate,
        );
        if samples.is_empty() {
            bail!("WAV file {} contains no audio", path.display());
        }

        info!(
            "Loaded WAV source {}: {} Hz x {} ch -> {} frames at {} Hz",
            path.display(),
            spec.sample_rate,
            spec.channels,
            samples.len() / params.channels.max(1) as usize,
            params.sample_rate
        );

        Ok(Self {
            params,
            name: format!("wav:{}", path.display()),
            samples,
            position: 0,
            looping,
            pacer: Pacer::new(params.sample_rate),
            recording: false,
        })
    }
}

fn scale_to_i16(value: i32, bits: u16) -> i16 {
    if bits > 16 {
        (value >> (bits - 16)) as i16
    } else {
        (value << (16 - bits)) as i16
    }
}

/// Remix to `out_channels` and resample (nearest neighbour) to `out_rate`
pub(crate) fn convert(
    samples: &[i16],
    in_channels: u16,
    in_rate: u32,
    out_channels: u16,
    out_rate: u32,
) -> Vec<i16> {
    let in_channels = in_channels.max(1) as usize;
    let out_channels = out_channels.max(1) as usize;
    let in_frames = samples.len() / in_channels;
    if in_frames == 0 || in_rate == 0 || out_rate == 0 {
        return Vec::new();
    }

    let out_frames = (in_frames as u64 * u64::from(out_rate) / u64::from(in_rate)) as usize;
    let mut out = Vec::with_capacity(out_frames * out_channels);
    for frame in 0..out_frames {
        let source = ((frame as u64 * u64::from(in_rate) / u64::from(out_rate)) as usize)
            .min(in_frames - 1);
        let input = &samples[source * in_channels..(source + 1) * in_channels];
        if out_channels == in_channels {
            out.extend_from_slice(input);
        } else {
            let mixed = input.iter().map(|&s| s as i32).sum::<i32>() / in_channels as i32;
            out.extend(std::iter::repeat(mixed as i16).take(out_channels));
        }
    }
    out
}

impl AudioCaptureDevice for WavDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> io::Result<()> {
        self.recording = true;
        self.pacer.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.recording {
            return Err(not_started(&self.name));
        }

        let channels = self.params.channels.max(1) as usize;
        let wanted = frames_for(buf.len(), &self.params) * channels;
        let mut written = 0;
        while written < wanted {
            if self.position >= self.samples.len() {
                if !self.looping {
                    break;
                }
                debug!("{}: looping", self.name);
                self.position = 0;
            }
            let take = (wanted - written).min(self.samples.len() - self.position);
            for (i, sample) in self.samples[self.position..self.position + take]
                .iter()
                .enumerate()
            {
                let at = (written + i) * 2;
                buf[at..at + 2].copy_from_slice(&sample.to_le_bytes());
            }
            written += take;
            self.position += take;
        }

        if written == 0 {
            info!("{}: end of data", self.name);
            return Ok(0);
        }
        self.pacer.deliver(written / channels);
        Ok(written * 2)
    }

    fn stop(&mut self) {
        self.recording = false;
    }

    fn release(&mut self) {
        self.recording = false;
        self.samples = Vec::new();
    }
}
