//! Lossless screen codec.
//!
//! Frames are packed BGRA. A key frame is the run-length coded frame; a delta
//! frame is the run-length coded XOR against the previous frame, which makes
//! static screen regions collapse into long zero runs.
//!
//! Sample layout: one frame-type byte followed by PackBits-style runs
//! (control `n < 128`: `n + 1` literal bytes follow; `n > 128`: the next byte
//! repeats `257 - n` times; `128` is a no-op).

use bytes::{BufMut, Bytes, BytesMut};

use super::queue::Compressor;
use super::{CodecError, CodecResult, MediaFormat, VideoFormat};

pub const BYTES_PER_PIXEL: usize = 4;

const FRAME_KEY: u8 = 0x4B;
const FRAME_DELTA: u8 = 0x44;
const MAX_RUN: usize = 128;
const MIN_RUN: usize = 3;

pub struct ScreenCompressor {
    format: VideoFormat,
    frame_size: usize,
    key_interval: u64,
    frames: u64,
    previous: Vec<u8>,
    delta: Vec<u8>,
}

impl ScreenCompressor {
    pub fn new(format: &VideoFormat) -> CodecResult<Self> {
        if format.width == 0 || format.height == 0 {
            return Err(CodecError::InvalidFormat(format!(
                "video size must be non-zero, got {}x{}",
                format.width, format.height
            )));
        }
        if format.frame_rate == 0 {
            return Err(CodecError::InvalidFormat(
                "frame rate must be non-zero".to_string(),
            ));
        }

        let key_interval =
            (u64::from(format.frame_rate) * u64::from(format.i_frame_interval_secs)).max(1);

        Ok(Self {
            format: format.clone(),
            frame_size: frame_size(format.width, format.height),
            key_interval,
            frames: 0,
            previous: Vec::new(),
            delta: Vec::new(),
        })
    }
}

pub fn frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

impl Compressor for ScreenCompressor {
    fn output_format(&self) -> MediaFormat {
        MediaFormat::Video(self.format.clone())
    }

    fn codec_config(&self) -> Option<Bytes> {
        let mut config = BytesMut::with_capacity(12);
        config.put_slice(b"SRLE");
        config.put_u32_le(self.format.width);
        config.put_u32_le(self.format.height);
        Some(config.freeze())
    }

    fn input_buffer_size(&self) -> usize {
        self.frame_size
    }

    fn surface_frame_size(&self) -> Option<usize> {
        Some(self.frame_size)
    }

    fn compress(&mut self, input: &[u8], out: &mut BytesMut) -> CodecResult<bool> {
        if input.len() != self.frame_size {
            return Err(CodecError::InvalidFormat(format!(
                "frame of {} bytes, expected {}",
                input.len(),
                self.frame_size
            )));
        }

        let key_frame = self.previous.is_empty() || self.frames % self.key_interval == 0;
        self.frames += 1;

        if key_frame {
            out.put_u8(FRAME_KEY);
            rle_encode(input, out);
            self.previous.clear();
            self.previous.extend_from_slice(input);
        } else {
            self.delta.clear();
            self.delta
                .extend(input.iter().zip(&self.previous).map(|(a, b)| a ^ b));
            out.put_u8(FRAME_DELTA);
            rle_encode(&self.delta, out);
            self.previous.copy_from_slice(input);
        }

        Ok(key_frame)
    }
}

fn rle_encode(data: &[u8], out: &mut BytesMut) {
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1;
        while i + run < data.len() && run < MAX_RUN && data[i + run] == byte {
            run += 1;
        }

        if run >= MIN_RUN {
            out.put_u8((257 - run) as u8);
            out.put_u8(byte);
            i += run;
            continue;
        }

        let start = i;
        while i < data.len() && i - start < MAX_RUN {
            let run_ahead =
                i + 2 < data.len() && data[i] == data[i + 1] && data[i] == data[i + 2];
            if run_ahead && i > start {
                break;
            }
            i += 1;
        }
        out.put_u8((i - start - 1) as u8);
        out.put_slice(&data[start..i]);
    }
}

fn rle_decode(mut data: &[u8], out: &mut Vec<u8>) -> CodecResult<()> {
    while let Some((&control, rest)) = data.split_first() {
        data = rest;
        match control {
            0..=127 => {
                let len = control as usize + 1;
                if data.len() < len {
                    return Err(CodecError::CorruptSample("truncated literal".to_string()));
                }
                out.extend_from_slice(&data[..len]);
                data = &data[len..];
            }
            128 => {}
            _ => {
                let (&byte, rest) = data
                    .split_first()
                    .ok_or_else(|| CodecError::CorruptSample("truncated run".to_string()))?;
                data = rest;
                out.resize(out.len() + (257 - control as usize), byte);
            }
        }
    }
    Ok(())
}

/// Reconstructs frames from a screen-codec stream
pub struct ScreenDecoder {
    frame_size: usize,
    frame: Vec<u8>,
    scratch: Vec<u8>,
}

impl ScreenDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame_size: frame_size(width, height),
            frame: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Decode one sample and return the reconstructed frame
    pub fn decode(&mut self, sample: &[u8]) -> CodecResult<&[u8]> {
        let (&frame_type, body) = sample
            .split_first()
            .ok_or_else(|| CodecError::CorruptSample("empty sample".to_string()))?;

        self.scratch.clear();
        rle_decode(body, &mut self.scratch)?;
        if self.scratch.len() != self.frame_size {
            return Err(CodecError::CorruptSample(format!(
                "decoded {} bytes, expected {}",
                self.scratch.len(),
                self.frame_size
            )));
        }

        match frame_type {
            FRAME_KEY => std::mem::swap(&mut self.frame, &mut self.scratch),
            FRAME_DELTA if self.frame.len() == self.frame_size => {
                for (pixel, delta) in self.frame.iter_mut().zip(&self.scratch) {
                    *pixel ^= delta;
                }
            }
            FRAME_DELTA => {
                return Err(CodecError::CorruptSample(
                    "delta frame without a key frame".to_string(),
                ))
            }
            other => {
                return Err(CodecError::CorruptSample(format!(
                    "unknown frame type 0x{:02x}",
                    other
                )))
            }
        }

        Ok(&self.frame)
    }
}
