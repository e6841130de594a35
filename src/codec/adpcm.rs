//! IMA ADPCM audio codec (4 bits per sample).
//!
//! Every input buffer becomes one self-contained block:
//!
//! ```text
//! u16 LE frames | per channel: i16 LE predictor, u8 step index, u8 reserved | nibbles
//! ```
//!
//! The first frame of each channel is carried verbatim in the header
//! predictor; the remaining samples are interleaved nibbles, low nibble first.

use bytes::{BufMut, Bytes, BytesMut};

use super::queue::Compressor;
use super::{AudioFormat, CodecError, CodecResult, MediaFormat};

const INDEX_TABLE: [i8; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

const BLOCK_HEADER_LEN: usize = 2;
const CHANNEL_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    predictor: i32,
    index: i32,
}

impl ChannelState {
    fn step_delta(step: i32, nibble: u8) -> i32 {
        let mut delta = step >> 3;
        if nibble & 4 != 0 {
            delta += step;
        }
        if nibble & 2 != 0 {
            delta += step >> 1;
        }
        if nibble & 1 != 0 {
            delta += step >> 2;
        }
        delta
    }

    fn apply(&mut self, nibble: u8) -> i16 {
        let step = STEP_TABLE[self.index as usize];
        let delta = Self::step_delta(step, nibble);
        if nibble & 8 != 0 {
            self.predictor -= delta;
        } else {
            self.predictor += delta;
        }
        self.predictor = self.predictor.clamp(i16::MIN as i32, i16::MAX as i32);
        self.index = (self.index + INDEX_TABLE[nibble as usize] as i32).clamp(0, 88);
        self.predictor as i16
    }

    fn encode(&mut self, sample: i16) -> u8 {
        let step = STEP_TABLE[self.index as usize];
        let mut diff = sample as i32 - self.predictor;
        let mut nibble = 0u8;
        if diff < 0 {
            nibble = 8;
            diff = -diff;
        }
        if diff >= step {
            nibble |= 4;
            diff -= step;
        }
        if diff >= step >> 1 {
            nibble |= 2;
            diff -= step >> 1;
        }
        if diff >= step >> 2 {
            nibble |= 1;
        }
        self.apply(nibble);
        nibble
    }
}

pub struct AdpcmCompressor {
    format: AudioFormat,
    channels: usize,
    input_size: usize,
    states: Vec<ChannelState>,
    samples: Vec<i16>,
}

impl AdpcmCompressor {
    pub fn new(format: &AudioFormat) -> CodecResult<Self> {
        if format.sample_rate == 0 {
            return Err(CodecError::InvalidFormat(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if !(1..=8).contains(&format.channel_count) {
            return Err(CodecError::InvalidFormat(format!(
                "unsupported channel count {}",
                format.channel_count
            )));
        }

        let channels = format.channel_count as usize;
        let frame_bytes = channels * 2;
        let input_size = match format.max_input_size {
            // 20 ms of PCM
            0 => (format.sample_rate as usize / 50).max(1) * frame_bytes,
            size => (size / frame_bytes).max(1) * frame_bytes,
        };

        Ok(Self {
            format: format.clone(),
            channels,
            input_size,
            states: vec![ChannelState::default(); channels],
            samples: Vec::new(),
        })
    }
}

impl Compressor for AdpcmCompressor {
    fn output_format(&self) -> MediaFormat {
        MediaFormat::Audio(AudioFormat {
            max_input_size: self.input_size,
            ..self.format.clone()
        })
    }

    fn codec_config(&self) -> Option<Bytes> {
        let mut config = BytesMut::with_capacity(6);
        config.put_u16_le(self.format.channel_count);
        config.put_u32_le(self.format.sample_rate);
        Some(config.freeze())
    }

    fn input_buffer_size(&self) -> usize {
        self.input_size
    }

    fn compress(&mut self, input: &[u8], out: &mut BytesMut) -> CodecResult<bool> {
        self.samples.clear();
        self.samples.extend(
            input
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        let frames = self.samples.len() / self.channels;
        if frames == 0 {
            return Ok(true);
        }
        let frames = frames.min(u16::MAX as usize);

        let header_len = BLOCK_HEADER_LEN + CHANNEL_HEADER_LEN * self.channels;
        out.reserve(header_len + frames * self.channels / 2 + 1);
        out.put_u16_le(frames as u16);
        for (channel, state) in self.states.iter_mut().enumerate() {
            let first = self.samples[channel];
            state.predictor = first as i32;
            out.put_i16_le(first);
            out.put_u8(state.index as u8);
            out.put_u8(0);
        }

        let mut pending: Option<u8> = None;
        for frame in 1..frames {
            for channel in 0..self.channels {
                let sample = self.samples[frame * self.channels + channel];
                let nibble = self.states[channel].encode(sample);
                match pending.take() {
                    None => pending = Some(nibble),
                    Some(low) => out.put_u8(low | (nibble << 4)),
                }
            }
        }
        if let Some(low) = pending {
            out.put_u8(low);
        }

        Ok(true)
    }
}

/// Decodes blocks produced by [`AdpcmCompressor`] back to 16-bit PCM
pub struct AdpcmDecoder {
    channels: usize,
}

impl AdpcmDecoder {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
        }
    }

    pub fn decode(&self, block: &[u8]) -> CodecResult<Vec<i16>> {
        let header_len = BLOCK_HEADER_LEN + CHANNEL_HEADER_LEN * self.channels;
        if block.len() < header_len {
            return Err(CodecError::CorruptSample("ADPCM block too short".to_string()));
        }

        let frames = u16::from_le_bytes([block[0], block[1]]) as usize;
        let mut states = Vec::with_capacity(self.channels);
        let mut samples = Vec::with_capacity(frames * self.channels);
        for channel in 0..self.channels {
            let at = BLOCK_HEADER_LEN + channel * CHANNEL_HEADER_LEN;
            let predictor = i16::from_le_bytes([block[at], block[at + 1]]);
            let index = block[at + 2] as i32;
            if index > 88 {
                return Err(CodecError::CorruptSample(format!("step index {}", index)));
            }
            states.push(ChannelState {
                predictor: predictor as i32,
                index,
            });
            samples.push(predictor);
        }

        let nibbles_needed = frames.saturating_sub(1) * self.channels;
        let data = &block[header_len..];
        if data.len() * 2 < nibbles_needed {
            return Err(CodecError::CorruptSample("truncated ADPCM data".to_string()));
        }

        for n in 0..nibbles_needed {
            let byte = data[n / 2];
            let nibble = if n % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            samples.push(states[n % self.channels].apply(nibble));
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MIME_AUDIO_IMA_ADPCM;

    fn format(channels: u16) -> AudioFormat {
        AudioFormat {
            mime: MIME_AUDIO_IMA_ADPCM.to_string(),
            sample_rate: 44100,
            channel_count: channels,
            bit_rate: 64000,
            max_input_size: 0,
        }
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_step_table_has_89_entries() {
        assert_eq!(STEP_TABLE.len(), 89);
        assert_eq!(STEP_TABLE[88], 32767);
    }

    #[test]
    fn test_default_input_size_is_20ms() {
        let compressor = AdpcmCompressor::new(&format(1)).unwrap();
        assert_eq!(compressor.input_buffer_size(), 882 * 2);
    }

    #[test]
    fn test_sine_tracks_closely() {
        let samples: Vec<i16> = (0..882)
            .map(|i| ((i as f32 * 0.0627).sin() * 12000.0) as i16)
            .collect();
        let mut compressor = AdpcmCompressor::new(&format(1)).unwrap();

        let mut first_block = BytesMut::new();
        compressor.compress(&pcm_bytes(&samples), &mut first_block).unwrap();
        let mut block = BytesMut::new();
        compressor.compress(&pcm_bytes(&samples), &mut block).unwrap();
        assert!(block.len() < samples.len() * 2 / 3);

        let decoded = AdpcmDecoder::new(1).decode(&block).unwrap();
        assert_eq!(decoded.len(), samples.len());
        let max_error = samples
            .iter()
            .zip(&decoded)
            .map(|(a, b)| (*a as i32 - *b as i32).abs())
            .max()
            .unwrap();
        assert!(max_error < 2000, "max error {}", max_error);
    }

    #[test]
    fn test_stereo_block_decodes_both_channels() {
        let samples: Vec<i16> = (0..200).map(|i| if i % 2 == 0 { 1000 } else { -1000 }).collect();
        let mut compressor = AdpcmCompressor::new(&format(2)).unwrap();
        let mut block = BytesMut::new();
        compressor.compress(&pcm_bytes(&samples), &mut block).unwrap();

        let decoded = AdpcmDecoder::new(2).decode(&block).unwrap();
        assert_eq!(decoded.len(), 200);
        assert_eq!(decoded[0], 1000);
        assert_eq!(decoded[1], -1000);
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(AdpcmDecoder::new(1).decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_invalid_channel_count_rejected() {
        assert!(AdpcmCompressor::new(&format(0)).is_err());
    }
}
