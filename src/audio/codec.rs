//! # Sample Codec
//!
//! Converts between the representations audio takes on its way through the pipeline:
//!
//! ```text
//! f32 [-1.0, 1.0]  <-->  i16 little-endian PCM bytes  <-->  base64 transport text
//! ```
//!
//! ## Key Functions:
//! - **encode_pcm16 / decode_pcm16**: float samples to/from 16-bit PCM
//! - **to_transport_text / from_transport_text**: bytes to/from text-safe base64
//! - **rms**: signal energy, used by the speaking indicator
//! - **resample_linear**: one-shot rate conversion of a self-contained block
//! - **LinearResampler**: streaming rate conversion that carries its phase across blocks
//!
//! ## Scaling:
//! Negative samples are scaled by 32768 and positive samples by 32767 so that both
//! -1.0 and 1.0 land exactly on the ends of the i16 range without wrapping.
//! Decoding applies the inverse of whichever scale produced the value.

use crate::error::{AppError, AppResult};
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};

/// Scale applied to negative samples (|i16::MIN|)
pub const NEGATIVE_SCALE: f32 = 32768.0;

/// Scale applied to positive samples (i16::MAX)
pub const POSITIVE_SCALE: f32 = 32767.0;

/// Size of one quantization step of the decoded signal.
pub const QUANTIZATION_STEP: f32 = 1.0 / NEGATIVE_SCALE;

/// Encode normalized float samples as signed 16-bit little-endian PCM.
///
/// Out-of-range input is clamped, never wrapped: 1.5 encodes exactly like 1.0.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let pcm: Vec<i16> = samples.iter().map(|&sample| float_to_i16(sample)).collect();

    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    bytes
}

/// Decode signed 16-bit little-endian PCM into normalized float samples.
///
/// ## Returns:
/// - **Ok(samples)**: `bytes.len() / 2` samples in [-1.0, 1.0]
/// - **Err(MalformedAudio)**: the byte length is odd
pub fn decode_pcm16(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::MalformedAudio(format!(
            "PCM16 payload has odd byte length {}",
            bytes.len()
        )));
    }

    let mut pcm = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut pcm);

    Ok(pcm.into_iter().map(i16_to_float).collect())
}

/// Encode raw bytes as standard base64 text.
pub fn to_transport_text(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64 text back into raw bytes.
pub fn from_transport_text(text: &str) -> AppResult<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(text.trim())?)
}

/// Root-mean-square energy of a block of samples (0.0 for an empty block).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|&x| x * x).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Linear interpolation resampling of one self-contained block.
///
/// The output length is `input.len()` scaled by the rate ratio, so the block keeps its
/// duration. Consecutive blocks of one stream must go through [`LinearResampler`]
/// instead, or every block boundary adds a phase jump and rounding drift.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = ((input.len() as f64) / ratio).round() as usize;
    let last = input.len() - 1;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src = i as f64 * ratio;
        let floor = (src.floor() as usize).min(last);
        let ceil = (floor + 1).min(last);
        let frac = (src - floor as f64) as f32;

        output.push(input[floor] * (1.0 - frac) + input[ceil] * frac);
    }

    output
}

/// Streaming linear resampler.
///
/// The position of the next output sample is kept as an exact integer count of
/// `1 / to_rate` source steps, so splitting a stream into blocks of any size yields the
/// same samples as converting it in one piece: no drift and no jump at block edges.
///
/// ## Rust Concepts:
/// - **&mut self**: The device callback owns the resampler and is its only user
/// - **i64 phase**: May be negative by up to one source sample; that slot reads the
///   previous block's last sample
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source position of the next output sample relative to the start of the next
    /// block, in units of `1 / to_rate` samples
    phase: i64,
    /// Last sample of the previous block
    previous: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            phase: 0,
            previous: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    /// Convert the next block of the stream, appending to `out`.
    ///
    /// Output samples whose position falls after the last input sample are produced
    /// by the next call, once their right-hand neighbour is known.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let to = i64::from(self.to_rate);
        let step = i64::from(self.from_rate);
        let last_index = input.len() as i64 - 1;

        while self.phase <= last_index * to {
            let index = self.phase.div_euclid(to);
            let frac = self.phase.rem_euclid(to) as f32 / to as f32;
            let left = if index < 0 {
                self.previous
            } else {
                input[index as usize]
            };
            let right = if index < last_index {
                input[(index + 1) as usize]
            } else {
                left
            };

            out.push(left + (right - left) * frac);
            self.phase += step;
        }

        self.phase -= input.len() as i64 * to;
        self.previous = input[last_index as usize];
    }

    /// Forget the stream position, e.g. after the device restarted.
    pub fn reset(&mut self) {
        self.phase = 0;
        self.previous = 0.0;
    }
}

/// Average interleaved multi-channel samples down to mono.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }

    for chunk in interleaved.chunks(channels) {
        out.push(chunk.iter().sum::<f32>() / chunk.len() as f32);
    }
}

fn float_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN and `as` maps it to 0
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEGATIVE_SCALE).round() as i16
    } else {
        (s * POSITIVE_SCALE).round() as i16
    }
}

fn i16_to_float(value: i16) -> f32 {
    // Positive values use 1/32767 rather than a uniform 1/32768 so full scale decodes to 1.0
    if value < 0 {
        value as f32 / NEGATIVE_SCALE
    } else {
        value as f32 / POSITIVE_SCALE
    }
}
