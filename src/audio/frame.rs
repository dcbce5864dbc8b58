//! # Audio Frames and Encoded Packets
//!
//! The two units audio travels in:
//! - **AudioFrame**: a fixed block of float samples produced by the capture engine
//! - **EncodedPacket**: PCM16 bytes plus the sample rate they were recorded at,
//!   the form audio takes on the wire in both directions

use crate::audio::codec;
use crate::error::{AppError, AppResult};
use std::sync::Arc;

/// Sample rate assumed for inbound audio whose MIME type does not declare one.
pub const DEFAULT_INBOUND_SAMPLE_RATE: u32 = 24_000;

/// A fixed-length block of mono samples in [-1.0, 1.0].
///
/// Frames are immutable once produced. The samples live behind an `Arc<[f32]>`
/// so a frame can be handed between threads without copying.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position of this frame in the capture order (0-based)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// One unit of audio in transit: signed 16-bit little-endian PCM at a declared rate.
///
/// ## Invariant:
/// A well-formed packet decodes to exactly `bytes.len() / 2` samples. Packets
/// received from the network are not validated on construction; validation
/// happens when they are decoded for playback so that one bad packet can be
/// dropped without touching its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    bytes: Vec<u8>,
    sample_rate: u32,
}

impl EncodedPacket {
    /// Wrap raw PCM16 bytes.
    pub fn from_pcm(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }

    /// Encode a captured frame. The frame is consumed.
    pub fn from_frame(frame: AudioFrame) -> Self {
        Self {
            bytes: codec::encode_pcm16(frame.samples()),
            sample_rate: frame.sample_rate(),
        }
    }

    /// Build a packet from its wire form (`mimeType` + base64 `data`).
    pub fn from_transport(mime_type: &str, data: &str) -> AppResult<Self> {
        let sample_rate = parse_pcm_mime(mime_type).ok_or_else(|| {
            AppError::MalformedAudio(format!("unsupported audio MIME type '{}'", mime_type))
        })?;

        Ok(Self {
            bytes: codec::from_transport_text(data)?,
            sample_rate,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// `audio/pcm;rate=<N>`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Base64 form of the payload
    pub fn transport_data(&self) -> String {
        codec::to_transport_text(&self.bytes)
    }

    pub fn decode(&self) -> AppResult<Vec<f32>> {
        codec::decode_pcm16(&self.bytes)
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Parse the sample rate out of a raw PCM MIME type.
///
/// Accepts `audio/pcm`, `audio/pcm;rate=16000`, `audio/L16;codec=pcm;rate=24000`
/// and similar. A missing rate falls back to [`DEFAULT_INBOUND_SAMPLE_RATE`];
/// anything that is not raw PCM returns `None`.
pub fn parse_pcm_mime(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?.to_ascii_lowercase();
    if essence != "audio/pcm" && essence != "audio/l16" {
        return None;
    }

    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                return value.trim().parse::<u32>().ok().filter(|rate| *rate > 0);
            }
        }
    }

    Some(DEFAULT_INBOUND_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_from_frame() {
        let frame = AudioFrame::new(vec![0.0; 4096], 16_000, 0);
        assert!((frame.duration_secs() - 0.256).abs() < 1e-9);

        let packet = EncodedPacket::from_frame(frame);
        assert_eq!(packet.bytes().len(), 8192);
        assert_eq!(packet.sample_count(), 4096);
        assert_eq!(packet.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_transport_form() {
        let packet = EncodedPacket::from_pcm(vec![1, 0, 255, 255], 24_000);
        let restored =
            EncodedPacket::from_transport(&packet.mime_type(), &packet.transport_data()).unwrap();
        assert_eq!(restored, packet);
        assert_eq!(restored.decode().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_mime() {
        assert_eq!(parse_pcm_mime("audio/pcm;rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_mime("audio/pcm; rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_mime("audio/L16;codec=pcm;rate=8000"), Some(8_000));
        assert_eq!(parse_pcm_mime("audio/pcm"), Some(DEFAULT_INBOUND_SAMPLE_RATE));
        assert_eq!(parse_pcm_mime("audio/pcm;rate=abc"), None);
        assert_eq!(parse_pcm_mime("audio/opus"), None);
    }

    #[test]
    fn test_unsupported_mime_is_malformed() {
        let err = EncodedPacket::from_transport("audio/opus", "AAAA").unwrap_err();
        assert_eq!(err.kind(), "malformed_audio");
    }
}
