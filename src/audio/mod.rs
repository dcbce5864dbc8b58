//! # Audio Pipeline Module
//!
//! Everything between the microphone / speaker and the PCM bytes that travel over the
//! live session.
//!
//! ## Key Components:
//! - **Codec**: float <-> PCM16 conversion, base64 transport form, resampling helpers
//! - **Frame**: `AudioFrame` (captured floats) and `EncodedPacket` (PCM16 in transit)
//! - **Capture Engine**: microphone -> fixed-size frames on a lazy stream
//! - **Playback Scheduler**: inbound packets -> gapless, order-preserving output
//! - **Activity Tracker**: "interviewer is speaking" indicator with decay
//! - **Device**: cpal-backed microphone and speaker
//!
//! ## Audio Format:
//! - **Upstream**: 16kHz mono, 4096-sample frames, 16-bit signed little-endian PCM
//! - **Downstream**: 16-bit signed little-endian PCM at the rate the MIME type declares
//!   (24kHz when it declares none)

pub mod activity; // Speaking indicator
pub mod capture; // Microphone framing
pub mod codec; // PCM16 + base64
pub mod device; // cpal backends
pub mod frame; // AudioFrame / EncodedPacket
pub mod playback; // Output scheduling

pub use activity::{ActivitySignal, SpeakingActivityTracker};
pub use capture::{AudioInput, CaptureEngine, FrameStream};
pub use frame::{AudioFrame, EncodedPacket};
pub use playback::{AudioOutput, PlaybackScheduler};
