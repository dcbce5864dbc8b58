//! # Interview Voice
//!
//! Real-time audio pipeline for a voice interview simulator: microphone capture,
//! a bidirectional session with the Gemini Live service, gapless playback of the
//! interviewer's voice and a speaking indicator.
//!
//! ## Module Layout:
//! - **audio**: sample codec, capture engine, playback scheduler, activity tracker, cpal devices
//! - **websocket**: wire protocol and the tungstenite-backed connector
//! - **session**: connection lifecycle state machine
//! - **interview**: wires capture, session and playback together
//! - **config**: file + environment configuration
//! - **state**: per-session metrics
//! - **error**: the crate-wide error type

pub mod audio;
pub mod config;
pub mod error;
pub mod interview;
pub mod session;
pub mod state;
pub mod websocket;

pub use error::{AppError, AppResult};
pub use interview::{Interview, InterviewEvent, InterviewSettings};
pub use session::{SessionEvent, SessionState, StreamSession};
