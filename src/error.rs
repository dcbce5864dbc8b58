//! # Error Handling
//!
//! This module defines the error taxonomy shared by every part of the audio pipeline.
//! Each variant maps to one failure class with its own propagation rule:
//!
//! | Variant            | Raised by                          | Propagation                         |
//! |--------------------|------------------------------------|-------------------------------------|
//! | `DeviceUnavailable`| capture / playback device opening  | fatal, surfaced to the user         |
//! | `Authentication`   | `StreamSession::connect`           | fatal, surfaced, never retried      |
//! | `Transport`        | connection drop / handshake        | session moves to Failed, surfaced   |
//! | `MalformedAudio`   | codec, one packet at a time        | packet dropped and logged           |
//! | `InvalidState`     | API misuse (restart, double connect)| returned to the caller             |
//! | `Config`           | configuration loading              | fatal at startup                    |
//!
//! ## Key Rust Concepts for Error Handling:
//! - **thiserror**: Derives `Display` and `std::error::Error` from the `#[error(...)]` attributes
//! - **From trait**: Lets the `?` operator convert library errors into `AppError` automatically
//! - **Clone**: Errors are cloned into the session's error channel and into `SessionState::Failed`

use tokio_tungstenite::tungstenite;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::MalformedAudio("odd byte length".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// No microphone/speaker, or the OS denied access to it
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Credential missing, empty or rejected by the remote service
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network failure while connecting or during an active session
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single audio packet could not be decoded
    #[error("Malformed audio: {0}")]
    MalformedAudio(String),

    /// Operation not valid in the component's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Stable machine-readable tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DeviceUnavailable(_) => "device_unavailable",
            AppError::Authentication(_) => "authentication",
            AppError::Transport(_) => "transport",
            AppError::MalformedAudio(_) => "malformed_audio",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Config(_) => "config",
        }
    }

    /// Whether this error ends any attempt to run a session.
    ///
    /// Transport errors are not fatal: the caller may invoke `connect` again.
    /// Codec errors only ever concern one packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::DeviceUnavailable(_) | AppError::Authentication(_) | AppError::Config(_)
        )
    }

    /// Message shown to the person running the interview.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DeviceUnavailable(_) => {
                "Could not access the microphone or speaker. Check that a device is connected and that this program is allowed to use it.".to_string()
            }
            AppError::Authentication(_) => {
                "The API key was missing or rejected. Set GEMINI_API_KEY (or service.api_key) and try again.".to_string()
            }
            AppError::Transport(msg) => format!("Connection to the interviewer was lost: {}", msg),
            AppError::MalformedAudio(msg) => format!("Skipped a corrupt audio packet: {}", msg),
            AppError::InvalidState(msg) => format!("Operation not allowed right now: {}", msg),
            AppError::Config(msg) => format!("Invalid configuration: {}", msg),
        }
    }
}

/// Handshake rejections with a client-error status are credential problems;
/// anything else that goes wrong on the socket is a transport failure.
impl From<tungstenite::Error> for AppError {
    fn from(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) => {
                let status = response.status().as_u16();
                if matches!(status, 400 | 401 | 403) {
                    AppError::Authentication(format!("handshake rejected with HTTP {}", status))
                } else {
                    AppError::Transport(format!("handshake failed with HTTP {}", status))
                }
            }
            _ => AppError::Transport(err.to_string()),
        }
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::MalformedAudio(format!("invalid transport text: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AppError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AppError::DeviceUnavailable(format!("failed to build audio stream: {}", err))
    }
}

impl From<cpal::PlayStreamError> for AppError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AppError::DeviceUnavailable(format!("failed to start audio stream: {}", err))
    }
}

impl From<cpal::DefaultStreamConfigError> for AppError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AppError::DeviceUnavailable(format!("no usable stream config: {}", err))
    }
}

impl From<cpal::SupportedStreamConfigsError> for AppError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AppError::DeviceUnavailable(format!("failed to query stream configs: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::DeviceUnavailable("no mic".into()).is_fatal());
        assert!(AppError::Authentication("empty".into()).is_fatal());
        assert!(!AppError::Transport("reset".into()).is_fatal());
        assert!(!AppError::MalformedAudio("odd".into()).is_fatal());
    }

    #[test]
    fn test_http_rejection_maps_to_authentication() {
        let response = tungstenite::http::Response::builder()
            .status(403)
            .body(None)
            .unwrap();
        let err: AppError = tungstenite::Error::Http(response).into();
        assert_eq!(err.kind(), "authentication");

        let response = tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        let err: AppError = tungstenite::Error::Http(response).into();
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AppError::MalformedAudio("odd byte length 3".to_string());
        assert_eq!(err.to_string(), "Malformed audio: odd byte length 3");
    }
}
