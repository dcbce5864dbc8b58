//! # Configuration Management
//!
//! This module loads the interview settings from multiple sources:
//! - Default values (built into the code)
//! - Configuration file (`config.toml`, or any format the `config` crate knows, named `config`)
//! - Environment variables (with `APP_` prefix and `__` between sections)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between these structs and TOML / environment values
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize implementations
//! - **Result<T, E>**: Every loading step can fail, and `?` forwards the failure
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` (credential only)
//! 2. Environment variables (`APP_SERVICE__VOICE=Puck`, `APP_ACTIVITY__QUIET_INTERVAL_MS=1500`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)

use crate::error::{AppError, AppResult};
use crate::websocket::{BehaviorConfig, GEMINI_LIVE_URL};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Built-in interviewer persona, used when no script file is configured.
const DEFAULT_BEHAVIOR_SCRIPT: &str = include_str!("../prompts/interviewer_fr.md");

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct
///   - `Serialize` / `Deserialize`: Lets the `config` crate layer sources over the defaults
///
/// ## Why separate config structs:
/// Each section belongs to one component (connection, microphone, speaker, indicator,
/// interview content), so each component only ever sees its own settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub activity: ActivityConfig,
    pub interview: InterviewConfig,
}

/// Connection to the live conversational service.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL (`ws://` or `wss://`)
/// - `api_key`: credential; usually supplied through `GEMINI_API_KEY` instead of a file
/// - `model` / `voice`: model identifier and prebuilt output voice
/// - `connect_timeout_ms`: bound on waiting for the setup acknowledgment
/// - `queue_capacity`: outbound/inbound message queue length per connection
/// - `transcripts`: ask the service for text transcripts of both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub connect_timeout_ms: u64,
    pub queue_capacity: usize,
    pub transcripts: bool,
}

/// Microphone framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Upstream sample rate; the device is resampled to it when needed
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_size: usize,
}

/// Speaker output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Preferred device rate (the voice is synthesized at 24kHz)
    pub sample_rate: u32,
}

/// Speaking indicator timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Quiet time after the last packet before the indicator turns off
    pub quiet_interval_ms: u64,
    /// How often the decay is re-evaluated
    pub refresh_interval_ms: u64,
}

/// Interview content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewConfig {
    /// File holding the behavior script; the built-in persona is used when unset
    #[serde(default)]
    pub behavior_script_path: Option<String>,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The binary runs with nothing but `GEMINI_API_KEY` set. These values also document
/// what the service and the audio devices expect.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                endpoint: GEMINI_LIVE_URL.to_string(),
                api_key: None,
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Kore".to_string(),
                connect_timeout_ms: 15_000,
                queue_capacity: 256,
                transcripts: true,
            },
            capture: CaptureConfig {
                sample_rate: 16_000, // What the service expects upstream
                frame_size: 4096,    // 256ms per frame at 16kHz
            },
            playback: PlaybackConfig {
                sample_rate: 24_000,
            },
            activity: ActivityConfig {
                quiet_interval_ms: 2000,
                refresh_interval_ms: 100,
            },
            interview: InterviewConfig {
                behavior_script_path: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.*` and the process environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVICE__VOICE=Puck`: Override the interviewer voice
    /// - `APP_CAPTURE__FRAME_SIZE=2048`: Smaller upstream frames
    /// - `GEMINI_API_KEY=...`: Credential (overrides `service.api_key`)
    pub fn load() -> AppResult<Self> {
        Self::load_from(
            Some("config"),
            Self::environment(),
            env::var("GEMINI_API_KEY").ok(),
        )
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// ## Rust Concepts:
    /// - **Builder pattern**: Each `add_source` layers over the previous one
    /// - **?**: `config::ConfigError` converts into `AppError::Config` via `From`
    fn load_from(
        file: Option<&str>,
        environment: config::Environment,
        api_key: Option<String>,
    ) -> AppResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file).required(false));
        }
        builder = builder.add_source(environment);

        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            builder = builder.set_override("service.api_key", key)?;
        }

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the values make sense before anything is opened.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: &str| Err(AppError::Config(msg.to_string()));

        if !(self.service.endpoint.starts_with("ws://") || self.service.endpoint.starts_with("wss://")) {
            return invalid("service.endpoint must be a ws:// or wss:// URL");
        }
        if self.service.model.trim().is_empty() {
            return invalid("service.model cannot be empty");
        }
        if self.service.voice.trim().is_empty() {
            return invalid("service.voice cannot be empty");
        }
        if self.service.connect_timeout_ms == 0 {
            return invalid("service.connect_timeout_ms must be greater than 0");
        }
        if self.service.queue_capacity == 0 {
            return invalid("service.queue_capacity must be greater than 0");
        }
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return invalid("sample rates must be greater than 0");
        }
        if self.capture.frame_size == 0 {
            return invalid("capture.frame_size must be greater than 0");
        }
        if self.activity.quiet_interval_ms == 0 || self.activity.refresh_interval_ms == 0 {
            return invalid("activity intervals must be greater than 0");
        }
        if let Some(path) = &self.interview.behavior_script_path {
            if !std::path::Path::new(path).is_file() {
                return Err(AppError::Config(format!(
                    "behavior script '{}' does not exist",
                    path
                )));
            }
        }

        Ok(())
    }

    /// The credential, or an empty string when none is configured.
    pub fn credential(&self) -> &str {
        self.service.api_key.as_deref().unwrap_or("")
    }

    /// Instructions sent to the service at connect time.
    pub fn behavior_script(&self) -> AppResult<String> {
        match &self.interview.behavior_script_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("cannot read behavior script '{}': {}", path, e))
            }),
            None => Ok(DEFAULT_BEHAVIOR_SCRIPT.to_string()),
        }
    }

    pub fn behavior(&self) -> AppResult<BehaviorConfig> {
        Ok(BehaviorConfig {
            system_instruction: self.behavior_script()?,
            voice: self.service.voice.clone(),
            model: self.service.model.clone(),
            transcripts: self.service.transcripts,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.service.connect_timeout_ms)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.activity.quiet_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.activity.refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> config::Environment {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::environment().source(Some(vars))
    }

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.capture.sample_rate, 16_000);
        assert_eq!(config.capture.frame_size, 4096);
        assert_eq!(config.playback.sample_rate, 24_000);
        assert_eq!(config.quiet_interval(), Duration::from_secs(2));
        assert_eq!(config.credential(), "");
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.service.endpoint = "https://example.test".to_string();
        assert_eq!(config.validate().unwrap_err().kind(), "config");

        let mut config = AppConfig::default();
        config.capture.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.activity.quiet_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.interview.behavior_script_path = Some("/nonexistent/script.md".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AppConfig::load_from(
            None,
            env_from(&[
                ("APP_SERVICE__VOICE", "Puck"),
                ("APP_ACTIVITY__QUIET_INTERVAL_MS", "1500"),
                ("APP_SERVICE__TRANSCRIPTS", "false"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(config.service.voice, "Puck");
        assert_eq!(config.activity.quiet_interval_ms, 1500);
        assert!(!config.service.transcripts);
        // Untouched values keep their defaults
        assert_eq!(config.capture.frame_size, 4096);
    }

    #[test]
    fn test_api_key_override() {
        let config =
            AppConfig::load_from(None, env_from(&[]), Some("secret-key".to_string())).unwrap();
        assert_eq!(config.credential(), "secret-key");

        let config = AppConfig::load_from(None, env_from(&[]), Some("  ".to_string())).unwrap();
        assert_eq!(config.credential(), "");
    }

    #[test]
    fn test_behavior_from_defaults() {
        let behavior = AppConfig::default().behavior().unwrap();
        assert!(behavior.system_instruction.starts_with("[Identity]"));
        assert_eq!(behavior.voice, "Kore");
        assert!(behavior.transcripts);
    }

    #[test]
    fn test_behavior_script_from_file() {
        let path = std::env::temp_dir().join(format!("behavior-{}.md", uuid::Uuid::new_v4()));
        std::fs::write(&path, "Ask one question.").unwrap();

        let mut config = AppConfig::default();
        config.interview.behavior_script_path = Some(path.to_string_lossy().into_owned());
        assert!(config.validate().is_ok());
        assert_eq!(config.behavior_script().unwrap(), "Ask one question.");

        std::fs::remove_file(path).unwrap();
    }
}
