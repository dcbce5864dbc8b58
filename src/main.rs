//! # Interview Voice - Main Application Entry Point
//!
//! Runs one voice interview from the terminal: the microphone streams to the live
//! service, the interviewer's answers play through the default speaker and transcripts
//! are logged as they arrive.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Network, capture pump and playback run as tokio tasks
//! - **Result<T, E>**: Library code returns `AppResult`; `anyhow` only at this edge
//! - **Arc**: The devices and the connector are shared with the interview controller
//! - **tokio::select!**: Wait for whichever comes first, a signal or the end of the session

use anyhow::Result;
use interview_voice::audio::device::{DeviceManager, MicrophoneInput, SpeakerOutput};
use interview_voice::config::AppConfig;
use interview_voice::websocket::TungsteniteConnector;
use interview_voice::{AppError, Interview, InterviewEvent, InterviewSettings, SessionEvent};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `config.*`, `APP_*` variables and `GEMINI_API_KEY`
/// 2. **Opens the speaker** and prepares the microphone
/// 3. **Starts the interview** (connect first, then capture)
/// 4. **Logs transcripts** until Ctrl+C, SIGTERM or the session ends
/// 5. **Stops everything** and prints the session metrics
///
/// ## Error Handling:
/// Startup errors are printed with a user-facing message and the process exits with
/// a non-zero status.
#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    if let Err(err) = run().await {
        error!(kind = err.kind(), "{}", err);
        eprintln!("{}", err.user_message());
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting interview-voice v{}", env!("CARGO_PKG_VERSION"));
    info!(devices = %DeviceManager::summary().describe(), "Audio devices");

    let speaker = SpeakerOutput::open(config.playback.sample_rate)?;
    info!(sample_rate = speaker.sample_rate(), "Speaker ready");

    let connector = TungsteniteConnector::new(
        config.service.endpoint.clone(),
        config.connect_timeout(),
        config.service.queue_capacity,
    );
    let interview = Interview::new(
        InterviewSettings::from_config(&config)?,
        Arc::new(connector),
        Arc::new(MicrophoneInput::new()),
        Arc::new(speaker),
    );

    let mut events = interview
        .take_events()
        .ok_or_else(|| AppError::InvalidState("interview events already taken".to_string()))?;
    let mut activity = interview.subscribe_activity();
    let mut state = interview.subscribe_state();

    interview.start(config.credential()).await?;
    info!(session_id = %interview.session_id(), "Interview running, press Ctrl+C to finish");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut failure = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, ending interview...");
                break;
            }
            Some(event) = events.recv() => match event {
                InterviewEvent::Session(event) => log_event(event),
                InterviewEvent::Failed(err) => {
                    warn!(error = %err, "Session failed");
                    failure = Some(err);
                }
            },
            Ok(()) = activity.changed() => {
                let signal = *activity.borrow_and_update();
                debug!(active = signal.active, level = signal.level, "Interviewer activity");
            }
            Ok(()) = state.changed() => {
                let current = state.borrow_and_update().clone();
                info!(state = %current, "Session state changed");
                if current.is_terminal() {
                    // Let the queued answer finish before closing the speaker
                    let remaining = interview.queued_playback_secs();
                    if remaining > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(remaining)).await;
                    }
                    break;
                }
            }
        }
    }

    // A failure can be reported after the state change that ended the loop
    while let Ok(event) = events.try_recv() {
        if let InterviewEvent::Failed(err) = event {
            failure = Some(err);
        }
    }

    interview.stop();
    info!(summary = %interview.metrics().snapshot().summary(), "Interview finished");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::Text(text) => info!(target: "transcript", "interviewer (text): {}", text),
        SessionEvent::InputTranscript(text) => info!(target: "transcript", "candidate: {}", text),
        SessionEvent::OutputTranscript(text) => info!(target: "transcript", "interviewer: {}", text),
        SessionEvent::TurnComplete => debug!("Interviewer turn complete"),
        SessionEvent::Interrupted => debug!("Interviewer interrupted"),
        SessionEvent::GoAway { time_left } => {
            warn!(time_left = time_left.as_deref().unwrap_or("unknown"), "Service will close the session soon")
        }
    }
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "interview_voice=trace")
/// - If not set, defaults to "interview_voice=debug,info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_voice=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
///
/// ## Rust Concepts:
/// - **tokio::select!**: Waits for whichever signal comes first
/// - **cfg(unix)**: SIGTERM only exists on Unix; elsewhere only Ctrl+C is awaited
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
