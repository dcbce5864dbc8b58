//! # Speaking Activity Tracker
//!
//! Derives a "the interviewer is talking" signal for the UI from how audio arrives.
//!
//! ## Policy:
//! - A packet arrival asserts activity immediately and records its RMS level.
//! - With no further arrivals, activity de-asserts once the quiet interval has elapsed
//!   since the last one (default 2s).
//! - Explicit speech-start / speech-end events from the remote service override the
//!   decay timer: start holds activity on until end, end drops it immediately.
//!
//! This approximates voice activity; it is only used to drive a visual indicator.
//! Playback timing never depends on it.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::trace;

/// Default quiet interval before the indicator turns off.
pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(2000);

/// Snapshot published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActivitySignal {
    pub active: bool,
    /// RMS of the most recent packet while active, 0.0 otherwise
    pub level: f32,
}

/// Rolling state behind the signal.
#[derive(Debug, Default)]
struct ActivityWindow {
    last_arrival: Option<Instant>,
    explicit_speech: Option<bool>,
    level: f32,
}

impl ActivityWindow {
    fn is_active_at(&self, now: Instant, quiet_interval: Duration) -> bool {
        match self.explicit_speech {
            Some(true) => true,
            _ => self
                .last_arrival
                .map(|last| now.saturating_duration_since(last) < quiet_interval)
                .unwrap_or(false),
        }
    }
}

pub struct SpeakingActivityTracker {
    quiet_interval: Duration,
    window: Mutex<ActivityWindow>,
    signal: watch::Sender<ActivitySignal>,
}

impl SpeakingActivityTracker {
    pub fn new(quiet_interval: Duration) -> Self {
        let (signal, _) = watch::channel(ActivitySignal::default());
        Self {
            quiet_interval,
            window: Mutex::new(ActivityWindow::default()),
            signal,
        }
    }

    pub fn quiet_interval(&self) -> Duration {
        self.quiet_interval
    }

    /// Receive every change of the published signal.
    pub fn subscribe(&self) -> watch::Receiver<ActivitySignal> {
        self.signal.subscribe()
    }

    /// Record a packet arriving now with the given RMS level.
    pub fn record_packet(&self, level: f32) {
        self.record_packet_at(Instant::now(), level);
    }

    pub fn record_packet_at(&self, now: Instant, level: f32) {
        {
            let mut window = self.lock_window();
            window.last_arrival = Some(now);
            // An arrival after an explicit end starts a new utterance
            if window.explicit_speech == Some(false) {
                window.explicit_speech = None;
            }
            window.level = level;
        }
        self.refresh_at(now);
    }

    /// The remote service reported that its voice started.
    ///
    /// Gemini Live has no speech-start message, so the interview relies on packet
    /// arrivals; this is the hook for services that announce it explicitly. Holds the
    /// indicator on through pauses longer than the quiet interval until `speech_ended`.
    pub fn speech_started(&self) {
        let now = Instant::now();
        self.lock_window().explicit_speech = Some(true);
        self.refresh_at(now);
    }

    /// The remote service reported that its voice ended (or was interrupted).
    pub fn speech_ended(&self) {
        let now = Instant::now();
        {
            let mut window = self.lock_window();
            window.explicit_speech = Some(false);
            window.last_arrival = None;
            window.level = 0.0;
        }
        self.refresh_at(now);
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.lock_window().is_active_at(now, self.quiet_interval)
    }

    /// Current signal without publishing it.
    pub fn current_at(&self, now: Instant) -> ActivitySignal {
        let window = self.lock_window();
        let active = window.is_active_at(now, self.quiet_interval);
        ActivitySignal {
            active,
            level: if active { window.level } else { 0.0 },
        }
    }

    /// Recompute the signal and publish it if it changed.
    ///
    /// Called on every arrival and periodically by the owner so the decay is observed.
    pub fn refresh(&self) -> ActivitySignal {
        self.refresh_at(Instant::now())
    }

    pub fn refresh_at(&self, now: Instant) -> ActivitySignal {
        let current = self.current_at(now);
        self.signal.send_if_modified(|published| {
            if *published != current {
                trace!(active = current.active, level = current.level, "Speaking activity changed");
                *published = current;
                true
            } else {
                false
            }
        });
        current
    }

    /// Back to inactive; used when the session ends.
    pub fn reset(&self) {
        *self.lock_window() = ActivityWindow::default();
        self.signal.send_replace(ActivitySignal::default());
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, ActivityWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SpeakingActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_INTERVAL)
    }
}
