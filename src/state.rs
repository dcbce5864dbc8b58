//! # Session Metrics
//!
//! Counters shared between the live session (network side), the interview controller
//! (playback side) and the binary that prints a summary at shutdown.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets the session's reader task, the capture pump and `main` all hold
//!   the same metrics object
//! - **Memory safety**: The counters live until the last holder drops its reference
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why here**: Every packet writes a counter; summaries only read
//! - **Poisoning**: A panic while holding the lock "poisons" it. Counters stay usable
//!   after a panic, so we recover the guard with `PoisonError::into_inner` instead of
//!   propagating the panic.
//!
//! ### Snapshot Pattern
//! - The lock is held only long enough to copy the counters into a plain
//!   `MetricsSnapshot`, which can then be logged or serialized without blocking anyone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

/// Raw counters behind the lock.
///
/// ## Rust Concepts:
/// - **#[derive(Default)]**: Every counter starts at zero
#[derive(Debug, Default, Clone)]
struct MetricCounters {
    packets_sent: u64,
    bytes_sent: u64,
    /// `send` called outside the Connected window (startup/teardown race)
    packets_dropped: u64,
    /// Outbound queue full
    packets_backlogged: u64,
    packets_received: u64,
    bytes_received: u64,
    audio_secs_received: f64,
    malformed_packets: u64,
    text_events: u64,
    interruptions: u64,
    turns_completed: u64,
}

/// Per-session counters.
///
/// ## Thread Safety Pattern:
/// `&self` methods take the write lock for a single increment, so callers on any
/// thread (tokio tasks, the device callback thread) can record without coordination.
#[derive(Debug)]
pub struct SessionMetrics {
    counters: RwLock<MetricCounters>,
    started_at: DateTime<Utc>,
    start_instant: Instant,
}

/// Point-in-time copy of the counters.
///
/// ## Rust Concepts:
/// - **Serialize**: Can be written as JSON with `serde_json` (e.g. for a log line)
/// - **Clone**: Plain data, safe to hand around
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub packets_backlogged: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub audio_secs_received: f64,
    pub malformed_packets: u64,
    pub text_events: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(MetricCounters::default()),
            started_at: Utc::now(),
            start_instant: Instant::now(),
        }
    }

    /// A packet was accepted onto the outbound queue.
    pub fn record_sent(&self, bytes: usize) {
        let mut counters = self.write();
        counters.packets_sent += 1;
        counters.bytes_sent += bytes as u64;
    }

    /// A packet was dropped because the session was not Connected.
    pub fn record_dropped(&self) {
        self.write().packets_dropped += 1;
    }

    /// A packet was dropped because the outbound queue was full.
    pub fn record_backlogged(&self) {
        self.write().packets_backlogged += 1;
    }

    /// An inbound audio packet was delivered.
    pub fn record_received(&self, bytes: usize, duration_secs: f64) {
        let mut counters = self.write();
        counters.packets_received += 1;
        counters.bytes_received += bytes as u64;
        counters.audio_secs_received += duration_secs;
    }

    /// An inbound audio packet could not be decoded and was dropped.
    pub fn record_malformed(&self) {
        self.write().malformed_packets += 1;
    }

    pub fn record_text_event(&self) {
        self.write().text_events += 1;
    }

    pub fn record_interruption(&self) {
        self.write().interruptions += 1;
    }

    pub fn record_turn_complete(&self) {
        self.write().turns_completed += 1;
    }

    /// Copy the counters out.
    ///
    /// ## Rust Concepts:
    /// - **read()**: Shared lock; other readers are not blocked
    /// - **Manual struct creation**: Builds the public snapshot field by field
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        MetricsSnapshot {
            started_at: self.started_at,
            uptime_secs: self.start_instant.elapsed().as_secs(),
            packets_sent: counters.packets_sent,
            bytes_sent: counters.bytes_sent,
            packets_dropped: counters.packets_dropped,
            packets_backlogged: counters.packets_backlogged,
            packets_received: counters.packets_received,
            bytes_received: counters.bytes_received,
            audio_secs_received: counters.audio_secs_received,
            malformed_packets: counters.malformed_packets,
            text_events: counters.text_events,
            interruptions: counters.interruptions,
            turns_completed: counters.turns_completed,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MetricCounters> {
        self.counters.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Share of outbound packets that never made it onto the wire.
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.packets_dropped + self.packets_backlogged;
        let total = self.packets_sent + dropped;
        if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64
        }
    }

    /// One-line human summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "sent {} packets ({} bytes), dropped {}, received {} packets ({:.1}s audio), {} malformed, {} turns, {} interruptions",
            self.packets_sent,
            self.bytes_sent,
            self.packets_dropped + self.packets_backlogged,
            self.packets_received,
            self.audio_secs_received,
            self.malformed_packets,
            self.turns_completed,
            self.interruptions
        )
    }
}
