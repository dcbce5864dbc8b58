//! # Playback Scheduling
//!
//! Renders an unbounded, irregularly-timed sequence of inbound packets as continuous audio.
//!
//! ## Scheduling Rule:
//! The scheduler keeps one cursor, the earliest time the next unit may start:
//!
//! ```text
//! start  = max(device_now, cursor)
//! cursor = start + duration
//! ```
//!
//! Packets that arrive faster than real time queue back-to-back; packets that arrive
//! late start "now", leaving a natural gap of silence. Two units can never share a start
//! time, and a later packet can never start before an earlier one ends.
//!
//! ## Components:
//! - **AudioOutput**: the device seam (clock + scheduled buffers)
//! - **PlaybackScheduler**: owns the cursor, decodes packets, hands out [`PlaybackUnit`]s
//! - **PlaybackRenderer**: sample-accurate queue used by the device callback

use crate::audio::codec;
use crate::audio::frame::EncodedPacket;
use crate::error::{AppError, AppResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Default output rate (what the remote voice is synthesized at)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A decoded buffer with an absolute start time on the output clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    /// Arrival-order index
    pub sequence: u64,
    /// Seconds on the output device clock
    pub start_time: f64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// What `enqueue` reports back about a scheduled packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub sequence: u64,
    pub start_time: f64,
    pub duration: f64,
    /// RMS of the decoded samples
    pub level: f32,
}

/// Output device seam.
///
/// `current_time` is a monotonic clock in seconds. `schedule` receives units in
/// strictly increasing start-time order.
pub trait AudioOutput: Send + Sync {
    fn current_time(&self) -> f64;

    fn schedule(&self, unit: PlaybackUnit) -> AppResult<()>;

    /// Drop every unit that has not finished playing.
    fn flush(&self) {}

    /// Release the device.
    fn close(&self) {}
}

#[derive(Debug)]
struct SchedulerState {
    next_start: f64,
    next_sequence: u64,
    torn_down: bool,
}

/// Gapless, order-preserving scheduler for inbound audio.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: Mutex::new(SchedulerState {
                next_start: 0.0,
                next_sequence: 0,
                torn_down: false,
            }),
        }
    }

    /// Decode a packet and schedule it right after everything already queued.
    ///
    /// ## Returns:
    /// - **Ok(Some(span))**: the packet was scheduled
    /// - **Ok(None)**: the scheduler is torn down or the packet was empty (no-op)
    /// - **Err(MalformedAudio)**: this packet was dropped; later packets are unaffected
    pub fn enqueue(&self, packet: &EncodedPacket) -> AppResult<Option<ScheduledSpan>> {
        // The lock is held across schedule() so two units can never be given the same start
        let mut state = self.lock_state();
        if state.torn_down {
            debug!("Ignoring packet for torn-down playback scheduler");
            return Ok(None);
        }

        let samples = packet.decode()?;
        if samples.is_empty() || packet.sample_rate() == 0 {
            return Ok(None);
        }

        let level = codec::rms(&samples);
        let start_time = self.output.current_time().max(state.next_start);
        let unit = PlaybackUnit {
            sequence: state.next_sequence,
            start_time,
            sample_rate: packet.sample_rate(),
            samples,
        };
        let span = ScheduledSpan {
            sequence: unit.sequence,
            start_time,
            duration: unit.duration(),
            level,
        };

        self.output.schedule(unit)?;

        state.next_start = start_time + span.duration;
        state.next_sequence += 1;
        Ok(Some(span))
    }

    /// Barge-in: drop everything not yet played and restart the cursor at device time.
    pub fn interrupt(&self) {
        let mut state = self.lock_state();
        if state.torn_down {
            return;
        }
        self.output.flush();
        state.next_start = self.output.current_time();
        debug!(cursor = state.next_start, "Playback interrupted, queue flushed");
    }

    /// Stop accepting packets and release the output device. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.lock_state();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        self.output.flush();
        self.output.close();
        info!(units = state.next_sequence, "Playback scheduler torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock_state().torn_down
    }

    /// Earliest start time for the next unit.
    pub fn next_start_time(&self) -> f64 {
        self.lock_state().next_start
    }

    /// Seconds of audio queued beyond the current device time.
    pub fn queued_secs(&self) -> f64 {
        let next = self.lock_state().next_start;
        (next - self.output.current_time()).max(0.0)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct QueuedUnit {
    start_frame: u64,
    samples: Vec<f32>,
    offset: usize,
}

/// Sample-accurate output queue driven by the device callback.
///
/// Time is counted in rendered frames, so the clock advances exactly as fast as the
/// device consumes audio. Units are converted to the device rate when queued, never
/// inside `render`.
#[derive(Debug)]
pub struct PlaybackRenderer {
    sample_rate: u32,
    frames_rendered: u64,
    queue: VecDeque<QueuedUnit>,
    last_end_frame: u64,
}

impl PlaybackRenderer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames_rendered: 0,
            queue: VecDeque::new(),
            last_end_frame: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device clock in seconds.
    pub fn clock_secs(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn queued_units(&self) -> usize {
        self.queue.len()
    }

    /// Queue a unit at its start time.
    ///
    /// A start frame that rounds to before the end of the previous unit is pushed back
    /// to that end, so floating-point rounding can never produce overlap.
    /// Units already at the device rate are queued as-is; [`RendererOutput`] converts
    /// before taking the lock so the render callback never waits on a resample.
    pub fn push(&mut self, unit: PlaybackUnit) {
        let samples = if unit.sample_rate == self.sample_rate {
            unit.samples
        } else {
            codec::resample_linear(&unit.samples, unit.sample_rate, self.sample_rate)
        };
        if samples.is_empty() {
            return;
        }

        let requested = (unit.start_time * self.sample_rate as f64).round().max(0.0) as u64;
        let start_frame = requested.max(self.last_end_frame).max(self.frames_rendered);
        self.last_end_frame = start_frame + samples.len() as u64;

        self.queue.push_back(QueuedUnit {
            start_frame,
            samples,
            offset: 0,
        });
    }

    /// Fill an interleaved output buffer. Unscheduled time renders as silence.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);

        for frame in out.chunks_mut(channels) {
            let now = self.frames_rendered;
            let mut value = 0.0;

            while let Some(front) = self.queue.front_mut() {
                if front.offset >= front.samples.len() {
                    self.queue.pop_front();
                    continue;
                }
                if front.start_frame + front.offset as u64 <= now {
                    value = front.samples[front.offset];
                    front.offset += 1;
                }
                break;
            }

            for slot in frame.iter_mut() {
                *slot = value;
            }
            self.frames_rendered += 1;
        }

        while matches!(self.queue.front(), Some(front) if front.offset >= front.samples.len()) {
            self.queue.pop_front();
        }
    }

    /// Drop everything queued. The clock keeps running.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_end_frame = self.frames_rendered;
    }
}

/// Adapter that lets a shared renderer act as an [`AudioOutput`].
///
/// The device backend renders from the same `Arc<Mutex<PlaybackRenderer>>`.
pub struct RendererOutput {
    renderer: Arc<Mutex<PlaybackRenderer>>,
    /// Device rate, copied out so conversion needs no lock
    sample_rate: u32,
}

impl RendererOutput {
    pub fn new(renderer: Arc<Mutex<PlaybackRenderer>>) -> Self {
        let sample_rate = renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample_rate();
        Self {
            renderer,
            sample_rate,
        }
    }

    /// Bring a unit to the device rate. Runs on the caller's thread, outside the lock.
    fn to_device_rate(&self, unit: PlaybackUnit) -> PlaybackUnit {
        if unit.sample_rate == self.sample_rate {
            return unit;
        }
        let samples = codec::resample_linear(&unit.samples, unit.sample_rate, self.sample_rate);
        PlaybackUnit {
            sequence: unit.sequence,
            start_time: unit.start_time,
            sample_rate: self.sample_rate,
            samples,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaybackRenderer> {
        self.renderer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for RendererOutput {
    fn current_time(&self) -> f64 {
        self.lock().clock_secs()
    }

    fn schedule(&self, unit: PlaybackUnit) -> AppResult<()> {
        if unit.sample_rate == 0 {
            warn!(sequence = unit.sequence, "Refusing unit with zero sample rate");
            return Err(AppError::MalformedAudio("zero sample rate".to_string()));
        }
        let unit = self.to_device_rate(unit);
        self.lock().push(unit);
        Ok(())
    }

    fn flush(&self) {
        self.lock().clear();
    }
}
