//! # Capture Engine
//!
//! Turns a live microphone into a continuous sequence of fixed-size [`AudioFrame`]s.
//!
//! ## Pipeline:
//! ```text
//! device callback ──> FrameAssembler::push ──(unbounded channel)──> FrameStream ──> consumer
//! ```
//!
//! The device callback runs on a real-time audio thread. The only work done there is
//! format conversion (downmix / resample, done by the device backend) and slicing into
//! frames. Sending on an unbounded `tokio::sync::mpsc` channel never blocks, so the
//! callback never waits for the network side. PCM encoding happens on the consumer side.
//!
//! ## Lifecycle:
//! `Ready --start()--> Active --stop()--> Stopped`. An engine is not restartable;
//! create a new one for a new session. `stop()` is idempotent and also runs on drop,
//! so the device is released on every exit path.

use crate::audio::frame::AudioFrame;
use crate::error::{AppError, AppResult};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Sample rate of upstream audio (what the remote service expects)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per captured frame (256ms at 16kHz)
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Lazy, non-restartable stream of captured frames.
///
/// Ends when the capture engine stops and the device releases its sink.
pub type FrameStream = UnboundedReceiverStream<AudioFrame>;

/// Callback-side frame builder.
///
/// Owned by the device callback. Accumulates mono samples at `sample_rate` and emits
/// one frame every `frame_size` samples.
pub struct FrameAssembler {
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    next_sequence: u64,
    tx: mpsc::UnboundedSender<AudioFrame>,
    consumer_gone: bool,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32, tx: mpsc::UnboundedSender<AudioFrame>) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size),
            frame_size: frame_size.max(1),
            sample_rate,
            next_sequence: 0,
            tx,
            consumer_gone: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append mono samples, emitting every frame that becomes complete.
    ///
    /// Returns `false` once the consuming side has gone away; later pushes are ignored.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if self.consumer_gone {
            return false;
        }

        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                let frame = AudioFrame::new(samples, self.sample_rate, self.next_sequence);
                self.next_sequence += 1;

                if self.tx.send(frame).is_err() {
                    self.consumer_gone = true;
                    return false;
                }
            }
        }

        true
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }
}

/// An open input device. Releasing it (explicitly or by drop) stops the device.
pub struct InputHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl InputHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the device. Runs the release action at most once.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for InputHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHandle")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Microphone seam.
///
/// `open` may block while the platform asks for permission; the engine calls it on a
/// blocking-pool thread. Implementations move the assembler into their audio callback
/// and must drop it when the returned handle is released.
pub trait AudioInput: Send + Sync {
    fn open(&self, assembler: FrameAssembler) -> AppResult<InputHandle>;
}

#[derive(Debug)]
enum CaptureState {
    Ready,
    Starting,
    Active(InputHandle),
    Stopped,
}

/// Produces frames from an [`AudioInput`] for as long as it is active.
pub struct CaptureEngine {
    input: Arc<dyn AudioInput>,
    sample_rate: u32,
    frame_size: usize,
    state: Mutex<CaptureState>,
}

impl CaptureEngine {
    pub fn new(input: Arc<dyn AudioInput>, sample_rate: u32, frame_size: usize) -> Self {
        Self {
            input,
            sample_rate,
            frame_size,
            state: Mutex::new(CaptureState::Ready),
        }
    }

    /// Engine with the upstream defaults (16kHz, 4096-sample frames).
    pub fn with_defaults(input: Arc<dyn AudioInput>) -> Self {
        Self::new(input, CAPTURE_SAMPLE_RATE, CAPTURE_FRAME_SIZE)
    }

    /// Acquire the microphone and start producing frames.
    ///
    /// ## Errors:
    /// - **DeviceUnavailable**: no device, or access denied
    /// - **InvalidState**: the engine was already started (engines are not restartable)
    pub async fn start(&self) -> AppResult<FrameStream> {
        {
            let mut state = self.lock_state();
            match *state {
                CaptureState::Ready => *state = CaptureState::Starting,
                _ => {
                    return Err(AppError::InvalidState(
                        "capture engine has already been started".to_string(),
                    ))
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let assembler = FrameAssembler::new(self.frame_size, self.sample_rate, tx);
        let input = Arc::clone(&self.input);

        let opened = tokio::task::spawn_blocking(move || input.open(assembler))
            .await
            .map_err(|e| AppError::DeviceUnavailable(format!("device open task failed: {}", e)))
            .and_then(|result| result);

        let mut state = self.lock_state();
        match opened {
            Ok(handle) => {
                if matches!(*state, CaptureState::Stopped) {
                    // stop() won the race; the handle drops here and the stream ends
                    debug!("Capture stopped while the device was opening");
                } else {
                    *state = CaptureState::Active(handle);
                    info!(
                        sample_rate = self.sample_rate,
                        frame_size = self.frame_size,
                        "Microphone capture started"
                    );
                }
                Ok(UnboundedReceiverStream::new(rx))
            }
            Err(err) => {
                warn!(error = %err, "Microphone capture failed to start");
                *state = CaptureState::Stopped;
                Err(err)
            }
        }
    }

    /// Disconnect the capture graph and release the device. Idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), CaptureState::Stopped);
        if let CaptureState::Active(mut handle) = previous {
            handle.release();
            info!("Microphone capture stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock_state(), CaptureState::Active(_))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
