//! # Interview Controller
//!
//! Wires the three pipeline components together for one interview:
//!
//! ```text
//! CaptureEngine ──frames──> pump task ──EncodedPacket──> StreamSession ──> service
//!                                                             │
//!            PlaybackScheduler <──audio handler───────────────┤
//!            SpeakingActivityTracker <──audio / interrupted───┘
//! ```
//!
//! The components never call each other directly; the controller registers the session
//! handlers and owns the tasks that move data between them. `start` connects first and
//! only then opens the microphone, so the device is never held without a session.

use crate::audio::activity::{ActivitySignal, SpeakingActivityTracker, DEFAULT_QUIET_INTERVAL};
use crate::audio::capture::{AudioInput, CaptureEngine, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE};
use crate::audio::frame::EncodedPacket;
use crate::audio::playback::{AudioOutput, PlaybackScheduler};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::session::{
    BehaviorConfig, SessionEvent, SessionHandlers, SessionState, StreamSession, DEFAULT_CONNECT_TIMEOUT,
};
use crate::state::SessionMetrics;
use crate::websocket::LiveConnector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the controller needs besides the three device/network seams.
#[derive(Debug, Clone)]
pub struct InterviewSettings {
    pub behavior: BehaviorConfig,
    pub capture_sample_rate: u32,
    pub frame_size: usize,
    pub connect_timeout: Duration,
    pub quiet_interval: Duration,
    pub refresh_interval: Duration,
}

impl InterviewSettings {
    pub fn new(behavior: BehaviorConfig) -> Self {
        Self {
            behavior,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            frame_size: CAPTURE_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            quiet_interval: DEFAULT_QUIET_INTERVAL,
            refresh_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            behavior: config.behavior()?,
            capture_sample_rate: config.capture.sample_rate,
            frame_size: config.capture.frame_size,
            connect_timeout: config.connect_timeout(),
            quiet_interval: config.quiet_interval(),
            refresh_interval: config.refresh_interval(),
        })
    }
}

/// What the interview reports to its owner (the console, a UI).
#[derive(Debug, Clone, PartialEq)]
pub enum InterviewEvent {
    Session(SessionEvent),
    /// The connection failed mid-interview; queued audio still plays out
    Failed(AppError),
}

/// One voice interview.
///
/// Not restartable after [`Interview::stop`]; a failed connection can be retried with
/// another [`Interview::start`].
pub struct Interview {
    session: Arc<StreamSession>,
    scheduler: Arc<PlaybackScheduler>,
    tracker: Arc<SpeakingActivityTracker>,
    metrics: Arc<SessionMetrics>,
    input: Arc<dyn AudioInput>,
    settings: InterviewSettings,
    events: Mutex<Option<mpsc::UnboundedReceiver<InterviewEvent>>>,
    capture: Mutex<Option<Arc<CaptureEngine>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Interview {
    pub fn new(
        settings: InterviewSettings,
        connector: Arc<dyn LiveConnector>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let scheduler = Arc::new(PlaybackScheduler::new(output));
        let tracker = Arc::new(SpeakingActivityTracker::new(settings.quiet_interval));
        let metrics = Arc::new(SessionMetrics::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handlers = SessionHandlers::new()
            .on_audio({
                let scheduler = Arc::clone(&scheduler);
                let tracker = Arc::clone(&tracker);
                let metrics = Arc::clone(&metrics);
                move |packet: EncodedPacket| match scheduler.enqueue(&packet) {
                    Ok(Some(span)) => tracker.record_packet(span.level),
                    Ok(None) => {}
                    Err(err) => {
                        // One bad packet never ends the interview
                        metrics.record_malformed();
                        warn!(error = %err, bytes = packet.bytes().len(), "Dropped inbound audio packet");
                    }
                }
            })
            .on_event({
                let scheduler = Arc::clone(&scheduler);
                let tracker = Arc::clone(&tracker);
                let events_tx = events_tx.clone();
                move |event: SessionEvent| {
                    if event == SessionEvent::Interrupted {
                        // Barge-in: the candidate is talking, drop what the interviewer had left
                        scheduler.interrupt();
                        tracker.speech_ended();
                    }
                    let _ = events_tx.send(InterviewEvent::Session(event));
                }
            })
            .on_error(move |err: &AppError| {
                let _ = events_tx.send(InterviewEvent::Failed(err.clone()));
            });

        let session = Arc::new(StreamSession::with_metrics(
            connector,
            handlers,
            settings.connect_timeout,
            Arc::clone(&metrics),
        ));

        Self {
            session,
            scheduler,
            tracker,
            metrics,
            input,
            settings,
            events: Mutex::new(Some(events_rx)),
            capture: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Connect, then open the microphone and start streaming.
    ///
    /// ## Errors:
    /// - **Authentication / Transport**: from `StreamSession::connect`
    /// - **DeviceUnavailable**: microphone could not be opened (the session is closed again)
    /// - **InvalidState**: the interview was stopped, or is already running
    pub async fn start(&self, credential: &str) -> AppResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState("interview has been stopped".to_string()));
        }

        self.session.connect(credential, &self.settings.behavior).await?;

        let capture = Arc::new(CaptureEngine::new(
            Arc::clone(&self.input),
            self.settings.capture_sample_rate,
            self.settings.frame_size,
        ));
        let mut frames = match capture.start().await {
            Ok(frames) => frames,
            Err(err) => {
                warn!(error = %err, "Microphone unavailable, closing session");
                self.session.disconnect();
                return Err(err);
            }
        };
        // stop() or a remote failure may have won while the microphone was opening;
        // stop() takes this lock last, so nothing can be spawned behind its back
        let mut tasks = self.lock_tasks();
        if self.stopped.load(Ordering::SeqCst) || self.session.state() != SessionState::Connected {
            drop(tasks);
            capture.stop();
            warn!(state = %self.session.state(), "Interview ended while the microphone was opening");
            return Err(AppError::InvalidState(
                "interview ended before capture started".to_string(),
            ));
        }

        self.session.attach_capture(Arc::clone(&capture));
        if let Some(previous) = self.lock_capture().replace(capture) {
            previous.stop();
        }
        for task in tasks.drain(..) {
            task.abort();
        }

        // Encoding happens here, off the device callback
        let session = Arc::clone(&self.session);
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                session.send(EncodedPacket::from_frame(frame));
            }
            debug!("Capture stream ended");
        }));

        let tracker = Arc::clone(&self.tracker);
        let refresh_interval = self.settings.refresh_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            loop {
                ticker.tick().await;
                tracker.refresh();
            }
        }));

        info!(session_id = %self.session.id(), "Interview started");
        Ok(())
    }

    /// Stop capture, close the session and release the speaker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(capture) = self.lock_capture().take() {
            capture.stop();
        }
        self.session.disconnect();
        self.tracker.reset();
        self.scheduler.teardown();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        info!(session_id = %self.session.id(), "Interview stopped");
    }

    /// Transcripts, control events and failures. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<InterviewEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    /// Speaking indicator.
    pub fn subscribe_activity(&self) -> watch::Receiver<ActivitySignal> {
        self.tracker.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        self.tracker.is_active()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Playback queue. Keeps accepting audio after a connection failure, until `stop`.
    pub fn scheduler(&self) -> Arc<PlaybackScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Seconds of interviewer audio queued but not yet played.
    pub fn queued_playback_secs(&self) -> f64 {
        self.scheduler.queued_secs()
    }

    fn lock_capture(&self) -> std::sync::MutexGuard<'_, Option<Arc<CaptureEngine>>> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Interview {
    fn drop(&mut self) {
        self.stop();
    }
}
