//! # Stream Session
//!
//! Owns the bidirectional connection to the live service and exposes its lifecycle as an
//! explicit state machine.
//!
//! ## State Machine:
//! ```text
//! Idle ──connect()──> Connecting ──ack──> Connected ──disconnect()──> Closing ──> Closed
//!                          │                  │
//!                          └──── error ───────┴──> Failed(reason)
//! ```
//! `Closed` and `Failed` are terminal for the connection but not for the session object:
//! `connect` may be called again from either (and from `Idle`).
//!
//! ## Concurrency:
//! - `send` and `disconnect` are synchronous and never block on the network. `send`
//!   pushes onto a bounded queue with `try_send`; the connector's writer task drains it.
//! - A single reader task per connection routes downstream events to the registered
//!   handlers, one at a time, in arrival order.
//! - Transitions happen under one mutex; the current state is published on a
//!   `tokio::sync::watch` channel so callers can await changes.
//! - Resources (outbound queue, reader task, attached capture engine) are held in
//!   `Option`s and released with `take()`, so each is released exactly once no matter
//!   how often or from where teardown runs.

use crate::audio::capture::CaptureEngine;
use crate::audio::frame::EncodedPacket;
use crate::error::{AppError, AppResult};
use crate::state::SessionMetrics;
use crate::websocket::{Inbound, LiveConnector, Outbound, ServerEvent};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub use crate::websocket::BehaviorConfig;

/// Default bound on how long `connect` waits for the service to acknowledge setup.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle of a [`StreamSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed(String),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Closed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Non-audio messages delivered to the event handler.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Text(String),
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
    Interrupted,
    GoAway { time_left: Option<String> },
}

pub type AudioHandler = Arc<dyn Fn(EncodedPacket) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&AppError) + Send + Sync>;

/// Callbacks for downstream traffic.
///
/// Handlers run on the session's reader task and should only hand work off
/// (enqueue, send on a channel); a slow handler delays every later event.
#[derive(Clone, Default)]
pub struct SessionHandlers {
    audio: Option<AudioHandler>,
    event: Option<EventHandler>,
    error: Option<ErrorHandler>,
}

impl SessionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once per inbound audio packet, in arrival order.
    pub fn on_audio(mut self, handler: impl Fn(EncodedPacket) + Send + Sync + 'static) -> Self {
        self.audio = Some(Arc::new(handler));
        self
    }

    /// Called for every inbound text or control event.
    pub fn on_event(mut self, handler: impl Fn(SessionEvent) + Send + Sync + 'static) -> Self {
        self.event = Some(Arc::new(handler));
        self
    }

    /// Called when an established connection fails.
    pub fn on_error(mut self, handler: impl Fn(&AppError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandlers")
            .field("audio", &self.audio.is_some())
            .field("event", &self.event.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Resources that exist only while a connection is up.
#[derive(Default)]
struct Connection {
    outbound: Option<mpsc::Sender<Outbound>>,
    reader: Option<JoinHandle<()>>,
    capture: Option<Arc<CaptureEngine>>,
    connected_at: Option<DateTime<Utc>>,
    /// Bumped on every connect so stale reader tasks can recognise themselves
    generation: u64,
}

/// What teardown took out of a [`Connection`].
struct Released {
    outbound: Option<mpsc::Sender<Outbound>>,
    reader: Option<JoinHandle<()>>,
    capture: Option<Arc<CaptureEngine>>,
}

impl Connection {
    fn release(&mut self) -> Released {
        self.connected_at = None;
        Released {
            outbound: self.outbound.take(),
            reader: self.reader.take(),
            capture: self.capture.take(),
        }
    }
}

struct Shared {
    id: Uuid,
    connector: Arc<dyn LiveConnector>,
    handlers: SessionHandlers,
    connect_timeout: Duration,
    state: watch::Sender<SessionState>,
    connection: Mutex<Connection>,
    metrics: Arc<SessionMetrics>,
}

/// One conversation with the live service.
pub struct StreamSession {
    shared: Arc<Shared>,
}

impl StreamSession {
    pub fn new(connector: Arc<dyn LiveConnector>, handlers: SessionHandlers, connect_timeout: Duration) -> Self {
        Self::with_metrics(connector, handlers, connect_timeout, Arc::new(SessionMetrics::new()))
    }

    /// Session that records into metrics shared with the caller.
    pub fn with_metrics(
        connector: Arc<dyn LiveConnector>,
        handlers: SessionHandlers,
        connect_timeout: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                connector,
                handlers,
                connect_timeout,
                state,
                connection: Mutex::new(Connection::default()),
                metrics,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.current()
    }

    /// Watch every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock_connection().connected_at
    }

    /// Open the connection and wait for the service to acknowledge setup.
    ///
    /// ## Errors:
    /// - **Authentication**: empty credential (state unchanged), or the service refused it (state Failed)
    /// - **Transport**: network failure or no acknowledgment within the connect timeout (state Failed)
    /// - **InvalidState**: already connecting/connected/closing, or disconnected while connecting
    pub async fn connect(&self, credential: &str, behavior: &BehaviorConfig) -> AppResult<()> {
        let shared = &self.shared;

        if credential.trim().is_empty() {
            warn!(session_id = %shared.id, "Connect attempted without a credential");
            return Err(AppError::Authentication("no credential provided".to_string()));
        }

        let generation = {
            let mut connection = shared.lock_connection();
            let current = shared.current();
            if !matches!(
                current,
                SessionState::Idle | SessionState::Closed | SessionState::Failed(_)
            ) {
                return Err(AppError::InvalidState(format!(
                    "cannot connect while {}",
                    current.as_str()
                )));
            }
            connection.generation += 1;
            shared.set_state(SessionState::Connecting);
            connection.generation
        };

        info!(session_id = %shared.id, model = %behavior.model, "Opening live session");

        let opened = match tokio::time::timeout(
            shared.connect_timeout,
            shared.connector.open(credential, behavior),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Transport(format!(
                "connection not established within {}ms",
                shared.connect_timeout.as_millis()
            ))),
        };

        let mut connection = shared.lock_connection();
        let still_ours =
            connection.generation == generation && shared.current() == SessionState::Connecting;

        match opened {
            Ok(live) if still_ours => {
                connection.outbound = Some(live.outbound);
                connection.connected_at = Some(Utc::now());
                connection.reader = Some(tokio::spawn(route_inbound(
                    Arc::clone(shared),
                    live.inbound,
                    generation,
                )));
                shared.set_state(SessionState::Connected);
                info!(session_id = %shared.id, "Live session connected");
                Ok(())
            }
            Ok(_live) => {
                // Dropping the channels closes the socket
                debug!(session_id = %shared.id, "Connection opened after disconnect, discarding");
                Err(AppError::InvalidState(
                    "session was disconnected while connecting".to_string(),
                ))
            }
            Err(err) => {
                if still_ours {
                    shared.set_state(SessionState::Failed(err.to_string()));
                }
                warn!(session_id = %shared.id, error = %err, kind = err.kind(), "Live session failed to connect");
                Err(err)
            }
        }
    }

    /// Forward a packet upstream.
    ///
    /// Only Connected sessions forward; in every other state the packet is silently
    /// dropped, which covers capture starting before the handshake finishes and frames
    /// still in flight during teardown. Never blocks and never fails.
    pub fn send(&self, packet: EncodedPacket) {
        let shared = &self.shared;
        let connection = shared.lock_connection();

        let outbound = match connection.outbound.as_ref() {
            Some(outbound) if shared.is_connected() => outbound,
            _ => {
                shared.metrics.record_dropped();
                trace!(session_id = %shared.id, state = shared.current().as_str(), "Dropping packet outside Connected");
                return;
            }
        };

        let bytes = packet.bytes().len();
        match outbound.try_send(Outbound::Audio(packet)) {
            Ok(()) => shared.metrics.record_sent(bytes),
            Err(TrySendError::Full(_)) => {
                shared.metrics.record_backlogged();
                warn!(session_id = %shared.id, "Outbound queue full, dropping packet");
            }
            Err(TrySendError::Closed(_)) => {
                shared.metrics.record_dropped();
                debug!(session_id = %shared.id, "Outbound queue closed, dropping packet");
            }
        }
    }

    /// Hand the session a capture engine to release on teardown.
    ///
    /// Outside Connected the engine is stopped immediately.
    pub fn attach_capture(&self, capture: Arc<CaptureEngine>) {
        let replaced = {
            let mut connection = self.shared.lock_connection();
            if self.shared.is_connected() {
                connection.capture.replace(capture)
            } else {
                Some(capture)
            }
        };
        if let Some(engine) = replaced {
            engine.stop();
        }
    }

    /// Close the connection and release the capture device. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let released = {
            let mut connection = shared.lock_connection();
            let current = shared.current();
            if !matches!(current, SessionState::Connecting | SessionState::Connected) {
                debug!(session_id = %shared.id, state = current.as_str(), "Disconnect: nothing to close");
                return;
            }
            shared.set_state(SessionState::Closing);
            connection.release()
        };

        if let Some(reader) = released.reader {
            reader.abort();
        }
        if let Some(capture) = released.capture {
            capture.stop();
        }
        if let Some(outbound) = released.outbound {
            let _ = outbound.try_send(Outbound::AudioStreamEnd);
            let _ = outbound.try_send(Outbound::Close);
        }

        let _connection = shared.lock_connection();
        shared.set_state(SessionState::Closed);
        info!(session_id = %shared.id, summary = %shared.metrics.snapshot().summary(), "Live session closed");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Connected)
    }

    /// Callers hold the connection lock, which serializes transitions.
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            debug!(session_id = %self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one downstream event. An `Err` ends the connection.
    fn route_event(&self, event: ServerEvent) -> AppResult<()> {
        if !self.is_connected() {
            trace!(session_id = %self.id, "Ignoring event after teardown");
            return Ok(());
        }

        let session_event = match event {
            ServerEvent::Audio(packet) => {
                self.metrics.record_received(packet.bytes().len(), packet.duration_secs());
                if let Some(handler) = &self.handlers.audio {
                    handler(packet);
                }
                return Ok(());
            }
            ServerEvent::MalformedAudio(reason) => {
                self.metrics.record_malformed();
                warn!(session_id = %self.id, reason = %reason, "Dropped malformed inbound audio");
                return Ok(());
            }
            ServerEvent::SetupComplete => {
                debug!(session_id = %self.id, "Duplicate setup acknowledgment");
                return Ok(());
            }
            ServerEvent::Error(message) => return Err(AppError::Transport(message)),
            ServerEvent::Text(text) => {
                self.metrics.record_text_event();
                SessionEvent::Text(text)
            }
            ServerEvent::InputTranscript(text) => {
                self.metrics.record_text_event();
                SessionEvent::InputTranscript(text)
            }
            ServerEvent::OutputTranscript(text) => {
                self.metrics.record_text_event();
                SessionEvent::OutputTranscript(text)
            }
            ServerEvent::TurnComplete => {
                self.metrics.record_turn_complete();
                SessionEvent::TurnComplete
            }
            ServerEvent::Interrupted => {
                self.metrics.record_interruption();
                SessionEvent::Interrupted
            }
            ServerEvent::GoAway { time_left } => {
                info!(session_id = %self.id, time_left = ?time_left, "Service will close the connection soon");
                SessionEvent::GoAway { time_left }
            }
        };

        if let Some(handler) = &self.handlers.event {
            handler(session_event);
        }
        Ok(())
    }

    /// Tear down after the remote ended the connection.
    ///
    /// A normal close lands in Closed; anything else is a transport failure.
    fn remote_closed(&self, generation: u64, code: Option<u16>, reason: &str) {
        if matches!(code, Some(1000) | Some(1001)) {
            if self.end_connection(generation, SessionState::Closed).is_some() {
                info!(session_id = %self.id, code = ?code, reason = %reason, "Live service closed the session");
            }
        } else {
            let err = AppError::Transport(match code {
                Some(code) => format!("connection closed ({}): {}", code, reason),
                None => format!("connection lost: {}", reason),
            });
            self.fail(generation, err);
        }
    }

    fn fail(&self, generation: u64, err: AppError) {
        let reason = err.to_string();
        if self
            .end_connection(generation, SessionState::Failed(reason))
            .is_none()
        {
            return;
        }

        error!(session_id = %self.id, error = %err, kind = err.kind(), "Live session failed");
        if let Some(handler) = &self.handlers.error {
            handler(&err);
        }
    }

    /// Move a live connection of this generation to `terminal`, releasing its resources.
    /// Returns `None` when the connection was already torn down.
    fn end_connection(&self, generation: u64, terminal: SessionState) -> Option<()> {
        let released = {
            let mut connection = self.lock_connection();
            if connection.generation != generation || !self.is_connected() {
                debug!(session_id = %self.id, "Connection already torn down");
                return None;
            }
            self.set_state(terminal);
            connection.release()
        };

        // The reader is the calling task; dropping the handle detaches it
        drop(released.reader);
        drop(released.outbound);
        if let Some(capture) = released.capture {
            capture.stop();
        }
        Some(())
    }
}

/// Reader task: one per connection, routes events until the connection ends.
async fn route_inbound(shared: Arc<Shared>, mut inbound: mpsc::Receiver<Inbound>, generation: u64) {
    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Event(event) => {
                if let Err(err) = shared.route_event(event) {
                    shared.fail(generation, err);
                    return;
                }
            }
            Inbound::Closed { code, reason } => {
                shared.remote_closed(generation, code, &reason);
                return;
            }
            Inbound::Failed(err) => {
                shared.fail(generation, err);
                return;
            }
        }
    }
    shared.remote_closed(generation, None, "connection ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{AudioInput, FrameAssembler, InputHandle};
    use crate::audio::codec;
    use crate::websocket::LiveConnection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// The service side of a fake connection.
    struct FakeRemote {
        outbound: mpsc::Receiver<Outbound>,
        inbound: mpsc::Sender<Inbound>,
    }

    #[derive(Default)]
    struct FakeConnector {
        reject: Option<AppError>,
        hang: bool,
        opens: AtomicUsize,
        remotes: Mutex<Vec<FakeRemote>>,
    }

    impl FakeConnector {
        fn remote(&self) -> FakeRemote {
            self.remotes.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl LiveConnector for FakeConnector {
        async fn open(&self, _credential: &str, _behavior: &BehaviorConfig) -> AppResult<LiveConnection> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(err) = &self.reject {
                return Err(err.clone());
            }
            let (outbound_tx, outbound_rx) = mpsc::channel(16);
            let (inbound_tx, inbound_rx) = mpsc::channel(16);
            self.remotes.lock().unwrap().push(FakeRemote {
                outbound: outbound_rx,
                inbound: inbound_tx,
            });
            Ok(LiveConnection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
    }

    /// Opens instantly and counts releases.
    struct CountingInput {
        releases: Arc<AtomicUsize>,
    }

    impl AudioInput for CountingInput {
        fn open(&self, assembler: FrameAssembler) -> AppResult<InputHandle> {
            let releases = Arc::clone(&self.releases);
            Ok(InputHandle::new(move || {
                drop(assembler);
                releases.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn behavior() -> BehaviorConfig {
        BehaviorConfig {
            system_instruction: "interviewer".to_string(),
            voice: "Kore".to_string(),
            model: "test-model".to_string(),
            transcripts: false,
        }
    }

    fn session(connector: Arc<FakeConnector>, handlers: SessionHandlers) -> StreamSession {
        StreamSession::new(connector, handlers, Duration::from_secs(2))
    }

    fn silent_packet() -> EncodedPacket {
        EncodedPacket::from_pcm(codec::encode_pcm16(&vec![0.0; 4096]), 16_000)
    }

    async fn wait_for_state(session: &StreamSession, wanted: fn(&SessionState) -> bool) -> SessionState {
        let mut rx = session.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| wanted(s)))
            .await
            .expect("state change timed out")
            .expect("state channel closed")
            .clone();
        state
    }

    #[tokio::test]
    async fn test_send_while_idle_is_dropped() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());

        session.send(silent_packet());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.metrics().snapshot().packets_dropped, 1);
        assert_eq!(session.metrics().snapshot().packets_sent, 0);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_credential_never_connects() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());

        let err = session.connect("", &behavior()).await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 0);

        let err = session.connect("   ", &behavior()).await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_rejected_credential_fails_session() {
        let connector = Arc::new(FakeConnector {
            reject: Some(AppError::Authentication("API key not valid".to_string())),
            ..FakeConnector::default()
        });
        let session = session(connector, SessionHandlers::new());

        let err = session.connect("bad-key", &behavior()).await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
        assert!(matches!(session.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let connector = Arc::new(FakeConnector {
            hang: true,
            ..FakeConnector::default()
        });
        let session = StreamSession::new(connector, SessionHandlers::new(), Duration::from_millis(50));

        let err = session.connect("key", &behavior()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(matches!(session.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_connected_send_forwards_packet() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());

        session.connect("key", &behavior()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.connected_at().is_some());

        session.send(silent_packet());
        let mut remote = connector.remote();
        match remote.outbound.recv().await {
            Some(Outbound::Audio(packet)) => {
                assert_eq!(packet.bytes().len(), 8192);
                assert_eq!(packet.sample_rate(), 16_000);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(session.metrics().snapshot().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_double_connect_is_invalid() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector, SessionHandlers::new());
        session.connect("key", &behavior()).await.unwrap();

        let err = session.connect("key", &behavior()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_releases_once() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());
        session.connect("key", &behavior()).await.unwrap();

        let releases = Arc::new(AtomicUsize::new(0));
        let capture = Arc::new(CaptureEngine::with_defaults(Arc::new(CountingInput {
            releases: Arc::clone(&releases),
        })));
        let _frames = capture.start().await.unwrap();
        session.attach_capture(Arc::clone(&capture));

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(!capture.is_active());

        let mut remote = connector.remote();
        assert!(matches!(remote.outbound.recv().await, Some(Outbound::AudioStreamEnd)));
        assert!(matches!(remote.outbound.recv().await, Some(Outbound::Close)));
        assert!(remote.outbound.recv().await.is_none());

        // Late frames after teardown are dropped quietly
        session.send(silent_packet());
        assert_eq!(session.metrics().snapshot().packets_dropped, 1);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let session = session(Arc::new(FakeConnector::default()), SessionHandlers::new());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_inbound_routing_preserves_order() {
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handlers = SessionHandlers::new()
            .on_audio(move |packet| {
                let _ = audio_tx.send(packet);
            })
            .on_event(move |event| {
                let _ = event_tx.send(event);
            });

        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), handlers);
        session.connect("key", &behavior()).await.unwrap();
        let remote = connector.remote();

        let first = EncodedPacket::from_pcm(vec![1, 0], 24_000);
        let second = EncodedPacket::from_pcm(vec![2, 0, 3, 0], 24_000);
        for event in [
            ServerEvent::Audio(first.clone()),
            ServerEvent::Text("Bonjour".to_string()),
            ServerEvent::MalformedAudio("bad".to_string()),
            ServerEvent::Audio(second.clone()),
            ServerEvent::TurnComplete,
        ] {
            remote.inbound.send(Inbound::Event(event)).await.unwrap();
        }

        assert_eq!(audio_rx.recv().await.unwrap(), first);
        assert_eq!(audio_rx.recv().await.unwrap(), second);
        assert_eq!(event_rx.recv().await.unwrap(), SessionEvent::Text("Bonjour".to_string()));
        assert_eq!(event_rx.recv().await.unwrap(), SessionEvent::TurnComplete);

        let snapshot = session.metrics().snapshot();
        assert_eq!(snapshot.packets_received, 2);
        assert_eq!(snapshot.malformed_packets, 1);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(audio_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_failure_moves_to_failed() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handlers = SessionHandlers::new().on_error(move |err| sink.lock().unwrap().push(err.clone()));

        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), handlers);
        session.connect("key", &behavior()).await.unwrap();

        let releases = Arc::new(AtomicUsize::new(0));
        let capture = Arc::new(CaptureEngine::with_defaults(Arc::new(CountingInput {
            releases: Arc::clone(&releases),
        })));
        let _frames = capture.start().await.unwrap();
        session.attach_capture(capture);

        let remote = connector.remote();
        remote
            .inbound
            .send(Inbound::Failed(AppError::Transport("connection reset".to_string())))
            .await
            .unwrap();

        let state = wait_for_state(&session, |s| s.is_terminal()).await;
        assert!(matches!(state, SessionState::Failed(_)));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(errors.lock().unwrap()[0].kind(), "transport");

        // Disconnect after failure has nothing left to do
        session.disconnect();
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_event_fails_session() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());
        session.connect("key", &behavior()).await.unwrap();

        let remote = connector.remote();
        remote
            .inbound
            .send(Inbound::Event(ServerEvent::Error("quota exceeded".to_string())))
            .await
            .unwrap();

        let state = wait_for_state(&session, |s| s.is_terminal()).await;
        assert_eq!(
            state,
            SessionState::Failed("Transport error: quota exceeded".to_string())
        );
    }

    #[tokio::test]
    async fn test_normal_remote_close_then_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let session = session(connector.clone(), SessionHandlers::new());
        session.connect("key", &behavior()).await.unwrap();

        let remote = connector.remote();
        remote
            .inbound
            .send(Inbound::Closed {
                code: Some(1000),
                reason: "bye".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(wait_for_state(&session, |s| s.is_terminal()).await, SessionState::Closed);

        session.connect("key", &behavior()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(SessionState::Failed("boom".to_string()).to_string(), "failed (boom)");
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }
}
