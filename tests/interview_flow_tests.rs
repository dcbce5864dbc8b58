//! End-to-end flows through the public API, with scripted devices and a fake service.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use interview_voice::audio::capture::{AudioInput, FrameAssembler, InputHandle};
use interview_voice::audio::codec;
use interview_voice::audio::frame::EncodedPacket;
use interview_voice::audio::playback::{AudioOutput, PlaybackUnit};
use interview_voice::session::BehaviorConfig;
use interview_voice::websocket::{
    Inbound, LiveConnection, LiveConnector, Outbound, ServerEvent, TungsteniteConnector,
};
use interview_voice::{
    AppError, AppResult, Interview, InterviewEvent, InterviewSettings, SessionEvent, SessionState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(2);

/// The service side of a fake connection.
struct Remote {
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
}

#[derive(Default)]
struct FakeConnector {
    opens: AtomicUsize,
    remotes: Mutex<Vec<Remote>>,
}

impl FakeConnector {
    fn remote(&self) -> Remote {
        self.remotes.lock().unwrap().remove(0)
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn open(&self, _credential: &str, _behavior: &BehaviorConfig) -> AppResult<LiveConnection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        self.remotes.lock().unwrap().push(Remote {
            outbound: outbound_rx,
            inbound: inbound_tx,
        });
        Ok(LiveConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Microphone that delivers a fixed number of samples as soon as it is opened.
struct ScriptedInput {
    samples: Vec<f32>,
    opens: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedInput {
    fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            opens: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioInput for ScriptedInput {
    fn open(&self, mut assembler: FrameAssembler) -> AppResult<InputHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        assembler.push(&self.samples);
        let releases = Arc::clone(&self.releases);
        Ok(InputHandle::new(move || {
            drop(assembler);
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Output device whose clock only moves when the test says so.
#[derive(Default)]
struct ManualOutput {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<PlaybackUnit>>,
    flushes: AtomicUsize,
    closes: AtomicUsize,
}

impl ManualOutput {
    fn advance(&self, secs: f64) {
        *self.now.lock().unwrap() += secs;
    }

    fn scheduled(&self) -> Vec<PlaybackUnit> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn schedule(&self, unit: PlaybackUnit) -> AppResult<()> {
        self.scheduled.lock().unwrap().push(unit);
        Ok(())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.scheduled.lock().unwrap().clear();
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn behavior() -> BehaviorConfig {
    BehaviorConfig {
        system_instruction: "You are a recruiter.".to_string(),
        voice: "Kore".to_string(),
        model: "gemini-test".to_string(),
        transcripts: true,
    }
}

fn settings() -> InterviewSettings {
    let mut settings = InterviewSettings::new(behavior());
    settings.connect_timeout = WAIT;
    settings.refresh_interval = Duration::from_millis(10);
    settings
}

/// 100ms of a quiet tone at the inbound rate.
fn voice_packet() -> EncodedPacket {
    let samples: Vec<f32> = (0..2400).map(|i| if i % 2 == 0 { 0.25 } else { -0.25 }).collect();
    EncodedPacket::from_pcm(codec::encode_pcm16(&samples), 24_000)
}

async fn next_outbound(remote: &mut Remote) -> Option<Outbound> {
    tokio::time::timeout(WAIT, remote.outbound.recv())
        .await
        .expect("timed out waiting for outbound message")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<InterviewEvent>) -> InterviewEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for interview event")
        .expect("event channel closed")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_captured_frame_reaches_the_service() {
    let connector = Arc::new(FakeConnector::default());
    let input = Arc::new(ScriptedInput::new(vec![0.0; 4096]));
    let output = Arc::new(ManualOutput::default());
    let interview = Interview::new(settings(), connector.clone(), input.clone(), output.clone());

    interview.start("key").await.unwrap();
    assert_eq!(interview.state(), SessionState::Connected);

    let mut remote = connector.remote();
    match next_outbound(&mut remote).await {
        Some(Outbound::Audio(packet)) => {
            assert_eq!(packet.bytes().len(), 8192);
            assert_eq!(packet.mime_type(), "audio/pcm;rate=16000");
            assert!(packet.bytes().iter().all(|b| *b == 0));
        }
        other => panic!("expected audio, got {:?}", other),
    }

    interview.stop();
    assert_eq!(interview.state(), SessionState::Closed);
    assert!(matches!(next_outbound(&mut remote).await, Some(Outbound::AudioStreamEnd)));
    assert!(matches!(next_outbound(&mut remote).await, Some(Outbound::Close)));
    assert_eq!(input.releases.load(Ordering::SeqCst), 1);
    assert_eq!(output.closes.load(Ordering::SeqCst), 1);
    assert_eq!(interview.metrics().snapshot().packets_sent, 1);
}

#[tokio::test]
async fn test_empty_credential_is_rejected_before_anything_opens() {
    let connector = Arc::new(FakeConnector::default());
    let input = Arc::new(ScriptedInput::new(vec![0.0; 4096]));
    let interview = Interview::new(
        settings(),
        connector.clone(),
        input.clone(),
        Arc::new(ManualOutput::default()),
    );

    let err = interview.start("").await.unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)));
    assert_eq!(interview.state(), SessionState::Idle);
    assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
    assert_eq!(input.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_interviewer_audio_plays_back_to_back() {
    let connector = Arc::new(FakeConnector::default());
    let output = Arc::new(ManualOutput::default());
    let interview = Interview::new(
        settings(),
        connector.clone(),
        Arc::new(ScriptedInput::new(Vec::new())),
        output.clone(),
    );
    interview.start("key").await.unwrap();
    let remote = connector.remote();

    output.advance(1.0);
    for _ in 0..3 {
        remote
            .inbound
            .send(Inbound::Event(ServerEvent::Audio(voice_packet())))
            .await
            .unwrap();
    }
    wait_until(|| output.scheduled().len() == 3).await;

    let units = output.scheduled();
    assert!((units[0].start_time - 1.0).abs() < 1e-9);
    for pair in units.windows(2) {
        assert!((pair[1].start_time - pair[0].end_time()).abs() < 1e-9);
        assert!(pair[1].sequence > pair[0].sequence);
    }
    assert!(interview.is_speaking());
    assert!((interview.queued_playback_secs() - 0.3).abs() < 1e-6);
}

#[tokio::test]
async fn test_malformed_packet_does_not_stop_playback() {
    let connector = Arc::new(FakeConnector::default());
    let output = Arc::new(ManualOutput::default());
    let interview = Interview::new(
        settings(),
        connector.clone(),
        Arc::new(ScriptedInput::new(Vec::new())),
        output.clone(),
    );
    interview.start("key").await.unwrap();
    let remote = connector.remote();

    let odd = EncodedPacket::from_pcm(vec![0, 0, 1], 24_000);
    remote.inbound.send(Inbound::Event(ServerEvent::Audio(odd))).await.unwrap();
    remote
        .inbound
        .send(Inbound::Event(ServerEvent::Audio(voice_packet())))
        .await
        .unwrap();
    wait_until(|| output.scheduled().len() == 1).await;

    assert_eq!(interview.state(), SessionState::Connected);
    assert_eq!(output.scheduled()[0].samples.len(), 2400);
    let snapshot = interview.metrics().snapshot();
    assert_eq!(snapshot.malformed_packets, 1);
    assert_eq!(snapshot.packets_received, 2);
}

#[tokio::test]
async fn test_interruption_flushes_queued_audio() {
    let connector = Arc::new(FakeConnector::default());
    let output = Arc::new(ManualOutput::default());
    let interview = Interview::new(
        settings(),
        connector.clone(),
        Arc::new(ScriptedInput::new(Vec::new())),
        output.clone(),
    );
    let mut events = interview.take_events().unwrap();
    interview.start("key").await.unwrap();
    let remote = connector.remote();

    for _ in 0..2 {
        remote
            .inbound
            .send(Inbound::Event(ServerEvent::Audio(voice_packet())))
            .await
            .unwrap();
    }
    wait_until(|| output.scheduled().len() == 2).await;

    output.advance(0.05);
    remote.inbound.send(Inbound::Event(ServerEvent::Interrupted)).await.unwrap();
    assert_eq!(next_event(&mut events).await, InterviewEvent::Session(SessionEvent::Interrupted));

    assert_eq!(output.flushes.load(Ordering::SeqCst), 1);
    assert!(output.scheduled().is_empty());
    assert!(!interview.is_speaking());
    assert_eq!(interview.queued_playback_secs(), 0.0);

    // The next answer starts at the device clock, not after the dropped audio
    remote
        .inbound
        .send(Inbound::Event(ServerEvent::Audio(voice_packet())))
        .await
        .unwrap();
    wait_until(|| output.scheduled().len() == 1).await;
    assert!((output.scheduled()[0].start_time - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn test_transcripts_are_forwarded_in_order() {
    let connector = Arc::new(FakeConnector::default());
    let interview = Interview::new(
        settings(),
        connector.clone(),
        Arc::new(ScriptedInput::new(Vec::new())),
        Arc::new(ManualOutput::default()),
    );
    let mut events = interview.take_events().unwrap();
    interview.start("key").await.unwrap();
    let remote = connector.remote();

    for event in [
        ServerEvent::InputTranscript("Bonjour".to_string()),
        ServerEvent::OutputTranscript("Présentez-vous.".to_string()),
        ServerEvent::TurnComplete,
    ] {
        remote.inbound.send(Inbound::Event(event)).await.unwrap();
    }

    assert_eq!(
        next_event(&mut events).await,
        InterviewEvent::Session(SessionEvent::InputTranscript("Bonjour".to_string()))
    );
    assert_eq!(
        next_event(&mut events).await,
        InterviewEvent::Session(SessionEvent::OutputTranscript("Présentez-vous.".to_string()))
    );
    assert_eq!(next_event(&mut events).await, InterviewEvent::Session(SessionEvent::TurnComplete));
    assert_eq!(interview.metrics().snapshot().turns_completed, 1);
}

#[tokio::test]
async fn test_transport_failure_keeps_queued_audio_playing() {
    let connector = Arc::new(FakeConnector::default());
    let input = Arc::new(ScriptedInput::new(Vec::new()));
    let output = Arc::new(ManualOutput::default());
    let interview = Interview::new(settings(), connector.clone(), input.clone(), output.clone());
    let mut events = interview.take_events().unwrap();
    interview.start("key").await.unwrap();
    let remote = connector.remote();

    remote
        .inbound
        .send(Inbound::Event(ServerEvent::Audio(voice_packet())))
        .await
        .unwrap();
    wait_until(|| output.scheduled().len() == 1).await;

    remote
        .inbound
        .send(Inbound::Failed(AppError::Transport("connection reset".to_string())))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        InterviewEvent::Failed(AppError::Transport("connection reset".to_string()))
    );
    assert!(matches!(interview.state(), SessionState::Failed(_)));
    wait_until(|| input.releases.load(Ordering::SeqCst) == 1).await;

    // The answer already queued still plays out
    assert_eq!(output.flushes.load(Ordering::SeqCst), 0);
    assert_eq!(output.closes.load(Ordering::SeqCst), 0);
    assert_eq!(output.scheduled().len(), 1);
    assert!(interview.queued_playback_secs() > 0.0);

    // and the playback queue keeps accepting audio until the interview stops
    let scheduler = interview.scheduler();
    let span = scheduler.enqueue(&voice_packet()).unwrap().expect("packet scheduled");
    assert!((span.start_time - 0.1).abs() < 1e-9);
    assert_eq!(output.scheduled().len(), 2);

    interview.stop();
    assert_eq!(scheduler.enqueue(&voice_packet()).unwrap(), None);
    assert_eq!(output.closes.load(Ordering::SeqCst), 1);
}

async fn local_service() -> (String, tokio::net::TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/live", listener.local_addr().unwrap());
    (url, listener)
}

#[tokio::test]
async fn test_tungstenite_connector_against_local_service() {
    let (url, listener) = local_service().await;

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let setup = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let setup: serde_json::Value = serde_json::from_str(&setup).unwrap();
        assert_eq!(setup["setup"]["model"], "models/gemini-test");
        ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string())).await.unwrap();

        let audio = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let audio: serde_json::Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["data"], "AAD/fw==");

        let reply = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAD/fw=="}}]}}}"#;
        ws.send(Message::Binary(reply.as_bytes().to_vec())).await.unwrap();
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })))
        .await
        .unwrap();
    });

    let connector = TungsteniteConnector::new(url, WAIT, 8);
    let mut connection = connector.open("test key", &behavior()).await.unwrap();
    connection
        .outbound
        .send(Outbound::Audio(EncodedPacket::from_pcm(vec![0x00, 0x00, 0xff, 0x7f], 16_000)))
        .await
        .unwrap();

    match tokio::time::timeout(WAIT, connection.inbound.recv()).await.unwrap() {
        Some(Inbound::Event(ServerEvent::Audio(packet))) => {
            assert_eq!(packet.bytes(), &[0x00, 0x00, 0xff, 0x7f]);
            assert_eq!(packet.sample_rate(), 24_000);
        }
        other => panic!("expected audio, got {:?}", other),
    }
    match tokio::time::timeout(WAIT, connection.inbound.recv()).await.unwrap() {
        Some(Inbound::Closed { code, reason }) => {
            assert_eq!(code, Some(1000));
            assert_eq!(reason, "done");
        }
        other => panic!("expected close, got {:?}", other),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn test_tungstenite_connector_reports_refused_key() {
    let (url, listener) = local_service().await;

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _setup = ws.next().await;
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "API key not valid".into(),
            })))
            .await;
        // Drain until the client answers the close
        while let Some(Ok(_)) = ws.next().await {}
    });

    let connector = TungsteniteConnector::new(url, WAIT, 8);
    let err = connector.open("wrong", &behavior()).await.unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)), "got {:?}", err);
}
