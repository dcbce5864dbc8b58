//! # Live Service WebSocket Protocol
//!
//! Wire format and transport for the remote conversational service (Gemini Live,
//! `BidiGenerateContent`).
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client opens the endpoint with the credential as the `key` query parameter
//! 2. **Setup**: first client message carries model, voice and the behavior script
//! 3. **Acknowledgment**: server answers `setupComplete`; only then is the session usable
//! 4. **Audio Streaming**: `realtimeInput.mediaChunks` upstream, `serverContent` downstream
//! 5. **Shutdown**: client sends `audioStreamEnd`, then a close frame
//!
//! ## Message Format:
//! - **Client → Server**: JSON text frames
//! - **Server → Client**: JSON in text *or* binary frames (the service uses binary frames
//!   for JSON control messages too)
//!
//! ## Layering:
//! - **ClientMessage / parse_server_message**: pure serde, no I/O
//! - **LiveConnector**: opens a connection and hands back two channels
//! - **TungsteniteConnector**: the real implementation over `tokio-tungstenite`

use crate::audio::frame::EncodedPacket;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Close codes the service uses when it refuses the credential or setup.
const POLICY_CLOSE_CODES: [u16; 2] = [1007, 1008];

/// What the remote service is told at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorConfig {
    /// Free-text instructions (the interviewer persona)
    pub system_instruction: String,
    /// Prebuilt output voice identifier
    pub voice: String,
    /// Model identifier, without the `models/` prefix
    pub model: String,
    /// Ask the service to also send text transcripts of both sides
    pub transcripts: bool,
}

// ── Client → server ───────────────────────────────────────────────

/// Top-level client message. Externally tagged, so each variant serializes as
/// `{"setup": {...}}` or `{"realtimeInput": {...}}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Enables a transcript stream; serializes as `{}`.
#[derive(Debug, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_chunks: Vec<MediaChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Audio chunk with MIME type and base64 data.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(behavior: &BehaviorConfig) -> Self {
        let model = if behavior.model.starts_with("models/") {
            behavior.model.clone()
        } else {
            format!("models/{}", behavior.model)
        };
        let system_instruction = if behavior.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![Part {
                    text: Some(behavior.system_instruction.clone()),
                    ..Part::default()
                }],
            })
        };

        ClientMessage::Setup(SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: behavior.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: behavior.transcripts.then_some(TranscriptionConfig {}),
            output_audio_transcription: behavior.transcripts.then_some(TranscriptionConfig {}),
        })
    }

    /// `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=N", "data": "<base64>"}]}}`
    pub fn audio(packet: &EncodedPacket) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: packet.mime_type(),
                data: packet.transport_data(),
            }],
            audio_stream_end: None,
        })
    }

    /// Tells the service the microphone closed so it flushes buffered input.
    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: Vec::new(),
            audio_stream_end: Some(true),
        })
    }

    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Transport(format!("failed to serialize client message: {}", e)))
    }
}

// ── Server → client ───────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    /// Model reasoning, never spoken or shown
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    // Older service revisions send transcripts at the top level
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    go_away: Option<GoAway>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerError {
    code: Option<i64>,
    message: Option<String>,
}

/// One thing the service told us, in the order it appeared in the message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Synthesized speech
    Audio(EncodedPacket),
    /// Text part of the model turn
    Text(String),
    /// Transcript of the candidate's speech
    InputTranscript(String),
    /// Transcript of the interviewer's speech
    OutputTranscript(String),
    TurnComplete,
    /// The candidate spoke over the interviewer; unplayed audio is stale
    Interrupted,
    /// The service will close the connection soon
    GoAway { time_left: Option<String> },
    /// An inline audio part that could not be decoded
    MalformedAudio(String),
    /// Server-reported error; the session cannot continue
    Error(String),
}

/// Parse one JSON message into events.
///
/// Within a message the order is: setup acknowledgment, interruption, model-turn parts
/// (in part order), transcripts, turn completion, go-away, error. Interruption comes
/// first so a flush never discards audio that arrived in the same message.
pub fn parse_server_message(text: &str) -> AppResult<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| AppError::Transport(format!("unparseable server message: {}", e)))?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    let mut input_transcripts = Vec::new();
    let mut output_transcripts = Vec::new();
    let mut turn_complete = false;

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }

        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if part.thought {
                continue;
            }
            if let Some(inline) = part.inline_data {
                match EncodedPacket::from_transport(&inline.mime_type, &inline.data) {
                    Ok(packet) => events.push(ServerEvent::Audio(packet)),
                    Err(err) => events.push(ServerEvent::MalformedAudio(err.to_string())),
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ServerEvent::Text(text));
            }
        }

        input_transcripts.extend(content.input_transcription);
        output_transcripts.extend(content.output_transcription);
        turn_complete = content.turn_complete;
    }

    input_transcripts.extend(message.input_transcription);
    output_transcripts.extend(message.output_transcription);

    events.extend(
        input_transcripts
            .into_iter()
            .filter(|t| !t.text.is_empty())
            .map(|t| ServerEvent::InputTranscript(t.text)),
    );
    events.extend(
        output_transcripts
            .into_iter()
            .filter(|t| !t.text.is_empty())
            .map(|t| ServerEvent::OutputTranscript(t.text)),
    );

    if turn_complete {
        events.push(ServerEvent::TurnComplete);
    }

    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(err) = message.error {
        let text = err.message.unwrap_or_else(|| "unknown server error".to_string());
        events.push(ServerEvent::Error(match err.code {
            Some(code) => format!("{} (code {})", text, code),
            None => text,
        }));
    }

    Ok(events)
}

/// Map a close frame to the error it represents.
///
/// Before setup is acknowledged, a policy close or a reason mentioning the API key
/// means the credential was refused.
pub fn classify_close(code: Option<u16>, reason: &str) -> AppError {
    let mentions_key = reason.to_ascii_lowercase().contains("api key");
    match code {
        Some(code) if POLICY_CLOSE_CODES.contains(&code) || mentions_key => {
            AppError::Authentication(format!("service closed the connection ({}): {}", code, reason))
        }
        None if mentions_key => AppError::Authentication(reason.to_string()),
        Some(code) => AppError::Transport(format!("connection closed ({}): {}", code, reason)),
        None => AppError::Transport(format!("connection closed: {}", reason)),
    }
}

// ── Connection seam ───────────────────────────────────────────────

/// Commands for the writer side of an open connection.
#[derive(Debug)]
pub enum Outbound {
    Audio(EncodedPacket),
    AudioStreamEnd,
    Close,
}

/// What the reader side of an open connection delivers, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Event(ServerEvent),
    /// The remote closed the connection
    Closed { code: Option<u16>, reason: String },
    /// The socket failed
    Failed(AppError),
}

/// An acknowledged connection. Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct LiveConnection {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Opens connections to the live service.
///
/// `open` resolves only once the service has acknowledged the setup message.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn open(&self, credential: &str, behavior: &BehaviorConfig) -> AppResult<LiveConnection>;
}

/// [`LiveConnector`] over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    endpoint: String,
    setup_timeout: Duration,
    queue_capacity: usize,
}

impl TungsteniteConnector {
    pub fn new(endpoint: impl Into<String>, setup_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            setup_timeout,
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn url(&self, credential: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}key={}",
            self.endpoint,
            separator,
            urlencoding::encode(credential)
        )
    }
}

/// Text of a data frame; the service sends JSON in binary frames too.
fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

type LiveStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read frames until the service acknowledges (or refuses) the setup message.
async fn await_setup_complete(ws: &mut LiveStream) -> AppResult<()> {
    while let Some(frame) = ws.next().await {
        let frame = frame?;
        if let Message::Close(close) = &frame {
            let (code, reason) = close
                .as_ref()
                .map(|c| (Some(u16::from(c.code)), c.reason.to_string()))
                .unwrap_or((None, "no close frame".to_string()));
            return Err(classify_close(code, &reason));
        }

        let Some(text) = frame_text(&frame) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(events) => {
                for event in events {
                    match event {
                        ServerEvent::SetupComplete => return Ok(()),
                        ServerEvent::Error(msg) => {
                            return Err(AppError::Authentication(format!("setup rejected: {}", msg)))
                        }
                        other => debug!(event = ?other, "Ignoring event before setup"),
                    }
                }
            }
            Err(err) => debug!(error = %err, "Ignoring frame before setup"),
        }
    }

    Err(AppError::Transport(
        "connection ended before setup was acknowledged".to_string(),
    ))
}

#[async_trait]
impl LiveConnector for TungsteniteConnector {
    async fn open(&self, credential: &str, behavior: &BehaviorConfig) -> AppResult<LiveConnection> {
        info!(model = %behavior.model, voice = %behavior.voice, "Connecting to live service");

        let (mut ws, _response) = tokio_tungstenite::connect_async(self.url(credential)).await?;

        let setup = ClientMessage::setup(behavior).to_json()?;
        debug!(bytes = setup.len(), "Sending setup message");
        ws.send(Message::Text(setup)).await?;

        let acknowledged = tokio::time::timeout(self.setup_timeout, await_setup_complete(&mut ws)).await;

        match acknowledged {
            Ok(Ok(())) => info!("Live service acknowledged setup"),
            Ok(Err(err)) => {
                warn!(error = %err, "Live service refused setup");
                return Err(err);
            }
            Err(_) => {
                return Err(AppError::Transport(format!(
                    "no setup acknowledgment within {}ms",
                    self.setup_timeout.as_millis()
                )))
            }
        }

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(self.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(self.queue_capacity);

        // Writer: serialize commands in order; ends on Close or when the sender drops
        tokio::spawn(async move {
            let mut chunks: u64 = 0;
            while let Some(command) = outbound_rx.recv().await {
                let message = match command {
                    Outbound::Audio(packet) => {
                        chunks += 1;
                        ClientMessage::audio(&packet)
                    }
                    Outbound::AudioStreamEnd => ClientMessage::audio_stream_end(),
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(err) => {
                        error!(error = %err, "Dropping unserializable message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(json)).await {
                    warn!(error = %err, "WebSocket send failed, closing writer");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!(chunks, "Writer task finished");
        });

        // Reader: forward every event in arrival order
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = inbound_tx.send(Inbound::Failed(err.into())).await;
                        return;
                    }
                };

                if let Message::Close(close) = &frame {
                    let (code, reason) = close
                        .as_ref()
                        .map(|c| (Some(u16::from(c.code)), c.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    let _ = inbound_tx.send(Inbound::Closed { code, reason }).await;
                    return;
                }

                let Some(text) = frame_text(&frame) else {
                    continue;
                };
                match parse_server_message(text) {
                    Ok(events) => {
                        for event in events {
                            if inbound_tx.send(Inbound::Event(event)).await.is_err() {
                                // Session went away
                                return;
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "Skipping server message"),
                }
            }
            let _ = inbound_tx
                .send(Inbound::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(LiveConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
