//! Session transport: the duplex channel to the remote agent endpoint.
//!
//! [`AgentTransport`] is the seam the session drives; [`WebSocketTransport`]
//! is the production implementation. Inbound traffic is decoded on a reader
//! task and delivered as [`TransportEvent`]s over an unbounded channel.

use crate::codec::{AudioFormat, OutboundFrame};
use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use crate::protocol::{self, ClientMessage, InboundDecoder};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolRegistry};
use crate::turn::Role;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event, already decoded from the wire.
#[derive(Debug)]
pub enum TransportEvent {
    SetupComplete,
    /// Raw PCM16 LE bytes of agent speech.
    AudioChunk { data: Vec<u8>, format: AudioFormat },
    TranscriptDelta { role: Role, text: String },
    TurnComplete(Role),
    /// The agent stopped speaking because the user barged in.
    Interrupted,
    ToolCallRequested(ToolCallRequest),
    ToolCallCancelled(Vec<String>),
    /// The endpoint will disconnect soon.
    GoAway { time_left: Option<String> },
    Closed(CloseReason),
    Error(LiveError),
}

/// Why a session or connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the caller.
    Local,
    /// Closed by the remote endpoint.
    Remote(String),
    /// Closed after an unrecoverable error.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote(reason) if reason.is_empty() => write!(f, "closed by remote"),
            CloseReason::Remote(reason) => write!(f, "closed by remote: {}", reason),
            CloseReason::Error(reason) => write!(f, "closed after error: {}", reason),
        }
    }
}

/// Outbound half of a session connection.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send_audio(&self, frame: &OutboundFrame) -> LiveResult<()>;

    /// Send a user text turn. `turn_complete` tells the agent to respond.
    async fn send_text(&self, text: &str, turn_complete: bool) -> LiveResult<()>;

    async fn send_tool_result(&self, response: &ToolCallResponse) -> LiveResult<()>;

    /// Idempotent.
    async fn close(&self) -> LiveResult<()>;

    fn is_closed(&self) -> bool;
}

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component may have installed one already; either is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// WebSocket connection to the agent endpoint.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    closed: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connect, send the setup message (session parameters and tool
    /// declarations) and wait for the endpoint to acknowledge it. The whole
    /// handshake is bounded by the configured connect timeout.
    pub async fn connect(
        config: &LiveConfig,
        registry: &ToolRegistry,
    ) -> LiveResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;
        install_crypto_provider();

        let url = config.endpoint_url()?;
        let redacted = format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.path()
        );
        info!("🔌 Connecting to agent endpoint {}", redacted);

        let handshake = async {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| LiveError::Connect(e.to_string()))?;
            let (mut sink, mut stream) = ws.split();

            let setup = protocol::setup_message(config, registry.declarations());
            sink.send(Message::Text(serde_json::to_string(&setup)?.into()))
                .await
                .map_err(|e| LiveError::Connect(format!("setup send failed: {}", e)))?;

            let mut decoder = InboundDecoder::new(config.output_format());
            await_setup_complete(&mut stream, &mut decoder).await?;
            Ok::<_, LiveError>((sink, stream, decoder))
        };

        let (sink, stream, decoder) = tokio::time::timeout(config.connect_timeout(), handshake)
            .await
            .map_err(|_| {
                LiveError::Connect(format!(
                    "no setup acknowledgement within {}s",
                    config.connect_timeout().as_secs()
                ))
            })??;

        info!(
            "✅ Agent session established (model: {}, tools: [{}])",
            config.model,
            registry.names().join(", ")
        );

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(stream, decoder, tx, Arc::clone(&closed)));

        Ok((
            Self {
                sink: Mutex::new(sink),
                closed,
                reader: std::sync::Mutex::new(Some(reader)),
            },
            rx,
        ))
    }

    async fn send_message(&self, message: &ClientMessage) -> LiveResult<()> {
        if self.is_closed() {
            return Err(LiveError::Closed);
        }
        let json = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(classify_send_error)
    }
}

#[async_trait]
impl AgentTransport for WebSocketTransport {
    async fn send_audio(&self, frame: &OutboundFrame) -> LiveResult<()> {
        self.send_message(&protocol::audio_message(frame)).await
    }

    async fn send_text(&self, text: &str, turn_complete: bool) -> LiveResult<()> {
        self.send_message(&protocol::text_message(text, turn_complete))
            .await
    }

    async fn send_tool_result(&self, response: &ToolCallResponse) -> LiveResult<()> {
        self.send_message(&protocol::tool_response_message(response))
            .await
    }

    async fn close(&self) -> LiveResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("close frame not sent: {}", e);
        }
        let _ = sink.close().await;
        drop(sink);

        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        info!("🔌 Agent connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

async fn await_setup_complete(
    stream: &mut SplitStream<WsStream>,
    decoder: &mut InboundDecoder,
) -> LiveResult<()> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| LiveError::Connect(e.to_string()))?;
        let payload = match &msg {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                return Err(LiveError::Connect(format!(
                    "endpoint closed during setup: {}",
                    reason
                )));
            }
            _ => continue,
        };
        let events = decoder
            .decode(payload)
            .map_err(|e| LiveError::Connect(format!("bad setup reply: {}", e)))?;
        if events
            .iter()
            .any(|e| matches!(e, TransportEvent::SetupComplete))
        {
            return Ok(());
        }
        debug!("ignoring {} event(s) received before setup completed", events.len());
    }
    Err(LiveError::Connect(
        "endpoint closed during setup".to_string(),
    ))
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    mut decoder: InboundDecoder,
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let end = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                error!("❌ Agent connection error: {}", e);
                break TransportEvent::Error(LiveError::Transport(e.to_string()));
            }
            None => break TransportEvent::Closed(CloseReason::Remote(String::new())),
        };

        let payload = match &msg {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                break TransportEvent::Closed(CloseReason::Remote(reason));
            }
            _ => continue,
        };

        match decoder.decode(payload) {
            Ok(events) => {
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            // Protocol violations are dropped, the connection stays up.
            Err(e) => warn!("⚠️ Dropping inbound message: {}", e),
        }
    };

    closed.store(true, Ordering::SeqCst);
    let _ = tx.send(end);
}

/// Map a send error onto the session error taxonomy. Only back-pressure and
/// interrupted writes are worth retrying.
fn classify_send_error(err: WsError) -> LiveError {
    match err {
        WsError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ) =>
        {
            LiveError::SendFailed(io.to_string())
        }
        WsError::WriteBufferFull(..) => LiveError::SendFailed("write buffer full".to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => LiveError::Closed,
        other => LiveError::Transport(other.to_string()),
    }
}
