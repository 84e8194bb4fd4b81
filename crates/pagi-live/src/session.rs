//! The live agent session: one owned state machine per connection.
//!
//! A single task owns every queue and buffer and processes, in order:
//! caller commands, inbound transport events, settled tool calls and
//! microphone frames. Tool handlers run concurrently elsewhere; only their
//! results come back through this loop, so the busy flag and the input
//! queue are never touched from two places at once.
//!
//! ```text
//!   microphone ──frames──┐                         ┌──► playback scheduler
//!                        ▼                         │
//!   caller ──commands──► Session loop ◄──events── transport ◄── agent
//!     ▲                    │    ▲
//!     └──SessionEvent──────┘    └── settled tool calls ◄── handlers
//! ```

use crate::capture::{CaptureEvent, CaptureHandle, MicrophoneCapture};
use crate::codec::{self, OutboundFrame};
use crate::config::LiveConfig;
use crate::dispatcher::{ToolCallStatus, ToolDispatcher};
use crate::backpressure::InputQueue;
use crate::error::{LiveError, LiveResult};
use crate::interruption::InterruptionController;
use crate::playback::{NullSink, PlaybackScheduler, PlaybackSink, RodioSink, SystemClock};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolRegistry};
use crate::transport::{AgentTransport, CloseReason, TransportEvent, WebSocketTransport};
use crate::turn::{Role, TurnAggregator, Utterance};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the caller observes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserUtterance(Utterance),
    AgentUtterance(Utterance),
    ToolInvoked { id: String, name: String },
    ToolSettled { id: String, name: String, ok: bool },
    /// Agent playback was cut off by barge-in.
    Interrupted { stopped: usize },
    /// A tool batch finished and the held-back microphone frames were sent.
    InputResumed { flushed: usize },
    GoAway { time_left: Option<String> },
    DeviceFailed(String),
    TransportFailed(String),
    Closed(CloseReason),
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: Uuid,
    pub busy: bool,
    pub pending_tools: usize,
    /// Outstanding tool calls, oldest first.
    pub tool_calls: Vec<ToolCallStatus>,
    pub queued_frames: usize,
    /// Microphone audio currently held back.
    pub queued_audio: Duration,
    /// Most frames ever held at once.
    pub queue_high_water: usize,
    /// Frames held back over the session's lifetime.
    pub frames_held: u64,
    pub playback_queue: usize,
    pub frames_sent: u64,
    pub interruptions: u64,
    /// Playback-clock time of the latest barge-in.
    pub last_interrupt: Option<Duration>,
    pub batches_completed: u64,
    pub closed: bool,
}

enum Command {
    SendText {
        text: String,
        reply: oneshot::Sender<LiveResult<()>>,
    },
    Status(oneshot::Sender<SessionStatus>),
    Close(oneshot::Sender<()>),
}

/// Everything a session is assembled from.
///
/// [`connect`] builds this from the WebSocket transport and the audio
/// devices; tests build it from in-memory fakes.
pub struct SessionIo {
    pub transport: Arc<dyn AgentTransport>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    /// Microphone frames. `None` for a text-only session.
    pub capture: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    /// Stopped when the session closes.
    pub capture_guard: Option<CaptureHandle>,
    pub playback: PlaybackScheduler,
}

enum Outbound<'a> {
    Audio(&'a OutboundFrame),
    Text(&'a str),
    ToolResult(&'a ToolCallResponse),
}

pub struct Session {
    id: Uuid,
    transport: Arc<dyn AgentTransport>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    capture: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    capture_guard: Option<CaptureHandle>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,

    playback: PlaybackScheduler,
    dispatcher: ToolDispatcher,
    input: InputQueue,
    turns: TurnAggregator,
    interruption: InterruptionController,

    frames_sent: u64,
    /// The transport refused a send because the peer already closed; the
    /// matching `Closed` event is on its way through `inbound`.
    link_down: bool,
    closed: bool,
}

impl Session {
    /// Start the session loop. Must be called from within a tokio runtime.
    pub fn spawn(io: SessionIo, registry: Arc<ToolRegistry>) -> SessionHandle {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Session {
            id,
            transport: io.transport,
            inbound: io.inbound,
            capture: io.capture,
            capture_guard: io.capture_guard,
            commands: cmd_rx,
            events: event_tx,
            playback: io.playback,
            dispatcher: ToolDispatcher::new(registry),
            input: InputQueue::new(),
            turns: TurnAggregator::new(),
            interruption: InterruptionController::new(),
            frames_sent: 0,
            link_down: false,
            closed: false,
        };

        info!(session_id = %id, "🎙️ Live session started");
        let task = tokio::spawn(session.run());

        SessionHandle {
            id,
            commands: cmd_tx,
            events: Some(event_rx),
            task,
        }
    }

    async fn run(mut self) {
        while !self.closed {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    // Every handle is gone.
                    None => self.close(CloseReason::Local).await,
                },

                event = self.inbound.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        self.close(CloseReason::Remote("connection lost".to_string()))
                            .await
                    }
                },

                Some(response) = self.dispatcher.next_settled(), if self.dispatcher.has_in_flight() => {
                    self.on_tool_settled(response).await
                }

                event = next_capture(&mut self.capture) => match event {
                    Some(event) => self.on_capture(event).await,
                    None => {
                        debug!("capture channel closed");
                        self.capture = None;
                    }
                },
            }
        }
        debug!(session_id = %self.id, "session loop exited");
    }

    // -------------------------------------------------------------------------
    // Caller commands
    // -------------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendText { text, reply } => {
                // Text goes out immediately even while a tool batch is
                // outstanding; only microphone audio is held back.
                let result = self.send(Outbound::Text(&text)).await;
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Close(ack) => {
                self.close(CloseReason::Local).await;
                let _ = ack.send(());
            }
        }
    }

    fn status(&mut self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            busy: self.dispatcher.is_busy(),
            pending_tools: self.dispatcher.pending(),
            tool_calls: self.dispatcher.calls(),
            queued_frames: self.input.len(),
            queued_audio: self.input.buffered_duration(),
            queue_high_water: self.input.high_water_mark(),
            frames_held: self.input.total_held(),
            playback_queue: self.playback.queue_len(),
            frames_sent: self.frames_sent,
            interruptions: self.interruption.count(),
            last_interrupt: self.interruption.last_interrupt(),
            batches_completed: self.dispatcher.batches_completed(),
            closed: self.closed,
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SetupComplete => debug!("duplicate setup acknowledgement"),
            TransportEvent::AudioChunk { data, format } => {
                let frame = match codec::decode(&data, format) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("⚠️ Dropping agent audio chunk: {}", e);
                        return;
                    }
                };
                if let Err(e) = self.playback.enqueue(frame) {
                    error!("❌ Playback failed: {}", e);
                    self.emit(SessionEvent::DeviceFailed(e.to_string()));
                }
            }
            TransportEvent::TranscriptDelta { role, text } => self.turns.on_delta(role, &text),
            TransportEvent::TurnComplete(role) => {
                if let Some(utterance) = self.turns.on_turn_complete(role) {
                    info!(%role, "💬 {}", utterance.text);
                    self.emit(match role {
                        Role::User => SessionEvent::UserUtterance(utterance),
                        Role::Agent => SessionEvent::AgentUtterance(utterance),
                    });
                }
            }
            TransportEvent::Interrupted => {
                let outcome = self.interruption.on_interrupted(&mut self.playback);
                self.emit(SessionEvent::Interrupted {
                    stopped: outcome.stopped,
                });
            }
            TransportEvent::ToolCallRequested(request) => self.on_tool_call(request),
            TransportEvent::ToolCallCancelled(ids) => {
                if self.dispatcher.cancel(&ids) {
                    self.release_input().await;
                }
            }
            TransportEvent::GoAway { time_left } => {
                warn!(
                    "⚠️ Agent endpoint closing soon (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
                self.emit(SessionEvent::GoAway { time_left });
            }
            TransportEvent::Closed(reason) => self.close(reason).await,
            TransportEvent::Error(e) => self.fail(e.to_string()).await,
        }
    }

    fn on_tool_call(&mut self, request: ToolCallRequest) {
        // Agent audio that has not started yet belongs to the turn the tool
        // call just ended.
        let dropped = self.playback.drop_pending();
        if dropped > 0 {
            debug!(dropped, "cleared pending agent audio for tool call");
        }

        let (id, name) = (request.id.clone(), request.name.clone());
        match self.dispatcher.dispatch(request) {
            Ok(()) => self.emit(SessionEvent::ToolInvoked { id, name }),
            Err(e) => warn!("⚠️ Ignoring tool call: {}", e),
        }
    }

    async fn on_tool_settled(&mut self, response: ToolCallResponse) {
        if !self.is_open() {
            return;
        }
        if self.send(Outbound::ToolResult(&response)).await.is_err() && !self.is_open() {
            return;
        }
        self.emit(SessionEvent::ToolSettled {
            id: response.id.clone(),
            name: response.name.clone(),
            ok: response.is_ok(),
        });
        if self.dispatcher.complete(&response.id) {
            self.release_input().await;
        }
    }

    /// The last call of a batch was answered: send every held frame, oldest
    /// first, then go back to live capture.
    async fn release_input(&mut self) {
        let held: Vec<OutboundFrame> = self.input.drain().collect();
        let flushed = held.len();
        for frame in &held {
            if self.send(Outbound::Audio(frame)).await.is_err() && !self.is_open() {
                return;
            }
        }
        if flushed > 0 {
            info!(flushed, "▶️ Tool batch complete, resuming input");
        }
        self.emit(SessionEvent::InputResumed { flushed });
    }

    // -------------------------------------------------------------------------
    // Microphone
    // -------------------------------------------------------------------------

    async fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(frame) => {
                if self.dispatcher.is_busy() {
                    self.input.push(frame);
                    debug!(queued = self.input.len(), "holding frame while tool call outstanding");
                } else {
                    let _ = self.send(Outbound::Audio(&frame)).await;
                }
            }
            CaptureEvent::DeviceError(reason) => {
                error!("❌ Microphone failed: {}", reason);
                self.stop_capture();
                self.emit(SessionEvent::DeviceFailed(reason));
            }
        }
    }

    fn stop_capture(&mut self) {
        self.capture = None;
        if let Some(mut guard) = self.capture_guard.take() {
            guard.stop();
        }
    }

    // -------------------------------------------------------------------------
    // Outbound and lifecycle
    // -------------------------------------------------------------------------

    /// Send with a single immediate retry for transient failures. Anything
    /// that still fails at the connection level closes the session.
    ///
    /// A transport that reports itself closed is not a failure: the peer hung
    /// up and its close event, with the real reason, closes the session.
    async fn send(&mut self, msg: Outbound<'_>) -> LiveResult<()> {
        if !self.is_open() {
            return Err(LiveError::Closed);
        }
        let transport = Arc::clone(&self.transport);
        let result = match transmit(transport.as_ref(), &msg).await {
            Err(e) if e.is_transient() => {
                warn!("⚠️ Send failed ({}), retrying once", e);
                transmit(transport.as_ref(), &msg).await
            }
            other => other,
        };
        match result {
            Ok(()) => {
                if let Outbound::Audio(_) = msg {
                    self.frames_sent += 1;
                }
                Ok(())
            }
            Err(LiveError::Closed) => {
                debug!("transport closed by peer, awaiting close event");
                self.link_down = true;
                Err(LiveError::Closed)
            }
            Err(e) => {
                if e.is_transient() || e.is_fatal() {
                    self.fail(e.to_string()).await;
                } else {
                    warn!("⚠️ Message not sent: {}", e);
                }
                Err(e)
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.link_down
    }

    async fn fail(&mut self, reason: String) {
        if self.closed {
            return;
        }
        error!("❌ Agent connection failed: {}", reason);
        self.emit(SessionEvent::TransportFailed(reason.clone()));
        self.close(CloseReason::Error(reason)).await;
    }

    /// Stop everything. Held frames are discarded and outstanding tool calls
    /// are abandoned: their handlers finish on their own, results go nowhere.
    async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.stop_capture();
        let stopped = self.playback.interrupt();
        let discarded = self.input.discard();
        let abandoned = self.dispatcher.abandon();

        if let Err(e) = self.transport.close().await {
            debug!("transport close: {}", e);
        }

        info!(
            session_id = %self.id,
            stopped,
            discarded,
            abandoned,
            "🛑 Live session closed ({})",
            reason
        );
        self.emit(SessionEvent::Closed(reason));
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

async fn transmit(transport: &dyn AgentTransport, msg: &Outbound<'_>) -> LiveResult<()> {
    match msg {
        Outbound::Audio(frame) => transport.send_audio(frame).await,
        Outbound::Text(text) => transport.send_text(text, true).await,
        Outbound::ToolResult(response) => transport.send_tool_result(response).await,
    }
}

async fn next_capture(
    capture: &mut Option<mpsc::UnboundedReceiver<CaptureEvent>>,
) -> Option<CaptureEvent> {
    match capture {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Caller's handle on a running session. Dropping every handle closes it.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The event stream. Available once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Send a typed user turn. Allowed while a tool call is outstanding.
    pub async fn send_user_text(&self, text: impl Into<String>) -> LiveResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendText {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| LiveError::Closed)?;
        rx.await.map_err(|_| LiveError::Closed)?
    }

    pub async fn status(&self) -> LiveResult<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .await
            .map_err(|_| LiveError::Closed)?;
        rx.await.map_err(|_| LiveError::Closed)
    }

    /// Close the session. Returns once it is closed; closing twice is fine.
    pub async fn disconnect(&self) -> LiveResult<()> {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished() || self.commands.is_closed()
    }
}

/// Local audio for a session: the playback scheduler and, unless disabled,
/// the microphone feed.
pub struct SessionDevices {
    pub playback: PlaybackScheduler,
    pub capture: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    pub capture_guard: Option<CaptureHandle>,
}

impl SessionDevices {
    /// Open the default output and input devices, as configured.
    pub fn open(config: &LiveConfig) -> LiveResult<Self> {
        let sink: Box<dyn PlaybackSink> = if config.playback_enabled {
            Box::new(RodioSink::open()?)
        } else {
            info!("🔇 Playback disabled");
            Box::new(NullSink)
        };
        let playback = PlaybackScheduler::new(sink, Arc::new(SystemClock::new()));

        let (capture, capture_guard) = if config.capture_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let guard = MicrophoneCapture::start(config, tx)?;
            (Some(rx), Some(guard))
        } else {
            info!("🔇 Capture disabled, text-only session");
            (None, None)
        };

        Ok(Self {
            playback,
            capture,
            capture_guard,
        })
    }
}

/// Connect to the agent endpoint and start a session with the default audio
/// devices (or without them, as configured).
pub async fn connect(config: LiveConfig, registry: ToolRegistry) -> LiveResult<SessionHandle> {
    connect_with(config, registry, SessionDevices::open).await
}

/// Like [`connect`], with the devices supplied by `open_devices`.
///
/// Devices are opened only after the endpoint acknowledged the setup, so the
/// microphone never records before the session is open. If they fail to
/// open, the connection is closed again.
pub async fn connect_with<F>(
    config: LiveConfig,
    registry: ToolRegistry,
    open_devices: F,
) -> LiveResult<SessionHandle>
where
    F: FnOnce(&LiveConfig) -> LiveResult<SessionDevices>,
{
    config.validate()?;

    let (transport, inbound) = WebSocketTransport::connect(&config, &registry).await?;

    let devices = match open_devices(&config) {
        Ok(devices) => devices,
        Err(e) => {
            error!("❌ Audio devices unavailable: {}", e);
            if let Err(close_err) = transport.close().await {
                debug!("transport close: {}", close_err);
            }
            return Err(e);
        }
    };

    let io = SessionIo {
        transport: Arc::new(transport),
        inbound,
        capture: devices.capture,
        capture_guard: devices.capture_guard,
        playback: devices.playback,
    };
    Ok(Session::spawn(io, Arc::new(registry)))
}
