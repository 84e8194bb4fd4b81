//! # PAGI Live - Real-time Agent Sessions
//!
//! A long-lived duplex connection to a remote conversational agent: microphone
//! audio streams out, synthesized speech streams in, and the agent can call
//! local tools mid-conversation while the user barges in at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Session loop                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │   Mic In     │ → │ Input Queue  │ → │  WebSocket Transport │  │
//! │  │   (cpal)     │   │ (held while  │   │  (setup, audio, text │  │
//! │  └──────────────┘   │  tools run)  │   │   tool responses)    │  │
//! │                     └──────────────┘   └──────────────────────┘  │
//! │                                                  ↓               │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │  Audio Out   │ ← │  Playback    │ ← │  Inbound Decoder     │  │
//! │  │  (rodio)     │   │  Scheduler   │   │  audio / transcripts │  │
//! │  └──────────────┘   └──────────────┘   │  tool calls / barge  │  │
//! │         ↑                              └──────────────────────┘  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ Interruption │   │    Turn      │   │   Tool Dispatcher    │  │
//! │  │  Controller  │   │  Aggregator  │   │  (batch counting)    │  │
//! │  └──────────────┘   └──────────────┘   └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use pagi_live::{connect, LiveConfig, SessionEvent, ToolRegistry};
//!
//! # async fn run() -> pagi_live::LiveResult<()> {
//! let config = LiveConfig::load()?;
//! let mut session = connect(config, ToolRegistry::new()).await?;
//! let mut events = session.take_event_receiver().expect("first take");
//!
//! session.send_user_text("What's on my calendar?").await?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::AgentUtterance(u) = event {
//!         println!("{}", u.text);
//!         break;
//!     }
//! }
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod capture;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod interruption;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod turn;

pub use backpressure::InputQueue;
pub use capture::{CaptureEvent, CaptureHandle, FrameAssembler, MicrophoneCapture};
pub use codec::{AudioFormat, AudioFrame, InboundFrame, OutboundFrame};
pub use config::LiveConfig;
pub use dispatcher::{CallPhase, ToolCallStatus, ToolDispatcher};
pub use error::{LiveError, LiveResult, ToolError};
pub use interruption::{InterruptOutcome, InterruptionController};
pub use playback::{
    Clock, ManualClock, NullSink, PlaybackQueueEntry, PlaybackScheduler, PlaybackSink, RodioSink,
    SystemClock,
};
pub use protocol::InboundDecoder;
pub use session::{
    connect, connect_with, Session, SessionDevices, SessionEvent, SessionHandle, SessionIo,
    SessionStatus,
};
pub use tools::{
    FunctionDeclaration, ToolCallRequest, ToolCallResponse, ToolHandler, ToolRegistry, Typed,
    TypedTool,
};
pub use transport::{AgentTransport, CloseReason, TransportEvent, WebSocketTransport};
pub use turn::{Role, TurnAggregator, Utterance};
