//! Pagi Live Console
//!
//! Talks to the remote agent through the default microphone and speakers.
//! Typed lines are sent as user turns; Ctrl-C hangs up.
//!
//! `pagi-live-console --devices` lists input devices and exits.

use anyhow::Context;
use pagi_live::{
    LiveConfig, MicrophoneCapture, SessionEvent, ToolError, ToolRegistry, TypedTool,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Deserialize)]
struct CurrentTimeArgs {
    /// Offset from UTC in hours.
    #[serde(default)]
    utc_offset_hours: i32,
}

#[derive(Serialize)]
struct CurrentTime {
    iso8601: String,
    weekday: String,
}

/// Lets the agent answer "what time is it" without guessing.
struct CurrentTimeTool;

#[async_trait::async_trait]
impl TypedTool for CurrentTimeTool {
    type Args = CurrentTimeArgs;
    type Output = CurrentTime;

    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current date and time, optionally shifted by a UTC offset in hours"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": { "type": "integer", "minimum": -12, "maximum": 14 }
            }
        })
    }

    async fn run(&self, args: CurrentTimeArgs) -> Result<CurrentTime, ToolError> {
        let offset = chrono::FixedOffset::east_opt(args.utc_offset_hours * 3600).ok_or_else(|| {
            ToolError::InvalidArguments {
                tool: "current_time".to_string(),
                reason: format!("offset {}h out of range", args.utc_offset_hours),
            }
        })?;
        let now = chrono::Utc::now().with_timezone(&offset);
        Ok(CurrentTime {
            iso8601: now.to_rfc3339(),
            weekday: now.format("%A").to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[pagi-live-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().any(|a| a == "--devices") {
        for name in MicrophoneCapture::list_input_devices()? {
            println!("🎤 {}", name);
        }
        return Ok(());
    }

    let config = LiveConfig::load().context("load live config")?;
    if config.api_key.is_none() {
        tracing::warn!("No API key configured (PAGI_LIVE__API_KEY or PAGI_LLM_API_KEY)");
    }

    let mut registry = ToolRegistry::new();
    registry.register_typed(CurrentTimeTool);

    let mut session = pagi_live::connect(config, registry)
        .await
        .context("connect to agent endpoint")?;
    let mut events = session
        .take_event_receiver()
        .context("event receiver already taken")?;

    tracing::info!(session_id = %session.id(), "Connected. Speak, or type a message and press Enter.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if print_event(event) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = session.send_user_text(line.trim()).await {
                        tracing::warn!(error = %e, "message not sent");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; hanging up");
                session.disconnect().await?;
            }
        }
    }

    Ok(())
}

/// Returns true once the session is over.
fn print_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::UserUtterance(u) => println!("🧑 you   › {}", u.text),
        SessionEvent::AgentUtterance(u) => println!("🤖 agent › {}", u.text),
        SessionEvent::ToolInvoked { name, .. } => println!("🔧 {} …", name),
        SessionEvent::ToolSettled { name, ok, .. } => {
            println!("{} {}", if ok { "✅" } else { "❌" }, name)
        }
        SessionEvent::Interrupted { .. } => println!("⚡ (interrupted)"),
        SessionEvent::InputResumed { flushed } if flushed > 0 => {
            tracing::debug!(flushed, "held audio sent")
        }
        SessionEvent::InputResumed { .. } => {}
        SessionEvent::GoAway { time_left } => println!(
            "⚠️ agent endpoint closing soon ({})",
            time_left.as_deref().unwrap_or("no estimate")
        ),
        SessionEvent::DeviceFailed(reason) => println!("🎧 audio device failed: {}", reason),
        SessionEvent::TransportFailed(reason) => println!("🔌 connection failed: {}", reason),
        SessionEvent::Closed(reason) => {
            println!("👋 session {}", reason);
            return true;
        }
    }
    false
}
