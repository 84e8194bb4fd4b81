//! Error types for the PAGI Live session core

use thiserror::Error;

/// Result type alias for live session operations
pub type LiveResult<T> = Result<T, LiveError>;

/// Errors that can occur while running a live agent session.
///
/// Only transport and device failures escape to the caller; protocol
/// violations are dropped where they are detected and tool failures travel
/// back to the agent as [`ToolError`] responses.
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// A single send failed but the connection is still up; worth one retry.
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Session closed")]
    Closed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LiveError {
    /// Send errors the caller may retry once before giving up on the connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, LiveError::SendFailed(_))
    }

    /// Errors that end the session (or prevent it from starting).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::Connect(_)
                | LiveError::Transport(_)
                | LiveError::Closed
                | LiveError::AudioDevice(_)
                | LiveError::AudioStream(_)
                | LiveError::Playback(_)
                | LiveError::Config(_)
        )
    }
}

impl From<cpal::DevicesError> for LiveError {
    fn from(err: cpal::DevicesError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for LiveError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        LiveError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for LiveError {
    fn from(err: cpal::BuildStreamError) -> Self {
        LiveError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for LiveError {
    fn from(err: cpal::PlayStreamError) -> Self {
        LiveError::AudioStream(err.to_string())
    }
}

impl From<config::ConfigError> for LiveError {
    fn from(err: config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

/// Failure of a single tool call. Converted into an error-shaped tool
/// response so the agent can react conversationally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl From<String> for ToolError {
    fn from(msg: String) -> Self {
        ToolError::Failed(msg)
    }
}

impl From<&str> for ToolError {
    fn from(msg: &str) -> Self {
        ToolError::Failed(msg.to_string())
    }
}
