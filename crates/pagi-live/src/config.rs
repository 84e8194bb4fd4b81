//! Session configuration: defaults, optional TOML file, then `PAGI_LIVE__*` environment.

use crate::codec::AudioFormat;
use crate::error::{LiveError, LiveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file (without extension, as resolved by the `config` crate).
pub const DEFAULT_CONFIG_PATH: &str = "config/live";

const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Configuration for one live agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// WebSocket URL of the remote agent endpoint.
    pub endpoint: String,
    /// API key appended as the `key` query parameter. Env: PAGI_LIVE__API_KEY or PAGI_LLM_API_KEY.
    pub api_key: Option<String>,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Prebuilt voice name for synthesized agent audio.
    pub voice: Option<String>,
    /// System instruction sent once at setup.
    pub system_instruction: Option<String>,
    /// Microphone → wire sample rate (default: 16000)
    pub input_sample_rate: u32,
    /// Wire → speaker sample rate (default: 24000)
    pub output_sample_rate: u32,
    /// Samples per outbound frame (default: 480 for 30ms at 16kHz)
    pub frame_samples: usize,
    /// Bound on connect + setup handshake.
    pub connect_timeout_secs: u64,
    /// Open the default input device. Disable for text-only sessions.
    pub capture_enabled: bool,
    /// Open the default output device. When off, agent audio is scheduled but not played.
    pub playback_enabled: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: Some("Puck".to_string()),
            system_instruction: None,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_samples: 480,
            connect_timeout_secs: 10,
            capture_enabled: true,
            playback_enabled: true,
        }
    }
}

impl LiveConfig {
    /// Load config from file and environment. Precedence: env `PAGI_LIVE__*` > file
    /// (`PAGI_LIVE_CONFIG` path, else `config/live.toml`) > defaults.
    pub fn load() -> LiveResult<Self> {
        let config_path =
            std::env::var("PAGI_LIVE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Same as [`LiveConfig::load`] with an explicit file path. A missing file is not an error.
    pub fn load_from(path: &Path) -> LiveResult<Self> {
        let builder = config::Config::builder();

        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_LIVE").separator("__"))
            .build()?;

        let mut cfg: LiveConfig = built.try_deserialize()?;
        if cfg.api_key.is_none() {
            cfg.api_key = std::env::var("PAGI_LLM_API_KEY").ok().filter(|k| !k.trim().is_empty());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> LiveResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(LiveError::Config("endpoint must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(LiveError::Config("model must not be empty".to_string()));
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(LiveError::Config("sample rates must be non-zero".to_string()));
        }
        if self.frame_samples == 0 {
            return Err(LiveError::Config("frame_samples must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn input_format(&self) -> AudioFormat {
        AudioFormat::mono(self.input_sample_rate)
    }

    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::mono(self.output_sample_rate)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Endpoint URL with the API key attached.
    pub fn endpoint_url(&self) -> LiveResult<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| LiveError::Config(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        if let Some(key) = self.api_key.as_deref() {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }
}
