use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reconnect]
//                    enabled = true
//
//   env var:         GYM_CHAT_RECONNECT__ENABLED=true   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub outbound_queue: QueueFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
}

/// Where the chat service lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// `host[:port]`, shared by the channel and the history API.
    #[serde(default = "default_host")]
    pub host: String,
    /// Use `wss`/`https` instead of `ws`/`http`.
    #[serde(default)]
    pub secure: bool,
    /// Bearer token handed over by the session provider.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            secure: false,
            auth_token: None,
        }
    }
}

/// Automatic reconnection (`[reconnect]`). Off unless enabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// 0 = retry forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: 0,
        }
    }
}

/// Outbound queue used while a channel is still connecting (`[outbound_queue]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueFileConfig {
    /// 0 disables queueing: sends before `Open` are rejected.
    #[serde(default)]
    pub capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default = "default_writer_buffer")]
    pub writer_buffer: usize,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            writer_buffer: default_writer_buffer(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_secs() -> u64 {
    30
}
fn default_writer_buffer() -> usize {
    64
}

/// Build a figment that layers: defaults → config.toml → GYM_CHAT_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("GYM_CHAT_").split("__"))
}

/// Default config directory: `~/.config/gym-chat` (platform equivalent).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gym-chat")
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

/// Bounded exponential backoff for channel reconnection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` = unlimited.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self::from_file(&ReconnectFileConfig::default())
    }

    pub fn from_file(fc: &ReconnectFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            initial_delay: Duration::from_millis(fc.initial_delay_ms),
            max_delay: Duration::from_secs(fc.max_delay_secs),
            max_attempts: (fc.max_attempts > 0).then_some(fc.max_attempts),
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based):
    /// `initial_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << exp)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

/// Resolved configuration handed to [`ConnectionManager`](crate::ConnectionManager)
/// and [`ConversationStore`](crate::ConversationStore).
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub host: String,
    pub secure: bool,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub queue_capacity: usize,
    pub writer_buffer: usize,
}

impl ChatConfig {
    /// Baseline settings for `host`: no reconnection, no outbound queue.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::from_file(&FileConfig::default())
        }
    }

    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            secure: fc.server.secure,
            auth_token: fc.server.auth_token.clone().filter(|t| !t.is_empty()),
            reconnect: ReconnectPolicy::from_file(&fc.reconnect),
            queue_capacity: fc.outbound_queue.capacity,
            writer_buffer: fc.channel.writer_buffer.max(1),
        }
    }

    /// Load from `config_dir/config.toml` and the environment.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(config_dir)
            .extract()
            .context("Failed to load chat configuration")?;
        Ok(Self::from_file(&fc))
    }

    /// `ws://<host>/ws/chat/{room}`; the room id is percent-encoded as a
    /// single path segment.
    pub fn channel_url(&self, room_id: &str) -> Result<Url, AddressError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = self.base_url(scheme)?;
        url.path_segments_mut()
            .map_err(|_| AddressError(self.host.clone()))?
            .clear()
            .extend(["ws", "chat", room_id]);
        Ok(url)
    }

    /// `http://<host><path>` for the history API.
    pub fn api_url(&self, path: &str) -> Result<Url, AddressError> {
        let scheme = if self.secure { "https" } else { "http" };
        self.base_url(scheme)?
            .join(path)
            .map_err(|e| AddressError(format!("{path}: {e}")))
    }

    fn base_url(&self, scheme: &str) -> Result<Url, AddressError> {
        Url::parse(&format!("{}://{}/", scheme, self.host))
            .map_err(|e| AddressError(format!("{}: {}", self.host, e)))
    }
}
