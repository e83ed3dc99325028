//! Configuration types for vigil.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Secrets are never stored in
//! the file — every credential field names an environment variable
//! (`*_env`) whose value is read at startup.
//!
//! # Example
//! ```toml
//! [server]
//! api_port = 8080
//! ws_port  = 8081
//!
//! [inference]
//! base_url       = "http://localhost:11434"
//! triage_model   = "moondream:1.8b"
//! analysis_model = "llava:13b"
//!
//! [cloud.providers.gpt4v]
//! base_url    = "https://api.openai.com"
//! api_key_env = "VIGIL_OPENAI_KEY"
//! model       = "gpt-4o"
//! wire        = "openai"
//!
//! [cloud]
//! fallback_order = ["gpt4v"]
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which wire protocol a cloud vision provider speaks.
///
/// All providers are asked the same question (a prompt plus one encoded
/// frame) and are expected to answer with a small JSON verdict; each
/// [`ProviderWire`] variant maps to an adapter that handles the request and
/// response translation at the edge.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderWire {
    /// OpenAI `/v1/chat/completions` with `image_url` content parts.
    /// Also used by OpenRouter and other compatible gateways.
    #[default]
    OpenAi,
    /// Anthropic Messages API (`/v1/messages`) with base64 image blocks.
    Anthropic,
}

impl std::fmt::Display for ProviderWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    pub inference: InferenceConfig,

    /// Cloud fallback providers and the order they are consulted in.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Browser-push channel. Absent section = channel unavailable.
    #[serde(default)]
    pub push: Option<PushConfig>,

    /// SMS channel. Absent section = channel unavailable.
    #[serde(default)]
    pub sms: Option<SmsConfig>,

    /// Chat-bot channel. Absent section = channel unavailable.
    #[serde(default)]
    pub chat: Option<ChatConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.api_port != self.server.ws_port,
            "api_port and ws_port must differ ({} used for both)",
            self.server.api_port
        );

        // Every fallback_order entry must reference a known provider
        for name in &self.cloud.fallback_order {
            anyhow::ensure!(
                self.cloud.providers.contains_key(name),
                "cloud.fallback_order entry `{name}` references unknown provider"
            );
        }

        anyhow::ensure!(
            self.limits.frame_queue_capacity > 0,
            "limits.frame_queue_capacity must be at least 1"
        );
        anyhow::ensure!(
            self.limits.max_viewers_per_room > 0,
            "limits.max_viewers_per_room must be at least 1"
        );

        if let Some(push) = &self.push {
            anyhow::ensure!(
                !push.vapid_public_key.is_empty(),
                "push.vapid_public_key must not be empty"
            );
            anyhow::ensure!(
                push.vapid_subject.starts_with("mailto:") || push.vapid_subject.starts_with("https://"),
                "push.vapid_subject must be a mailto: or https: URI (RFC 8292)"
            );
        }

        Ok(())
    }

    /// Cloud providers in fallback order, paired with their configs.
    ///
    /// An empty `fallback_order` means cloud fallback is disabled.
    pub fn fallback_chain(&self) -> Vec<(&str, &CloudProviderConfig)> {
        self.cloud
            .fallback_order
            .iter()
            .filter_map(|name| {
                self.cloud
                    .providers
                    .get(name)
                    .map(|cfg| (name.as_str(), cfg))
            })
            .collect()
    }
}

/// Listener ports and process-level paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port for the JSON REST API (default: 8080).
    #[serde(default = "defaults::api_port")]
    pub api_port: u16,

    /// Port for the WebSocket endpoints — stream intake and signaling
    /// (default: 8081).
    #[serde(default = "defaults::ws_port")]
    pub ws_port: u16,

    /// Path of the persisted ban list (default: `vigil-bans.json`).
    #[serde(default = "defaults::ban_list_path")]
    pub ban_list_path: String,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty server config must deserialize")
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database path (default: `vigil.db`). `:memory:` is accepted
    /// for throwaway runs.
    #[serde(default = "defaults::db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty store config must deserialize")
    }
}

/// Local vision inference server (Ollama-compatible wire).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Base URL — no trailing slash required.
    #[serde(default = "defaults::inference_url")]
    pub base_url: String,

    /// Small, fast model used for first-pass triage.
    pub triage_model: String,

    /// Larger model used for detailed analysis.
    pub analysis_model: String,

    /// Request deadline in milliseconds (default: 120 000).
    #[serde(default = "defaults::inference_timeout_ms")]
    pub timeout_ms: u64,
}

/// Cloud fallback settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// Named providers.
    #[serde(default)]
    pub providers: HashMap<String, CloudProviderConfig>,

    /// Order providers are consulted in — best quality first, then cheapest.
    /// The first provider returning a parseable verdict wins.
    #[serde(default)]
    pub fallback_order: Vec<String>,

    /// Per-provider request deadline in milliseconds (default: 30 000).
    #[serde(default = "defaults::cloud_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty cloud config must deserialize")
    }
}

/// A named cloud vision provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudProviderConfig {
    pub base_url: String,

    /// Environment variable name whose value is the API key.
    pub api_key_env: String,

    /// Model name sent to the provider.
    pub model: String,

    /// Wire protocol adapter (default: `openai`).
    #[serde(default)]
    pub wire: ProviderWire,
}

impl CloudProviderConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// Browser-push channel credentials (RFC 8292 VAPID).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushConfig {
    /// Base64url-encoded uncompressed P-256 public key, as handed to the
    /// browser's `pushManager.subscribe` call.
    pub vapid_public_key: String,

    /// Environment variable holding the base64url-encoded P-256 private
    /// scalar (32 bytes).
    pub vapid_private_key_env: String,

    /// Contact URI embedded in the VAPID JWT (`mailto:` or `https:`).
    pub vapid_subject: String,
}

/// SMS channel credentials (Twilio-style Messages API).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmsConfig {
    pub account_sid: String,

    /// Environment variable holding the auth token.
    pub auth_token_env: String,

    /// Sender number in E.164 format.
    pub from_number: String,

    #[serde(default = "defaults::sms_base_url")]
    pub api_base_url: String,
}

/// Chat-bot channel credentials (Telegram-style bot API).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    /// Environment variable holding the bot token.
    pub bot_token_env: String,

    #[serde(default = "defaults::chat_base_url")]
    pub api_base_url: String,
}

/// Bounds, timeouts, and sweep cadences.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Frames in flight globally (default: CPU count).
    #[serde(default = "defaults::max_concurrent_analyses")]
    pub max_concurrent_analyses: usize,

    /// Per-stream frame queue depth; overflow drops the oldest frame
    /// (default: 8).
    #[serde(default = "defaults::frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    /// Concurrent notification sends across all channels (default: 16).
    #[serde(default = "defaults::max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Per-send deadline in milliseconds (default: 10 000).
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Signaling room count bound (default: 256).
    #[serde(default = "defaults::max_rooms")]
    pub max_rooms: usize,

    /// Viewers per signaling room (default: 8).
    #[serde(default = "defaults::max_viewers_per_room")]
    pub max_viewers_per_room: usize,

    /// Idle rooms older than this are deleted, in seconds (default: 300).
    #[serde(default = "defaults::room_timeout_secs")]
    pub room_timeout_secs: u64,

    /// Streams silent longer than this are marked disconnected, in seconds
    /// (default: 60).
    #[serde(default = "defaults::ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Review leases expire after this many seconds (default: 600).
    #[serde(default = "defaults::lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    /// SMS sends allowed per phone number per window (default: 3 per 600 s).
    #[serde(default = "defaults::sms_rate_limit")]
    pub sms_rate_limit: RateLimit,

    /// Seconds between in-memory counter flushes to the store (default: 30).
    #[serde(default = "defaults::flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty limits config must deserialize")
    }
}

/// A count-per-window limit.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimit {
    pub max_per_window: u32,
    pub window_secs: u64,
}

mod defaults {
    use super::RateLimit;

    pub fn api_port() -> u16 { 8080 }
    pub fn ws_port() -> u16 { 8081 }
    pub fn ban_list_path() -> String { "vigil-bans.json".into() }
    pub fn db_path() -> String { "vigil.db".into() }
    pub fn inference_url() -> String { "http://localhost:11434".into() }
    pub fn inference_timeout_ms() -> u64 { 120_000 }
    pub fn cloud_timeout_ms() -> u64 { 30_000 }
    pub fn sms_base_url() -> String { "https://api.twilio.com".into() }
    pub fn chat_base_url() -> String { "https://api.telegram.org".into() }
    pub fn max_concurrent_analyses() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }
    pub fn frame_queue_capacity() -> usize { 8 }
    pub fn max_concurrent_sends() -> usize { 16 }
    pub fn send_timeout_ms() -> u64 { 10_000 }
    pub fn max_rooms() -> usize { 256 }
    pub fn max_viewers_per_room() -> usize { 8 }
    pub fn room_timeout_secs() -> u64 { 300 }
    pub fn ping_timeout_secs() -> u64 { 60 }
    pub fn lease_timeout_secs() -> u64 { 600 }
    pub fn sms_rate_limit() -> RateLimit {
        RateLimit { max_per_window: 3, window_secs: 600 }
    }
    pub fn flush_interval_secs() -> u64 { 30 }
}
