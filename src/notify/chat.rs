//! Chat-bot channel (Telegram-style bot API).

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::config::ChatConfig;
use crate::error::Error;
use crate::store::types::Severity;

use super::NotificationPayload;

pub struct ChatChannel {
    client: Client,
    base_url: String,
    bot_token: String,
}

impl ChatChannel {
    /// Build the channel, resolving the bot token from the environment.
    /// Returns `None` (channel unavailable) when the token is unset.
    pub fn from_config(cfg: &ChatConfig) -> Option<Self> {
        let bot_token = std::env::var(&cfg.bot_token_env).ok().filter(|t| !t.is_empty())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Some(Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            bot_token,
        })
    }

    /// Send one message to a chat.
    pub async fn send(&self, chat_id: &str, payload: &NotificationPayload) -> Result<(), Error> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let mut text = format!(
            "{} *{}*\n{}",
            severity_emoji(payload.severity),
            payload.title,
            payload.body
        );
        if let Some(link) = &payload.url {
            text.push_str(&format!("\n{link}"));
        }

        debug!(chat = %chat_id, "sending chat message");

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProviderUnavailable(format!(
                "chat HTTP {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Probe the bot identity endpoint.
    pub async fn health(&self) -> Result<(), Error> {
        let url = format!("{}/bot{}/getMe", self.base_url, self.bot_token);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "chat health HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "ℹ️",
        Severity::Warning => "⚠️",
        Severity::Urgent => "🚨",
        Severity::Critical => "🆘",
    }
}
