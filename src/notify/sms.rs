//! SMS channel (Twilio-style Messages API).
//!
//! The Messages API wants `application/x-www-form-urlencoded` with Basic
//! auth, not JSON. Provider-side rate limiting (429) is surfaced as
//! [`Error::RateLimited`] so the fan-out layer never retries it.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SmsConfig;
use crate::error::Error;
use crate::store::types::Severity;

use super::NotificationPayload;

/// Form-encoded request body for the Messages API.
#[derive(Debug, Clone, Serialize)]
struct SendMessageRequest {
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body")]
    body: String,
}

/// Response from the Messages API.
#[derive(Debug, Clone, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct SmsChannel {
    client: Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl SmsChannel {
    /// Build the channel, resolving the auth token from the environment.
    /// Returns `None` (channel unavailable) when the token is unset.
    pub fn from_config(cfg: &SmsConfig) -> Option<Self> {
        let auth_token = std::env::var(&cfg.auth_token_env).ok().filter(|t| !t.is_empty())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Some(Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            account_sid: cfg.account_sid.clone(),
            auth_token,
            from_number: cfg.from_number.clone(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }

    /// Send one SMS. `to` is an E.164 number.
    pub async fn send(&self, to: &str, payload: &NotificationPayload) -> Result<(), Error> {
        let request = SendMessageRequest {
            to: to.to_string(),
            from: self.from_number.clone(),
            body: format!("{} {}\n{}", severity_marker(payload.severity), payload.title, payload.body),
        };

        debug!(to = %to, "sending SMS");

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProviderUnavailable(format!("SMS HTTP {status}: {body}")));
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("SMS response body: {e}")))?;
        if let Some(code) = api.error_code {
            let msg = api.error_message.unwrap_or_else(|| format!("error code {code}"));
            return Err(Error::ProviderUnavailable(msg));
        }
        Ok(())
    }

    /// Probe the Account resource — a cheap authenticated GET.
    pub async fn health(&self) -> Result<(), Error> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.base_url, self.account_sid
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "SMS health HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "ℹ️",
        Severity::Warning => "⚠️",
        Severity::Urgent => "🚨",
        Severity::Critical => "🆘",
    }
}
