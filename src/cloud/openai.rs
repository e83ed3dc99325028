//! OpenAI-compatible vision adapter.
//!
//! Handles any provider that speaks the `/v1/chat/completions` protocol with
//! `image_url` content parts — including OpenRouter and compatible gateways.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::error::Error;

pub struct OpenAiVision {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiVision {
    /// Build an adapter for the given base URL and bearer token.
    pub fn new(base_url: String, model: String, timeout_ms: u64, api_key: &str) -> Self {
        let mut headers = header::HeaderMap::new();
        // Panics on invalid header bytes — surfaces misconfiguration at startup, not at request time.
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .expect("API key contains invalid Authorization header characters"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url, model }
    }

    /// Ask the model about one frame; returns the assistant's raw text.
    pub async fn analyze(&self, prompt: &str, image_b64: &str) -> Result<String, Error> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": 512,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{image_b64}") }
                    }
                ]
            }]
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "openai-wire provider returned HTTP {status}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("openai-wire body: {e}")))?;

        reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Parse("openai-wire reply missing message content".into()))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}
