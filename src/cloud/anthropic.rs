//! Anthropic Messages API vision adapter (`/v1/messages`).

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::error::Error;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicVision {
    client: Client,
    base_url: String,
    model: String,
}

impl AnthropicVision {
    pub fn new(base_url: String, model: String, timeout_ms: u64, api_key: &str) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(api_key)
                .expect("API key contains invalid header characters"),
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
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
        let url = format!("{}/v1/messages", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": 512,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": image_b64
                        }
                    },
                    { "type": "text", "text": prompt }
                ]
            }]
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "anthropic provider returned HTTP {status}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("anthropic body: {e}")))?;

        reply
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Parse("anthropic reply missing content text".into()))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn analyze_extracts_content_text_and_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{ "type": "text", "text": "{\"concern_level\": \"high\"}" }]
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicVision::new(server.uri(), "claude-sonnet".into(), 5_000, "sk-ant-test");
        let text = adapter.analyze("look", "aGVsbG8=").await.unwrap();
        assert!(text.contains("high"));
    }

    #[tokio::test]
    async fn analyze_maps_http_error_to_provider_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529))
            .mount(&server)
            .await;

        let adapter = AnthropicVision::new(server.uri(), "claude-sonnet".into(), 5_000, "k");
        assert!(matches!(
            adapter.analyze("look", "x").await.unwrap_err(),
            Error::ProviderUnavailable(_)
        ));
    }
}
