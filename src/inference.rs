//! Local vision inference client (Ollama-compatible wire).
//!
//! The local server does all routine triage and analysis; the cloud chain is
//! only consulted when this client is unhealthy, too slow, or a high-concern
//! triage needs verification. The adapter is intentionally thin — prompt in,
//! free text out; concern extraction happens in the pipeline.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;

/// Reply from one generate call.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub text: String,
    pub model: String,
    pub duration_ms: u64,
}

pub struct InferenceClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    model: String,
    /// Nanoseconds, per the Ollama wire format.
    #[serde(default)]
    total_duration: u64,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl InferenceClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Probe the server root — returns quickly whether the server is up.
    pub async fn health(&self) -> Result<(), Error> {
        let url = format!("{}/", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "inference health check returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Installed model names.
    pub async fn models(&self) -> Result<Vec<String>, Error> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "model list returned HTTP {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("model list body: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// One non-streaming generate call against `model`, optionally with a
    /// base64-encoded frame attached.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image_b64: Option<&str>,
    ) -> Result<GenerateReply, Error> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(image) = image_b64 {
            body["images"] = json!([image]);
        }

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ProviderUnavailable(format!(
                "generate returned HTTP {status}"
            )));
        }

        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("generate body: {e}")))?;

        Ok(GenerateReply {
            text: reply.response,
            model: reply.model,
            duration_ms: reply.total_duration / 1_000_000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> InferenceClient {
        InferenceClient::new(&server.uri(), 5_000)
    }

    // -----------------------------------------------------------------------
    // generate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn generate_returns_text_and_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({ "model": "llava:13b" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "NONE — the room is quiet.",
                "model": "llava:13b",
                "total_duration": 1_500_000_000u64
            })))
            .mount(&server)
            .await;

        let reply = client_for(&server)
            .generate("llava:13b", "Describe the frame.", None)
            .await
            .unwrap();
        assert_eq!(reply.model, "llava:13b");
        assert_eq!(reply.duration_ms, 1_500);
        assert!(reply.text.starts_with("NONE"));
    }

    #[tokio::test]
    async fn generate_attaches_image_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({ "images": ["aGVsbG8="] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "LOW", "model": "m"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .generate("m", "p", Some("aGVsbG8="))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generate_maps_5xx_to_provider_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server).generate("m", "p", None).await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)), "got {err:?}");
    }

    // -----------------------------------------------------------------------
    // health / models
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_ok_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
            .mount(&server)
            .await;

        assert!(client_for(&server).health().await.is_ok());
    }

    #[tokio::test]
    async fn health_errors_on_refused_connection() {
        // Nothing listens here.
        let client = InferenceClient::new("http://127.0.0.1:1", 1_000);
        assert!(client.health().await.is_err());
    }

    #[tokio::test]
    async fn models_lists_installed_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [ { "name": "moondream:1.8b" }, { "name": "llava:13b" } ]
            })))
            .mount(&server)
            .await;

        let models = client_for(&server).models().await.unwrap();
        assert_eq!(models, vec!["moondream:1.8b", "llava:13b"]);
    }
}
