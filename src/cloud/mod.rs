//! Cloud vision fallback — ordered multi-provider client.
//!
//! [`ProviderClient`] is an enum that wraps a concrete wire adapter chosen at
//! construction time from [`CloudProviderConfig::wire`]. [`CloudFallback`]
//! walks the configured provider order: the first provider that answers with
//! a parseable JSON verdict wins and the rest are skipped. A provider whose
//! transport fails is skipped; a provider that answers but whose verdict
//! can't be parsed still wins, degraded to a low-concern "parse error"
//! verdict — the image reached a model, guessing further buys nothing.

mod anthropic;
mod openai;

pub use anthropic::AnthropicVision;
pub use openai::OpenAiVision;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{CloudProviderConfig, ProviderWire};
use crate::error::Error;
use crate::store::types::Concern;

/// Parsed verdict from a cloud provider.
#[derive(Debug, Clone)]
pub struct CloudVerdict {
    pub concern: Concern,
    pub description: String,
    pub detected_issues: Vec<String>,
    pub recommended_action: Option<String>,
    pub confidence: f32,
    /// Model name of the provider that produced this verdict.
    pub model: String,
}

/// Unified provider client — enum dispatch over concrete wire adapters.
pub enum ProviderClient {
    OpenAi(OpenAiVision),
    Anthropic(AnthropicVision),
}

impl ProviderClient {
    /// Build a provider client from config, resolving the API key from the
    /// environment.
    ///
    /// # Errors
    /// Returns an error when the configured `api_key_env` variable is unset —
    /// every cloud provider requires a key.
    pub fn new(cfg: &CloudProviderConfig, timeout_ms: u64) -> anyhow::Result<Self> {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        let key = cfg.api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "cloud provider requires an API key; set the `{}` environment variable",
                cfg.api_key_env
            )
        })?;

        Ok(match cfg.wire {
            ProviderWire::OpenAi => {
                Self::OpenAi(OpenAiVision::new(base_url, cfg.model.clone(), timeout_ms, &key))
            }
            ProviderWire::Anthropic => {
                Self::Anthropic(AnthropicVision::new(base_url, cfg.model.clone(), timeout_ms, &key))
            }
        })
    }

    pub async fn analyze(&self, prompt: &str, image_b64: &str) -> Result<String, Error> {
        match self {
            Self::OpenAi(a) => a.analyze(prompt, image_b64).await,
            Self::Anthropic(a) => a.analyze(prompt, image_b64).await,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAi(a) => a.model(),
            Self::Anthropic(a) => a.model(),
        }
    }
}

/// The ordered fallback chain.
pub struct CloudFallback {
    providers: Vec<(String, ProviderClient)>,
}

impl CloudFallback {
    /// Build the chain from `(name, config)` pairs in fallback order.
    /// Providers whose key is missing are skipped with a warning rather than
    /// failing startup — the chain degrades, it doesn't disappear.
    pub fn new(chain: &[(&str, &CloudProviderConfig)], timeout_ms: u64) -> Self {
        let providers = chain
            .iter()
            .filter_map(|(name, cfg)| match ProviderClient::new(cfg, timeout_ms) {
                Ok(client) => Some((name.to_string(), client)),
                Err(e) => {
                    warn!(provider = %name, error = %e, "cloud provider skipped");
                    None
                }
            })
            .collect();
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Consult providers in order; first parseable verdict wins.
    pub async fn analyze(&self, prompt: &str, image_b64: &str) -> Result<CloudVerdict, Error> {
        for (name, provider) in &self.providers {
            match provider.analyze(prompt, image_b64).await {
                Ok(text) => {
                    debug!(provider = %name, "cloud provider answered");
                    return Ok(parse_verdict(&text, provider.model()));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "cloud provider failed — trying next");
                }
            }
        }
        Err(Error::ProviderUnavailable(
            "all cloud providers exhausted".into(),
        ))
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    concern_level: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    detected_issues: Vec<String>,
    #[serde(default)]
    recommended_action: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse a provider's text into a verdict, degrading to low/"parse error"
/// when the text holds no usable JSON.
pub(crate) fn parse_verdict(text: &str, model: &str) -> CloudVerdict {
    match extract_json(text).and_then(|json| serde_json::from_str::<RawVerdict>(&json).ok()) {
        Some(raw) => CloudVerdict {
            concern: concern_from_keyword(&raw.concern_level),
            description: raw
                .description
                .unwrap_or_else(|| raw.concern_level.clone()),
            detected_issues: raw.detected_issues,
            recommended_action: raw.recommended_action,
            confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            model: model.to_string(),
        },
        None => CloudVerdict {
            concern: Concern::Low,
            description: "parse error".into(),
            detected_issues: Vec::new(),
            recommended_action: None,
            confidence: 0.0,
            model: model.to_string(),
        },
    }
}

/// Locate the outermost JSON object in a model reply, tolerating markdown
/// fences and prose around it.
fn extract_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

fn concern_from_keyword(level: &str) -> Concern {
    match level.trim().to_ascii_lowercase().as_str() {
        "none" | "normal" | "safe" => Concern::None,
        "low" | "minor" => Concern::Low,
        "medium" | "moderate" => Concern::Medium,
        "high" | "urgent" | "danger" => Concern::High,
        "critical" | "emergency" => Concern::Critical,
        _ => Concern::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Verdict parsing — pure, no I/O
    // -----------------------------------------------------------------------

    #[test]
    fn parse_plain_json_verdict() {
        let v = parse_verdict(r#"{"concern_level": "medium"}"#, "gpt-4o");
        assert_eq!(v.concern, Concern::Medium);
        assert_eq!(v.model, "gpt-4o");
    }

    #[test]
    fn parse_fenced_json_with_surrounding_prose() {
        let text = "Here is my assessment:\n```json\n{\"concern_level\": \"high\", \
                    \"description\": \"person on floor\", \"detected_issues\": [\"fall\"], \
                    \"confidence\": 0.9}\n```\nStay safe.";
        let v = parse_verdict(text, "claude-sonnet");
        assert_eq!(v.concern, Concern::High);
        assert_eq!(v.description, "person on floor");
        assert_eq!(v.detected_issues, vec!["fall".to_string()]);
        assert!((v.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn unparseable_reply_degrades_to_low_parse_error() {
        let v = parse_verdict("I am unable to assess this image.", "gpt-4o");
        assert_eq!(v.concern, Concern::Low);
        assert_eq!(v.description, "parse error");
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn unknown_concern_keyword_defaults_to_low() {
        let v = parse_verdict(r#"{"concern_level": "weird"}"#, "m");
        assert_eq!(v.concern, Concern::Low);
    }

    // -----------------------------------------------------------------------
    // Fallback order
    // -----------------------------------------------------------------------

    fn provider_cfg(server: &MockServer, key_env: &str) -> CloudProviderConfig {
        // SAFETY: test-only env mutation with a unique variable name.
        std::env::set_var(key_env, "sk-test");
        CloudProviderConfig {
            base_url: server.uri(),
            api_key_env: key_env.into(),
            model: "gpt-4o".into(),
            wire: ProviderWire::OpenAi,
        }
    }

    fn openai_reply(content: &str) -> serde_json::Value {
        serde_json::json!({ "choices": [{ "message": { "content": content } }] })
    }

    #[tokio::test]
    async fn first_healthy_provider_wins_and_rest_are_skipped() {
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&down)
            .await;

        let up = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(openai_reply(r#"{"concern_level": "medium"}"#)),
            )
            .expect(1)
            .mount(&up)
            .await;

        let never = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("{}")))
            .expect(0)
            .mount(&never)
            .await;

        let cfg_a = provider_cfg(&down, "VIGIL_TEST_CLOUD_A");
        let cfg_b = provider_cfg(&up, "VIGIL_TEST_CLOUD_B");
        let cfg_c = provider_cfg(&never, "VIGIL_TEST_CLOUD_C");

        let chain = CloudFallback::new(
            &[("a", &cfg_a), ("b", &cfg_b), ("c", &cfg_c)],
            5_000,
        );
        let verdict = chain.analyze("look", "aGVsbG8=").await.unwrap();
        assert_eq!(verdict.concern, Concern::Medium);
    }

    #[tokio::test]
    async fn all_providers_down_yields_provider_unavailable() {
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;

        let cfg = provider_cfg(&down, "VIGIL_TEST_CLOUD_D");
        let chain = CloudFallback::new(&[("only", &cfg)], 5_000);
        assert!(matches!(
            chain.analyze("look", "x").await.unwrap_err(),
            Error::ProviderUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn provider_with_missing_key_is_dropped_from_chain() {
        let cfg = CloudProviderConfig {
            base_url: "https://api.example.com".into(),
            api_key_env: "VIGIL_TEST_DEFINITELY_UNSET_KEY_42".into(),
            model: "m".into(),
            wire: ProviderWire::OpenAi,
        };
        let chain = CloudFallback::new(&[("keyless", &cfg)], 5_000);
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn responding_provider_with_garbage_body_wins_with_degraded_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(openai_reply("no json here, sorry")),
            )
            .mount(&server)
            .await;

        let cfg = provider_cfg(&server, "VIGIL_TEST_CLOUD_E");
        let chain = CloudFallback::new(&[("only", &cfg)], 5_000);
        let verdict = chain.analyze("look", "x").await.unwrap();
        assert_eq!(verdict.concern, Concern::Low);
        assert_eq!(verdict.description, "parse error");
    }
}
