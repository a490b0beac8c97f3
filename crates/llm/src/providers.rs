//! Provider descriptors and per-API-shape HTTP plumbing.
//!
//! Models are configured as `provider/model-name` strings. Each supported
//! provider maps onto one of four API shapes; a [`Descriptor`] binds the
//! shape, the endpoint, and the credential handle resolved at chain
//! construction time. Credentials are credential-only environment variables
//! and are read from the environment regardless of operational mode.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

/// One step of the fallback chain.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Provider id, the first segment of the model string.
    pub provider: String,
    /// Model id as the provider expects it (prefix stripped).
    pub model_id: String,
    /// The full `provider/model` string, for display and audit.
    pub model: String,
    pub shape: ApiShape,
    credential: Option<String>,
}

/// The wire formats wardsh can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiShape {
    /// `POST /chat/completions` with bearer auth (openai, groq,
    /// together_ai, featherless_ai).
    OpenAiCompat,
    /// Anthropic `POST /v1/messages` with `x-api-key`.
    AnthropicMessages,
    /// Google `models/{model}:generateContent` with `x-goog-api-key`.
    Gemini,
    /// Local Ollama `POST /api/chat`; no credential.
    Ollama,
}

/// Provider id → (shape, chat endpoint, credential env vars in lookup order).
/// Local providers carry no env vars and report `"local"` as their handle.
const PROVIDER_TABLE: &[(&str, ApiShape, &str, &[&str])] = &[
    (
        "openai",
        ApiShape::OpenAiCompat,
        "https://api.openai.com/v1/chat/completions",
        &["OPENAI_API_KEY"],
    ),
    (
        "groq",
        ApiShape::OpenAiCompat,
        "https://api.groq.com/openai/v1/chat/completions",
        &["GROQ_API_KEY"],
    ),
    (
        "together_ai",
        ApiShape::OpenAiCompat,
        "https://api.together.xyz/v1/chat/completions",
        &["TOGETHERAI_API_KEY"],
    ),
    (
        "featherless_ai",
        ApiShape::OpenAiCompat,
        "https://api.featherless.ai/v1/chat/completions",
        &["FEATHERLESS_AI_API_KEY"],
    ),
    (
        "anthropic",
        ApiShape::AnthropicMessages,
        "https://api.anthropic.com/v1/messages",
        &["ANTHROPIC_API_KEY"],
    ),
    (
        "gemini",
        ApiShape::Gemini,
        "https://generativelanguage.googleapis.com/v1beta",
        &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
    ),
    ("ollama", ApiShape::Ollama, "", &[]),
];

/// Providers that run locally and need no API key.
pub const LOCAL_PROVIDERS: &[&str] = &["ollama"];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported provider '{0}'")]
    Unsupported(String),
    #[error("invalid model string '{0}' (expected provider/model-name)")]
    InvalidModel(String),
    #[error("provider '{provider}' is not in the allowed providers list. Allowed: {allowed}")]
    NotAllowed { provider: String, allowed: String },
    #[error("no API key configured for provider '{0}'")]
    MissingCredential(String),
    #[error("request to {provider} failed: {source}")]
    Http {
        provider: String,
        source: reqwest::Error,
    },
    #[error("{provider} returned {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },
}

/// What came back from a provider: the raw completion text plus the stop
/// reason the provider reported, which the parser needs to classify empty
/// completions.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub stop_reason: Option<String>,
}

pub fn provider_from_model(model: &str) -> &str {
    model.split('/').next().unwrap_or(model)
}

pub fn is_valid_model_string(model: &str) -> bool {
    match model.split_once('/') {
        Some((provider, rest)) => !provider.is_empty() && !rest.is_empty(),
        None => false,
    }
}

/// Credential handle for a provider, read from the environment. Values are
/// trimmed because CRLF-polluted `.env` files otherwise break HTTP headers.
/// Local providers report `"local"`.
pub fn api_key(provider: &str) -> Option<String> {
    let provider = provider.to_ascii_lowercase();
    if LOCAL_PROVIDERS.contains(&provider.as_str()) {
        return Some("local".to_string());
    }
    let (_, _, _, env_vars) = PROVIDER_TABLE.iter().find(|(id, ..)| *id == provider)?;
    for var in *env_vars {
        if let Ok(value) = std::env::var(var) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Check a model's provider against the configured allow-list.
pub fn validate_model_provider(model: &str, allowed: &HashSet<String>) -> Result<(), ProviderError> {
    let provider = provider_from_model(model).to_ascii_lowercase();
    if allowed.contains(&provider) {
        return Ok(());
    }
    let mut sorted: Vec<&str> = allowed.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    Err(ProviderError::NotAllowed {
        provider,
        allowed: sorted.join(", "),
    })
}

impl Descriptor {
    /// Build a descriptor from a `provider/model` string, resolving the
    /// credential handle from the environment.
    pub fn from_model(model: &str) -> Result<Self, ProviderError> {
        if !is_valid_model_string(model) {
            return Err(ProviderError::InvalidModel(model.to_string()));
        }
        let (provider, model_id) = model.split_once('/').unwrap_or((model, ""));
        let provider = provider.to_ascii_lowercase();
        let shape = PROVIDER_TABLE
            .iter()
            .find(|(id, ..)| *id == provider)
            .map(|(_, shape, ..)| *shape)
            .ok_or_else(|| ProviderError::Unsupported(provider.clone()))?;
        Ok(Self {
            credential: api_key(&provider),
            provider,
            model_id: model_id.to_string(),
            model: model.to_string(),
            shape,
        })
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    #[cfg(test)]
    pub(crate) fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    fn endpoint(&self) -> String {
        match self.shape {
            ApiShape::Ollama => {
                let base = std::env::var("OLLAMA_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:11434".to_string());
                format!("{}/api/chat", base.trim_end_matches('/'))
            }
            ApiShape::Gemini => {
                let base = PROVIDER_TABLE
                    .iter()
                    .find(|(id, ..)| *id == self.provider)
                    .map(|(_, _, url, _)| *url)
                    .unwrap_or_default();
                format!("{base}/models/{}:generateContent", self.model_id)
            }
            _ => PROVIDER_TABLE
                .iter()
                .find(|(id, ..)| *id == self.provider)
                .map(|(_, _, url, _)| (*url).to_string())
                .unwrap_or_default(),
        }
    }

    /// Post one classification request and return the raw completion.
    pub async fn query(
        &self,
        client: &reqwest::Client,
        timeout: Duration,
        system: &str,
        user: &str,
    ) -> Result<Completion, ProviderError> {
        let credential = match self.shape {
            ApiShape::Ollama => None,
            _ => Some(self.credential.clone().ok_or_else(|| {
                ProviderError::MissingCredential(self.provider.clone())
            })?),
        };

        let payload = self.build_payload(system, user);
        let mut request = client.post(self.endpoint()).timeout(timeout).json(&payload);
        request = match (self.shape, &credential) {
            (ApiShape::OpenAiCompat, Some(key)) => request.bearer_auth(key),
            (ApiShape::AnthropicMessages, Some(key)) => request
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            (ApiShape::Gemini, Some(key)) => request.header("x-goog-api-key", key),
            _ => request,
        };

        let response = request.send().await.map_err(|source| ProviderError::Http {
            provider: self.provider.clone(),
            source,
        })?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|source| ProviderError::Http {
            provider: self.provider.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: self.provider.clone(),
                status: status.as_u16(),
                body: truncate(&body.to_string(), 200),
            });
        }

        Ok(self.parse_completion(&body))
    }

    fn build_payload(&self, system: &str, user: &str) -> Value {
        match self.shape {
            ApiShape::OpenAiCompat => json!({
                "model": self.model_id,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }),
            ApiShape::AnthropicMessages => json!({
                "model": self.model_id,
                "max_tokens": 256,
                "system": system,
                "messages": [
                    {"role": "user", "content": user},
                ],
            }),
            ApiShape::Gemini => json!({
                "systemInstruction": {"parts": [{"text": system}]},
                "contents": [
                    {"role": "user", "parts": [{"text": user}]},
                ],
            }),
            ApiShape::Ollama => json!({
                "model": self.model_id,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "stream": false,
            }),
        }
    }

    fn parse_completion(&self, body: &Value) -> Completion {
        match self.shape {
            ApiShape::OpenAiCompat => {
                let choice = body.get("choices").and_then(|c| c.get(0));
                Completion {
                    content: choice
                        .and_then(|c| c.get("message"))
                        .and_then(|m| m.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    stop_reason: choice
                        .and_then(|c| c.get("finish_reason"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                }
            }
            ApiShape::AnthropicMessages => Completion {
                content: body
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default(),
                stop_reason: body
                    .get("stop_reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            },
            ApiShape::Gemini => {
                let candidate = body.get("candidates").and_then(|c| c.get(0));
                Completion {
                    content: candidate
                        .and_then(|c| c.get("content"))
                        .and_then(|c| c.get("parts"))
                        .and_then(|p| p.get(0))
                        .and_then(|p| p.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    stop_reason: candidate
                        .and_then(|c| c.get("finishReason"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                }
            }
            ApiShape::Ollama => Completion {
                content: body
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                stop_reason: body
                    .get("done_reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            },
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_string_validation() {
        assert!(is_valid_model_string("openai/gpt-4o-mini"));
        assert!(is_valid_model_string("featherless_ai/meta-llama/Llama-Guard-3-8B"));
        assert!(!is_valid_model_string("gpt-4o-mini"));
        assert!(!is_valid_model_string("openai/"));
        assert!(!is_valid_model_string("/model"));
    }

    #[test]
    fn provider_extraction() {
        assert_eq!(provider_from_model("anthropic/claude-3-5-haiku-20241022"), "anthropic");
        assert_eq!(provider_from_model("bare"), "bare");
    }

    #[test]
    fn descriptor_strips_provider_prefix_once() {
        let d = Descriptor::from_model("featherless_ai/meta-llama/Llama-Guard-3-8B").unwrap();
        assert_eq!(d.provider, "featherless_ai");
        assert_eq!(d.model_id, "meta-llama/Llama-Guard-3-8B");
        assert_eq!(d.shape, ApiShape::OpenAiCompat);
    }

    #[test]
    fn descriptor_rejects_unknown_provider() {
        let err = Descriptor::from_model("mystery/model").unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[test]
    fn local_provider_needs_no_key() {
        assert_eq!(api_key("ollama").as_deref(), Some("local"));
        let d = Descriptor::from_model("ollama/llama3.1:8b").unwrap();
        assert!(d.has_credential());
    }

    #[test]
    fn allowlist_check_names_offender_and_allowed_set() {
        let allowed: HashSet<String> = ["openai".to_string()].into_iter().collect();
        let err = validate_model_provider("anthropic/claude-3-5-haiku-20241022", &allowed)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'anthropic'"));
        assert!(msg.contains("openai"));
        assert!(validate_model_provider("openai/gpt-4o-mini", &allowed).is_ok());
    }

    #[test]
    fn openai_completion_parsing() {
        let d = Descriptor::from_model("ollama/x").unwrap();
        let d = Descriptor {
            shape: ApiShape::OpenAiCompat,
            ..d
        };
        let body = serde_json::json!({
            "choices": [{"message": {"content": "{\"action\":\"allow\"}"}, "finish_reason": "stop"}]
        });
        let completion = d.parse_completion(&body);
        assert_eq!(completion.content, "{\"action\":\"allow\"}");
        assert_eq!(completion.stop_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn anthropic_completion_joins_text_blocks() {
        let d = Descriptor {
            shape: ApiShape::AnthropicMessages,
            ..Descriptor::from_model("ollama/x").unwrap()
        };
        let body = serde_json::json!({
            "content": [{"type": "text", "text": "{\"action\":"}, {"type": "text", "text": "\"warn\"}"}],
            "stop_reason": "end_turn"
        });
        let completion = d.parse_completion(&body);
        assert_eq!(completion.content, "{\"action\":\"warn\"}");
    }

    #[test]
    fn gemini_completion_parsing() {
        let d = Descriptor {
            shape: ApiShape::Gemini,
            ..Descriptor::from_model("ollama/x").unwrap()
        };
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "ok"}]}, "finishReason": "STOP"}]
        });
        let completion = d.parse_completion(&body);
        assert_eq!(completion.content, "ok");
        assert_eq!(completion.stop_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn empty_body_yields_empty_completion() {
        let d = Descriptor {
            shape: ApiShape::OpenAiCompat,
            ..Descriptor::from_model("ollama/x").unwrap()
        };
        let completion = d.parse_completion(&serde_json::json!({}));
        assert!(completion.content.is_empty());
        assert!(completion.stop_reason.is_none());
    }
}
