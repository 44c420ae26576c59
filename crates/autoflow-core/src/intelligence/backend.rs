//! LLM backends - the per-provider call boundary.
//!
//! `HttpBackend` speaks two wire styles over reqwest:
//!
//! ```text
//! anthropic : POST {base_url}/v1/messages        (x-api-key, anthropic-version)
//! openai    : POST {base_url}/chat/completions   (Authorization: Bearer)
//! ```
//!
//! HTTP failures are mapped onto typed `EngineError`s so the orchestrator can
//! classify them without looking at message text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::llm::{LlmConfig, LlmRole};

/// Text and usage returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub text: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn call(
        &self,
        prompt: &str,
        config: &LlmConfig,
        role: LlmRole,
    ) -> Result<BackendReply, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    Anthropic,
    OpenAi,
}

impl ApiStyle {
    /// Wire style for a vendor name; unknown vendors are assumed
    /// OpenAI-compatible.
    pub fn for_vendor(vendor: &str) -> Self {
        match vendor.to_lowercase().as_str() {
            "anthropic" | "claude" => Self::Anthropic,
            _ => Self::OpenAi,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com/v1",
        }
    }
}

/// Configuration for one HTTP-backed provider.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub style: ApiStyle,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl HttpBackendConfig {
    pub fn new(style: ApiStyle, model: &str, api_key: &str) -> Self {
        Self {
            style,
            base_url: style.default_base_url().to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: 120,
        }
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    fn provider_name(&self) -> String {
        let vendor = match self.config.style {
            ApiStyle::Anthropic => "anthropic",
            ApiStyle::OpenAi => "openai",
        };
        format!("{}:{}", vendor, self.config.model)
    }

    fn request_body(&self, prompt: &str, config: &LlmConfig, role: LlmRole) -> serde_json::Value {
        let system = role_system_prompt(role);
        let mut body = match self.config.style {
            ApiStyle::Anthropic => serde_json::json!({
                "model": self.config.model,
                "max_tokens": config.max_tokens,
                "system": system,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": config.temperature,
                "top_p": config.top_p,
            }),
            ApiStyle::OpenAi => serde_json::json!({
                "model": self.config.model,
                "max_tokens": config.max_tokens,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": prompt }
                ],
                "temperature": config.temperature,
                "top_p": config.top_p,
                "frequency_penalty": config.frequency_penalty,
                "presence_penalty": config.presence_penalty,
            }),
        };
        if let Some(stop) = &config.stop_sequences {
            let key = match self.config.style {
                ApiStyle::Anthropic => "stop_sequences",
                ApiStyle::OpenAi => "stop",
            };
            body[key] = serde_json::json!(stop);
        }
        body
    }

    fn map_transport_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::Timeout(format!("{} request timed out: {}", self.provider_name(), e))
        } else if e.is_connect() {
            EngineError::Transient(format!("{} connection failed: {}", self.provider_name(), e))
        } else {
            EngineError::Provider {
                provider: self.provider_name(),
                message: format!("HTTP request failed: {}", e),
                kind: None,
            }
        }
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    async fn call(
        &self,
        prompt: &str,
        config: &LlmConfig,
        role: LlmRole,
    ) -> Result<BackendReply, EngineError> {
        let base = self.config.base_url.trim_end_matches('/');
        let body = self.request_body(prompt, config, role);

        let request = match self.config.style {
            ApiStyle::Anthropic => self
                .client
                .post(format!("{}/v1/messages", base))
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", "2023-06-01"),
            ApiStyle::OpenAi => self
                .client
                .post(format!("{}/chat/completions", base))
                .header("Authorization", format!("Bearer {}", self.config.api_key)),
        };

        tracing::debug!(
            "[HttpBackend] Calling {} as {}",
            self.provider_name(),
            role.as_str()
        );

        let response = request
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !(200..300).contains(&status) {
            return Err(map_status_error(&self.provider_name(), status, &text));
        }

        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| EngineError::Provider {
            provider: self.provider_name(),
            message: format!("Failed to parse response JSON: {}", e),
            kind: None,
        })?;

        Ok(match self.config.style {
            ApiStyle::Anthropic => parse_anthropic_reply(&json),
            ApiStyle::OpenAi => parse_openai_reply(&json),
        })
    }
}

fn role_system_prompt(role: LlmRole) -> String {
    let duty = match role {
        LlmRole::Planner => "Break the goal into concrete, ordered actions.",
        LlmRole::Executor => "Carry out the requested action and report the result.",
        LlmRole::Verifier => "Check the given work for errors and state whether it holds.",
        LlmRole::Auditor => "Review the work for policy and safety problems.",
        LlmRole::Synthesizer => "Combine the given inputs into one coherent answer.",
    };
    format!("You are the {} in an automation pipeline. {}", role.as_str(), duty)
}

/// Map a non-2xx status onto the error taxonomy.
pub fn map_status_error(provider: &str, status: u16, body: &str) -> EngineError {
    let detail = format!("{} returned {}: {}", provider, status, body);
    match status {
        429 => EngineError::RateLimited(detail),
        401 | 403 => EngineError::Unauthorized(detail),
        408 | 504 => EngineError::Timeout(detail),
        500..=599 => EngineError::Provider {
            provider: provider.to_string(),
            message: detail,
            kind: Some(crate::models::FailureType::ModelError),
        },
        _ => EngineError::Provider {
            provider: provider.to_string(),
            message: detail,
            kind: None,
        },
    }
}

pub fn parse_anthropic_reply(json: &serde_json::Value) -> BackendReply {
    let text = json
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                    } else {
                        None
                    }
                })
                .reduce(|a, b| format!("{}\n{}", a, b))
        })
        .unwrap_or_default();

    let tokens_used = json
        .get("usage")
        .map(|u| {
            u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
        })
        .unwrap_or(0);

    BackendReply { text, tokens_used }
}

pub fn parse_openai_reply(json: &serde_json::Value) -> BackendReply {
    let text = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tokens_used = json
        .get("usage")
        .map(|u| {
            u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or_else(|| {
                u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                    + u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
            })
        })
        .unwrap_or(0);

    BackendReply { text, tokens_used }
}
