use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmRole {
    Planner,
    Executor,
    Verifier,
    Auditor,
    Synthesizer,
}

impl LlmRole {
    pub const ALL: [LlmRole; 5] = [
        Self::Planner,
        Self::Executor,
        Self::Verifier,
        Self::Auditor,
        Self::Synthesizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Verifier => "verifier",
            Self::Auditor => "auditor",
            Self::Synthesizer => "synthesizer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "executor" => Some(Self::Executor),
            "verifier" => Some(Self::Verifier),
            "auditor" => Some(Self::Auditor),
            "synthesizer" => Some(Self::Synthesizer),
            _ => None,
        }
    }
}

impl std::fmt::Display for LlmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model backend and its live scoreboard figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProvider {
    /// Vendor adapter name, e.g. "openai" or "anthropic".
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: String,
    pub cost_per_token: f64,
    /// Exponentially smoothed latency in seconds.
    #[serde(default)]
    pub avg_latency: f64,
    #[serde(default = "default_reliability")]
    pub reliability_score: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_reliability() -> f64 {
    1.0
}

impl LlmProvider {
    pub fn new(vendor: &str, model: &str, cost_per_token: f64) -> Self {
        Self {
            vendor: vendor.to_string(),
            model: model.to_string(),
            endpoint: String::new(),
            cost_per_token,
            avg_latency: 0.0,
            reliability_score: default_reliability(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Scoreboard key: `vendor:model`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.vendor, self.model)
    }
}

/// Sampling parameters for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop_sequences: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub provider: LlmProvider,
    pub role: LlmRole,
    pub prompt: String,
    pub response: String,
    pub confidence: f64,
    pub tokens_used: u64,
    /// Seconds.
    pub latency: f64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub consensus: bool,
    pub selected_response: Option<LlmResponse>,
    pub discrepancies: Vec<String>,
    pub confidence: f64,
}
