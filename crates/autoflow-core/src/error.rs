//! Core error type for the Autoflow engine.
//!
//! `EngineError` is used throughout the core (stores, fabric, lifecycle,
//! orchestrator). Every variant maps onto a [`FailureType`] so the
//! orchestrator can pick a recovery action from structured data; errors that
//! only carry free text fall back to [`classify_message`].

use crate::models::failure::FailureType;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Maximum concurrent agents ({0}) reached")]
    Capacity(usize),

    #[error("No available providers for role: {0}")]
    Routing(String),

    #[error("LLM provider {provider} failed: {message}")]
    Provider {
        provider: String,
        message: String,
        kind: Option<FailureType>,
    },

    #[error("All LLM providers failed. Last error: {last}")]
    AllProvidersFailed { role: String, last: Box<EngineError> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("{0}")]
    Step(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Classify this error for the recovery ladder.
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Capacity(_) | Self::RateLimited(_) => FailureType::ResourceExhaustion,
            Self::Timeout(_) => FailureType::Timeout,
            Self::Unauthorized(_) | Self::Policy(_) => FailureType::PolicyViolation,
            Self::Tool(_) => FailureType::ToolError,
            Self::Transient(_) => FailureType::Transient,
            Self::Provider { kind, .. } => kind.unwrap_or(FailureType::ModelError),
            // Exhaustion is a model failure unless the last provider hit
            // something the ladder ranks higher.
            Self::AllProvidersFailed { last, .. } => match last.failure_type() {
                ft @ (FailureType::Timeout
                | FailureType::ResourceExhaustion
                | FailureType::PolicyViolation) => ft,
                _ => FailureType::ModelError,
            },
            Self::Step(msg) | Self::Internal(msg) => classify_message(msg),
            Self::Routing(_)
            | Self::NotFound(_)
            | Self::InvalidWorkflow(_)
            | Self::InvalidTransition(_)
            | Self::Store(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Config(_) => FailureType::Unknown,
        }
    }
}

/// Substring classifier for errors that arrive as plain text.
///
/// Priority: timeout, rate limit / quota, policy / unauthorized,
/// model / llm, tool, otherwise unknown.
pub fn classify_message(message: &str) -> FailureType {
    let msg = message.to_lowercase();
    if msg.contains("timeout") {
        FailureType::Timeout
    } else if msg.contains("rate limit") || msg.contains("quota") {
        FailureType::ResourceExhaustion
    } else if msg.contains("policy") || msg.contains("unauthorized") {
        FailureType::PolicyViolation
    } else if msg.contains("model") || msg.contains("llm") {
        FailureType::ModelError
    } else if msg.contains("tool") {
        FailureType::ToolError
    } else {
        FailureType::Unknown
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(format!("YAML: {}", e))
    }
}
