use serde::{Deserialize, Serialize};

/// Failure taxonomy used by the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Transient,
    ModelError,
    ToolError,
    ResourceExhaustion,
    PolicyViolation,
    Timeout,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ModelError => "model_error",
            Self::ToolError => "tool_error",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::PolicyViolation => "policy_violation",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "transient" => Some(Self::Transient),
            "model_error" => Some(Self::ModelError),
            "tool_error" => Some(Self::ToolError),
            "resource_exhaustion" => Some(Self::ResourceExhaustion),
            "policy_violation" => Some(Self::PolicyViolation),
            "timeout" => Some(Self::Timeout),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator does once a step has exhausted its local retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Signal only: the step stays failed, the workflow carries on.
    Retry,
    /// Re-run the step with the next provider in the ranked list.
    LlmSwap,
    /// Replace the agent and re-run the step.
    AgentSwap,
    /// Abort the workflow.
    Escalate,
}

impl RecoveryAction {
    /// Fixed mapping from a classified failure to its recovery action.
    pub fn for_failure(failure_type: FailureType) -> Self {
        match failure_type {
            FailureType::Transient => Self::Retry,
            FailureType::ModelError => Self::LlmSwap,
            FailureType::ToolError => Self::AgentSwap,
            _ => Self::Escalate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::LlmSwap => "llm_swap",
            Self::AgentSwap => "agent_swap",
            Self::Escalate => "escalate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "llm_swap" => Some(Self::LlmSwap),
            "agent_swap" => Some(Self::AgentSwap),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
