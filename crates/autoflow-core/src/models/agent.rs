use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::{FailureType, RecoveryAction};
use super::llm::LlmRole;

/// Trust levels, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Restricted,
    Standard,
    Elevated,
    Privileged,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 4] = [
        Self::Restricted,
        Self::Standard,
        Self::Elevated,
        Self::Privileged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Standard => "standard",
            Self::Elevated => "elevated",
            Self::Privileged => "privileged",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "restricted" => Some(Self::Restricted),
            "standard" => Some(Self::Standard),
            "elevated" => Some(Self::Elevated),
            "privileged" => Some(Self::Privileged),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Working,
    Waiting,
    Failed,
    Retired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Failed => "failed",
            Self::Retired => "retired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "working" => Some(Self::Working),
            "waiting" => Some(Self::Waiting),
            "failed" => Some(Self::Failed),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

/// Append-only entry in an agent's failure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub failure_type: FailureType,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub recovery_action: RecoveryAction,
    pub recovered: bool,
}

impl FailureRecord {
    pub fn new(
        failure_type: FailureType,
        message: impl Into<String>,
        context: serde_json::Value,
        recovery_action: RecoveryAction,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            failure_type,
            message: message.into(),
            context,
            recovery_action,
            recovered: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Workflow,
    Session,
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub goal: String,
    pub capabilities: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub trust_level: TrustLevel,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub failure_history: Vec<FailureRecord>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub memory_scope: MemoryScope,
    /// Purpose (`planning`, `execution`, `verification`) to LLM role.
    #[serde(default)]
    pub preferred_llm_roles: HashMap<String, LlmRole>,
}

impl Agent {
    pub fn new(
        id: String,
        goal: String,
        capabilities: Vec<String>,
        allowed_tools: Vec<String>,
        trust_level: TrustLevel,
        workflow_id: Option<String>,
    ) -> Self {
        let memory_scope = if workflow_id.is_some() {
            MemoryScope::Workflow
        } else {
            MemoryScope::Session
        };
        let preferred_llm_roles = HashMap::from([
            ("planning".to_string(), LlmRole::Planner),
            ("execution".to_string(), LlmRole::Executor),
            ("verification".to_string(), LlmRole::Verifier),
        ]);
        Self {
            id,
            goal,
            capabilities,
            allowed_tools,
            trust_level,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            failure_history: Vec::new(),
            status: AgentStatus::Initializing,
            created_at: Utc::now(),
            workflow_id,
            memory_scope,
            preferred_llm_roles,
        }
    }

    /// LLM role for a purpose, planner when unmapped.
    pub fn role_for(&self, purpose: &str) -> LlmRole {
        self.preferred_llm_roles
            .get(purpose)
            .copied()
            .unwrap_or(LlmRole::Planner)
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools
            .iter()
            .any(|t| t == tool_name || t == ALL_TOOLS)
    }
}

/// Wildcard entry granting every tool.
pub const ALL_TOOLS: &str = "all";
