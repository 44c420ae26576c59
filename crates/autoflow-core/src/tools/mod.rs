//! Tool descriptors, trust-level permissions, and the execution boundary.
//!
//! Tool sandboxes live outside the engine: the worker hands a [`Tool`], its
//! parameters and the calling [`Agent`] to a [`ToolRunner`]. Before that
//! hand-off the engine checks, in order:
//!   1. authorization against the live agent record
//!   2. the parameters against the tool's `parameters_schema`
//!   3. the tool's per-minute call budget ([`ToolRateLimiter`])

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::agent::{Agent, TrustLevel, ALL_TOOLS};

/// Descriptor of an executable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub required_trust: TrustLevel,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// A failure of this tool fails the whole step.
    #[serde(default)]
    pub required: bool,
    /// JSON-schema subset: `required` keys and per-property `type`.
    #[serde(default)]
    pub parameters_schema: serde_json::Value,
    /// Calls allowed per minute across all agents; 0 disables the tool.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    100
}

impl Tool {
    pub fn new(name: &str, description: &str, required_trust: TrustLevel) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required_trust,
            timeout_seconds: default_timeout(),
            required: false,
            parameters_schema: serde_json::Value::Null,
            rate_limit: default_rate_limit(),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameters_schema = schema;
        self
    }

    pub fn with_rate_limit(mut self, calls_per_minute: u32) -> Self {
        self.rate_limit = calls_per_minute;
        self
    }
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cost: f64,
}

impl ToolResult {
    pub fn success(output: impl Serialize) -> Self {
        Self {
            success: true,
            output: Some(serde_json::to_value(output).unwrap_or_default()),
            error: None,
            cost: 0.0,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(msg.into()),
            cost: 0.0,
        }
    }
}

/// Tool names granted to a trust level. Each level extends the one below.
pub fn allowed_tools_for(trust: TrustLevel) -> Vec<String> {
    let names: &[&str] = match trust {
        TrustLevel::Restricted => &["read_file", "list_directory"],
        TrustLevel::Standard => &["read_file", "list_directory", "write_file", "http_request"],
        TrustLevel::Elevated => &[
            "read_file",
            "list_directory",
            "write_file",
            "http_request",
            "execute_command",
        ],
        TrustLevel::Privileged => &[ALL_TOOLS],
    };
    names.iter().map(|n| n.to_string()).collect()
}

/// Whether `grant` (a list possibly containing the wildcard) covers every
/// tool in `other`. Used to compare trust-level grants.
pub fn grant_covers(grant: &[String], other: &[String]) -> bool {
    grant.iter().any(|t| t == ALL_TOOLS) || other.iter().all(|t| grant.contains(t))
}

/// Execution-time permission check: the agent's trust must reach the tool's
/// required level and the tool must be in its grant.
pub fn is_authorized(tool: &Tool, agent: &Agent) -> bool {
    agent.trust_level >= tool.required_trust && agent.has_tool(&tool.name)
}

/// Check `params` against the tool's schema: every `required` key must be
/// present and every typed property must match. Returns one message per
/// problem; empty means valid. A tool without a schema accepts anything.
pub fn validate_params(tool: &Tool, params: &serde_json::Value) -> Vec<String> {
    let schema = &tool.parameters_schema;
    let mut errors = Vec::new();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            if params.get(name).is_none() {
                errors.push(format!("missing required parameter: {}", name));
            }
        }
    }

    let (Some(properties), Some(given)) = (
        schema.get("properties").and_then(|p| p.as_object()),
        params.as_object(),
    ) else {
        return errors;
    };
    for (name, value) in given {
        let Some(expected) = properties
            .get(name)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
        else {
            continue;
        };
        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            errors.push(format!(
                "parameter {} has wrong type: expected {}, got {}",
                name,
                expected,
                json_type(value)
            ));
        }
    }
    errors
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Rate limiting ────────────────────────────────────────────────────────

/// Period a tool's `rate_limit` is counted over.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Per-tool call budgets. A tool may burst up to `rate_limit` calls, then
/// regains one call every `window / rate_limit`. Cloning shares the budgets.
#[derive(Clone)]
pub struct ToolRateLimiter {
    window: Duration,
    limiters: Arc<Mutex<HashMap<String, (u32, Arc<DefaultDirectRateLimiter>)>>>,
}

impl Default for ToolRateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW)
    }
}

impl ToolRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spend one call of `tool`'s budget. False when the budget is used up
    /// or the tool allows no calls at all.
    pub async fn try_acquire(&self, tool: &Tool) -> bool {
        let Some(burst) = NonZeroU32::new(tool.rate_limit) else {
            return false;
        };
        let limiter = {
            let mut limiters = self.limiters.lock().await;
            match limiters.get(&tool.name) {
                Some((limit, limiter)) if *limit == burst.get() => limiter.clone(),
                _ => {
                    let quota = Quota::with_period(self.window / burst.get())
                        .unwrap_or_else(|| Quota::per_second(burst))
                        .allow_burst(burst);
                    let limiter = Arc::new(RateLimiter::direct(quota));
                    limiters.insert(tool.name.clone(), (burst.get(), limiter.clone()));
                    limiter
                }
            }
        };
        limiter.check().is_ok()
    }
}

/// Parameters every built-in tool receives from the worker.
fn instructions_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["instructions"],
        "properties": {
            "instructions": { "type": "string" },
            "step_id": { "type": "string" },
            "goal_id": { "type": "string" },
        },
    })
}

/// The built-in tool catalog the worker chooses from.
pub fn builtin_tools() -> Vec<Tool> {
    vec![
        Tool::new("read_file", "Read a file from the workspace", TrustLevel::Restricted),
        Tool::new("list_directory", "List a workspace directory", TrustLevel::Restricted),
        Tool::new("write_file", "Write a file in the workspace", TrustLevel::Standard),
        Tool::new("http_request", "Issue an outbound HTTP request", TrustLevel::Standard)
            .with_rate_limit(30),
        Tool::new("execute_command", "Run a shell command", TrustLevel::Elevated)
            .with_rate_limit(20),
    ]
    .into_iter()
    .map(|tool| tool.with_schema(instructions_schema()))
    .collect()
}

/// Tool execution collaborator.
///
/// Implementations enforce `tool.timeout_seconds` and report an overrun as
/// [`EngineError::Timeout`].
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn execute(
        &self,
        tool: &Tool,
        params: serde_json::Value,
        agent: &Agent,
    ) -> Result<ToolResult, EngineError>;
}

/// Runner that acknowledges every call without side effects.
#[derive(Debug, Clone, Default)]
pub struct NoopToolRunner;

#[async_trait]
impl ToolRunner for NoopToolRunner {
    async fn execute(
        &self,
        tool: &Tool,
        params: serde_json::Value,
        agent: &Agent,
    ) -> Result<ToolResult, EngineError> {
        tracing::debug!("[ToolRunner] {} for agent {} (noop)", tool.name, agent.id);
        Ok(ToolResult::success(serde_json::json!({
            "tool": tool.name,
            "params": params,
        })))
    }
}
