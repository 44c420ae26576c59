use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest backoff a retry policy may ask for.
pub const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

/// Bounded local retry policy for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Reject policies whose delays are negative, not finite, or longer than
    /// [`MAX_RETRY_DELAY_SECS`].
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("backoff_multiplier", self.backoff_multiplier),
            ("initial_delay_secs", self.initial_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::InvalidWorkflow(format!(
                    "retry {} must be a finite, non-negative number (got {})",
                    name, value
                )));
            }
        }
        for (name, value) in [
            ("initial_delay_secs", self.initial_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
        ] {
            if value > MAX_RETRY_DELAY_SECS {
                return Err(EngineError::InvalidWorkflow(format!(
                    "retry {} exceeds {}s (got {})",
                    name, MAX_RETRY_DELAY_SECS, value
                )));
            }
        }
        Ok(())
    }

    /// Delay before the next attempt, after `failures` failed attempts so far:
    /// `min(initial * multiplier^failures, max)`. Never exceeds
    /// [`MAX_RETRY_DELAY_SECS`], whatever the policy holds.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let cap = if self.max_delay_secs.is_finite() {
            self.max_delay_secs.clamp(0.0, MAX_RETRY_DELAY_SECS)
        } else {
            MAX_RETRY_DELAY_SECS
        };
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let raw = self.initial_delay_secs * self.backoff_multiplier.powi(exponent);
        // f64::min ignores NaN, so a NaN product falls back to the cap.
        let secs = raw.min(cap).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs_f64(cap))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    #[serde(rename = "type", default = "default_strategy_type")]
    pub strategy_type: String,
    #[serde(default)]
    pub trigger_condition: String,
    #[serde(default)]
    pub alternative_approach: serde_json::Value,
}

fn default_strategy_type() -> String {
    "agent_swap".to_string()
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self {
            strategy_type: default_strategy_type(),
            trigger_condition: String::new(),
            alternative_approach: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub goal_id: String,
    /// Prompt seed handed to the agent.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default = "default_true")]
    pub checkpoint: bool,
    /// Route reasoning through two providers and cross-verify.
    #[serde(default)]
    pub critical: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, goal_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal_id: goal_id.into(),
            description: String::new(),
            required_capabilities: Vec::new(),
            dependencies: Vec::new(),
            retry_config: RetryConfig::default(),
            fallback_strategy: FallbackStrategy::default(),
            checkpoint: true,
            critical: false,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.required_capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: HashMap<String, WorkflowStep>,
    pub execution_order: Vec<Vec<String>>,
    pub state: WorkflowState,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Metadata key listing checkpointed steps that already completed.
pub const COMPLETED_STEPS_KEY: &str = "completed_steps";

impl Workflow {
    /// Build a workflow whose execution order is computed from the steps'
    /// declared dependencies.
    pub fn from_steps(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Result<Self> {
        let execution_order = compute_execution_order(&steps)?;
        let steps = steps.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            steps,
            execution_order,
            state: WorkflowState::Pending,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Checkpointed step ids recorded in metadata.
    pub fn completed_steps(&self) -> HashSet<String> {
        self.metadata
            .get(COMPLETED_STEPS_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mark_step_completed(&mut self, step_id: &str) {
        let mut done: BTreeSet<String> = self.completed_steps().into_iter().collect();
        done.insert(step_id.to_string());
        self.metadata.insert(
            COMPLETED_STEPS_KEY.to_string(),
            serde_json::Value::Array(done.into_iter().map(serde_json::Value::String).collect()),
        );
    }

    /// Check the scheduling invariants: every scheduled id exists, each step is
    /// scheduled exactly once, and dependencies sit in strictly earlier groups.
    pub fn validate(&self) -> Result<()> {
        let mut group_of: HashMap<&str, usize> = HashMap::new();
        for (idx, group) in self.execution_order.iter().enumerate() {
            for step_id in group {
                if !self.steps.contains_key(step_id) {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "execution order references unknown step '{}'",
                        step_id
                    )));
                }
                if group_of.insert(step_id.as_str(), idx).is_some() {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "step '{}' is scheduled more than once",
                        step_id
                    )));
                }
            }
        }

        for (step_id, step) in &self.steps {
            let Some(&idx) = group_of.get(step_id.as_str()) else {
                return Err(EngineError::InvalidWorkflow(format!(
                    "step '{}' is not scheduled",
                    step_id
                )));
            };
            step.retry_config.validate().map_err(|e| match e {
                EngineError::InvalidWorkflow(msg) => {
                    EngineError::InvalidWorkflow(format!("step '{}': {}", step_id, msg))
                }
                other => other,
            })?;
            for dep in &step.dependencies {
                match group_of.get(dep.as_str()) {
                    Some(&dep_idx) if dep_idx < idx => {}
                    Some(_) => {
                        return Err(EngineError::InvalidWorkflow(format!(
                            "step '{}' runs before or alongside its dependency '{}'",
                            step_id, dep
                        )))
                    }
                    None => {
                        return Err(EngineError::InvalidWorkflow(format!(
                            "step '{}' depends on unknown step '{}'",
                            step_id, dep
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Layer steps by dependency (Kahn's algorithm). Each layer becomes one
/// group; ids inside a group are sorted so plans are deterministic.
pub fn compute_execution_order(steps: &[WorkflowStep]) -> Result<Vec<Vec<String>>> {
    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(EngineError::InvalidWorkflow(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    let mut remaining: HashMap<&str, HashSet<&str>> = HashMap::new();
    for step in steps {
        let mut deps = HashSet::new();
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
            deps.insert(dep.as_str());
        }
        remaining.insert(step.id.as_str(), deps);
    }

    let mut order = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<&str> = remaining.keys().copied().collect();
            stuck.sort_unstable();
            return Err(EngineError::InvalidWorkflow(format!(
                "dependency cycle among steps: {}",
                stuck.join(", ")
            )));
        }

        ready.sort_unstable();
        for id in &ready {
            remaining.remove(id);
        }
        for deps in remaining.values_mut() {
            for id in &ready {
                deps.remove(id);
            }
        }
        order.push(ready.into_iter().map(|s| s.to_string()).collect());
    }
    Ok(order)
}
