//! YAML schema types for workflow definitions.
//!
//! ```yaml
//! name: "Release Notes"
//! description: "Collect merged changes and draft notes"
//!
//! metadata:
//!   owner: docs-team
//!
//! steps:
//!   - id: collect
//!     description: "List merged pull requests since the last tag"
//!     capabilities: [search]
//!
//!   - id: draft
//!     goal: write-notes
//!     depends_on: [collect]
//!     critical: true
//!     retry:
//!       max_attempts: 2
//!       initial_delay_secs: 0.5
//!
//!   - id: review
//!     depends_on: [draft]
//!     fallback:
//!       type: llm_swap
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::resolve_env_vars;
use crate::error::{EngineError, Result};
use crate::models::workflow::{FallbackStrategy, RetryConfig, Workflow, WorkflowStep};

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Free-form values copied into the workflow's metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A single step as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow; referenced by `depends_on`
    pub id: String,

    /// Goal identifier; defaults to the step id
    #[serde(default)]
    pub goal: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fallback: FallbackStrategy,

    /// Record completion so a resumed run skips this step
    #[serde(default = "default_checkpoint")]
    pub checkpoint: bool,

    /// Reason with two providers and cross-verify
    #[serde(default)]
    pub critical: bool,
}

fn default_checkpoint() -> bool {
    true
}

impl StepDefinition {
    fn into_step(self) -> WorkflowStep {
        let goal = self.goal.unwrap_or_else(|| self.id.clone());
        WorkflowStep {
            id: self.id,
            goal_id: goal,
            description: self.description,
            required_capabilities: self.capabilities,
            dependencies: self.depends_on,
            retry_config: self.retry,
            fallback_strategy: self.fallback,
            checkpoint: self.checkpoint,
            critical: self.critical,
        }
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string. `${VAR}` and
    /// `${VAR:-default}` references are expanded first.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let expanded = resolve_env_vars(yaml);
        let def: Self = serde_yaml::from_str(&expanded).map_err(|e| {
            EngineError::InvalidWorkflow(format!("Failed to parse workflow YAML: {}", e))
        })?;
        if def.steps.is_empty() {
            return Err(EngineError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                def.name
            )));
        }
        Ok(def)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Build a `PENDING` workflow with its layered execution order.
    pub fn into_workflow(self) -> Result<Workflow> {
        let steps = self.steps.into_iter().map(StepDefinition::into_step).collect();
        let mut workflow = Workflow::from_steps(self.name, steps)?;
        workflow.metadata.extend(self.metadata);
        if let Some(description) = self.description {
            workflow
                .metadata
                .insert("description".to_string(), serde_json::Value::String(description));
        }
        workflow
            .metadata
            .insert("version".to_string(), serde_json::Value::String(self.version));
        workflow.validate()?;
        Ok(workflow)
    }
}
