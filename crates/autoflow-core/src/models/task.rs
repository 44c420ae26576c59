use serde::{Deserialize, Serialize};

use super::workflow::WorkflowState;

/// A unit of work handed to the intelligence fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub critical: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            prompt: prompt.into(),
            context: serde_json::json!({}),
            critical: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    pub confidence: f64,
    pub cost: f64,
    /// Seconds.
    pub latency: f64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, output: serde_json::Value, confidence: f64) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            output,
            confidence,
            cost: 0.0,
            latency: 0.0,
            errors: Vec::new(),
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            output: serde_json::Value::Null,
            confidence: 0.0,
            cost: 0.0,
            latency: 0.0,
            errors: vec![error.into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    pub final_output: serde_json::Value,
    pub total_cost: f64,
    /// Seconds.
    pub total_time: f64,
    pub avg_confidence: f64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub final_state: WorkflowState,
    pub audit_trail_id: String,
}
