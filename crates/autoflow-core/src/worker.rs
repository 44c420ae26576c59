//! AgentWorker - runs one workflow step on behalf of an agent.
//!
//! Reason through the fabric, pick tools from the agent's grant, re-check
//! each tool against the live agent record, run them, and score the result.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::agents::AgentManager;
use crate::error::{EngineError, Result};
use crate::intelligence::IntelligenceFabric;
use crate::models::agent::{Agent, AgentStatus};
use crate::models::llm::{LlmConfig, LlmResponse};
use crate::models::task::{Task, TaskResult};
use crate::models::workflow::WorkflowStep;
use crate::tools::{builtin_tools, validate_params, Tool, ToolRateLimiter, ToolResult, ToolRunner};

/// Maximum tools a worker runs for one step.
pub const MAX_TOOLS_PER_STEP: usize = 3;
/// Confidence multiplier applied when any tool failed.
pub const TOOL_FAILURE_DISCOUNT: f64 = 0.8;

/// Per-attempt parameters the orchestrator hands to a runner.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub workflow_id: String,
    /// 1-based attempt number within the local retry loop.
    pub attempt: u32,
    /// Positions to skip in the ranked provider list (set by `llm_swap`).
    pub provider_offset: usize,
}

/// Executes a single step for an agent.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: &WorkflowStep, agent: &Agent, ctx: &StepContext) -> Result<TaskResult>;
}

pub struct AgentWorker {
    fabric: IntelligenceFabric,
    agents: AgentManager,
    tool_runner: Arc<dyn ToolRunner>,
    catalog: Vec<Tool>,
    limiter: ToolRateLimiter,
    llm_config: LlmConfig,
}

impl AgentWorker {
    pub fn new(fabric: IntelligenceFabric, agents: AgentManager, tool_runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            fabric,
            agents,
            tool_runner,
            catalog: builtin_tools(),
            limiter: ToolRateLimiter::default(),
            llm_config: LlmConfig::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<Tool>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: ToolRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Validate parameters and spend rate budget, then run the tool.
    async fn invoke(&self, tool: &Tool, params: serde_json::Value, agent: &Agent) -> Result<ToolResult> {
        let problems = validate_params(tool, &params);
        if !problems.is_empty() {
            return Err(EngineError::Tool(format!(
                "{}: invalid parameters: {}",
                tool.name,
                problems.join("; ")
            )));
        }
        if !self.limiter.try_acquire(tool).await {
            return Err(EngineError::RateLimited(format!(
                "tool {} exceeded {} calls per minute",
                tool.name, tool.rate_limit
            )));
        }
        self.tool_runner.execute(tool, params, agent).await
    }

    fn build_task(&self, step: &WorkflowStep, agent: &Agent, ctx: &StepContext) -> Task {
        let description = if step.description.is_empty() {
            format!("Achieve goal {}", step.goal_id)
        } else {
            step.description.clone()
        };
        let context = serde_json::json!({
            "workflow_id": ctx.workflow_id,
            "step_id": step.id,
            "goal_id": step.goal_id,
            "attempt": ctx.attempt,
        });
        let prompt = format!(
            "Goal: {}\n\nTask: {}\n\nContext: {}\n\nYour capabilities: {}\n\n\
             Think step by step and describe the actions needed to complete this task.",
            agent.goal,
            description,
            context,
            if agent.capabilities.is_empty() {
                "general".to_string()
            } else {
                agent.capabilities.join(", ")
            }
        );
        Task {
            id: format!("{}:{}", ctx.workflow_id, step.id),
            description,
            prompt,
            context,
            critical: step.critical,
        }
    }

    async fn reason(&self, task: &Task, agent: &Agent, ctx: &StepContext) -> Result<LlmResponse> {
        let role = agent.role_for("planning");
        if task.critical {
            self.fabric
                .execute_critical_task_from(task, role, &self.llm_config, ctx.provider_offset)
                .await
        } else {
            self.fabric
                .execute_with_fallback_from(task, role, &self.llm_config, ctx.provider_offset)
                .await
        }
    }

    fn select_tools(&self, agent: &Agent) -> Vec<Tool> {
        self.catalog
            .iter()
            .filter(|t| agent.has_tool(&t.name))
            .take(MAX_TOOLS_PER_STEP)
            .cloned()
            .collect()
    }

    async fn work(&self, step: &WorkflowStep, agent: &Agent, ctx: &StepContext) -> Result<TaskResult> {
        let started = Instant::now();
        let task = self.build_task(step, agent, ctx);

        let reasoning = self.reason(&task, agent, ctx).await?;
        let hallucination = self.fabric.detect_hallucination(&reasoning, &task.context);
        if hallucination {
            tracing::warn!(
                "[AgentWorker] Possible hallucination from {} on step {}",
                reasoning.provider.key(),
                step.id
            );
        }

        let mut cost = reasoning.cost;
        let mut tool_reports = Vec::new();
        let mut errors = Vec::new();
        let mut ran = 0usize;
        let mut succeeded = 0usize;

        for tool in self.select_tools(agent) {
            if !self.agents.authorize_tool(&agent.id, &tool).await {
                tracing::warn!(
                    "[AgentWorker] Agent {} not authorized for {}, skipping",
                    agent.id,
                    tool.name
                );
                errors.push(format!("unauthorized tool: {}", tool.name));
                continue;
            }

            let params = serde_json::json!({
                "step_id": step.id,
                "goal_id": step.goal_id,
                "instructions": reasoning.response,
            });
            ran += 1;
            match self.invoke(&tool, params, agent).await {
                Ok(result) if result.success => {
                    succeeded += 1;
                    cost += result.cost;
                    tool_reports.push(serde_json::json!({
                        "tool": tool.name,
                        "success": true,
                        "output": result.output,
                    }));
                }
                Ok(result) => {
                    cost += result.cost;
                    let msg = result.error.unwrap_or_else(|| "tool reported failure".to_string());
                    if tool.required {
                        return Err(EngineError::Tool(format!("{}: {}", tool.name, msg)));
                    }
                    errors.push(format!("{}: {}", tool.name, msg));
                    tool_reports.push(serde_json::json!({"tool": tool.name, "success": false, "error": msg}));
                }
                Err(e) => {
                    if tool.required {
                        return Err(e);
                    }
                    errors.push(format!("{}: {}", tool.name, e));
                    tool_reports.push(serde_json::json!({
                        "tool": tool.name,
                        "success": false,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        let confidence = score_step(reasoning.confidence, ran, succeeded);
        if confidence < agent.confidence_threshold {
            tracing::warn!(
                "[AgentWorker] Step {} confidence {:.2} below threshold {:.2}",
                step.id,
                confidence,
                agent.confidence_threshold
            );
        }

        Ok(TaskResult {
            task_id: step.id.clone(),
            success: true,
            output: serde_json::json!({
                "reasoning": reasoning.response,
                "provider": reasoning.provider.key(),
                "tools": tool_reports,
                "hallucination_suspected": hallucination,
            }),
            confidence,
            cost,
            latency: started.elapsed().as_secs_f64(),
            errors,
        })
    }
}

/// Blend reasoning confidence with tool success, discounted if a tool failed.
pub fn score_step(reasoning_confidence: f64, tools_run: usize, tools_succeeded: usize) -> f64 {
    if tools_run == 0 {
        return reasoning_confidence.clamp(0.0, 1.0);
    }
    let success_rate = tools_succeeded as f64 / tools_run as f64;
    let mut confidence = (reasoning_confidence + success_rate) / 2.0;
    if tools_succeeded < tools_run {
        confidence *= TOOL_FAILURE_DISCOUNT;
    }
    confidence.clamp(0.0, 1.0)
}

#[async_trait]
impl StepRunner for AgentWorker {
    async fn run(&self, step: &WorkflowStep, agent: &Agent, ctx: &StepContext) -> Result<TaskResult> {
        self.agents.set_status(&agent.id, AgentStatus::Working).await?;
        let outcome = self.work(step, agent, ctx).await;
        let status = if outcome.is_ok() {
            AgentStatus::Ready
        } else {
            AgentStatus::Failed
        };
        if let Err(e) = self.agents.set_status(&agent.id, status).await {
            tracing::debug!("[AgentWorker] Status update for {} skipped: {}", agent.id, e);
        }
        outcome
    }
}
