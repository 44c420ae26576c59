//! WorkflowOrchestrator - drives a workflow through its step groups.
//!
//! For every group in `execution_order`:
//!   1. Checks the persisted snapshot for pause / cancel
//!   2. Spawns one agent per step and runs the steps concurrently, at most
//!      `max_concurrent_agents` at a time; the rest wait for a free slot
//!   3. Retries each step locally with backoff, then classifies the failure
//!   4. Walks the recovery ladder (llm_swap, agent_swap) before escalating
//!   5. Retires the agent and checkpoints completed steps
//!
//! The persisted snapshot is the source of truth for control state, so an
//! orchestrator can pause, resume or cancel a run it is not driving, and a
//! fresh process can resume a run from its last snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::agents::{AgentManager, RetireReason};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventTopic};
use crate::models::agent::{Agent, FailureRecord, TrustLevel};
use crate::models::failure::RecoveryAction;
use crate::models::task::{TaskResult, WorkflowResult};
use crate::models::workflow::{Workflow, WorkflowState, WorkflowStep};
use crate::store::{AuditEntry, AuditStore, WorkingMemory};
use crate::worker::{StepContext, StepRunner};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Trust level for step agents
    pub default_trust_level: TrustLevel,
    /// How often a paused run re-reads its snapshot
    pub pause_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_trust_level: TrustLevel::Standard,
            pause_poll_interval: Duration::from_millis(200),
        }
    }
}

// ─── Snapshot ─────────────────────────────────────────────────────────────

/// Serialized form of a workflow in the fast store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    #[serde(default)]
    pub name: String,
    pub state: WorkflowState,
    pub steps: HashMap<String, WorkflowStep>,
    pub execution_order: Vec<Vec<String>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl From<&Workflow> for WorkflowSnapshot {
    fn from(wf: &Workflow) -> Self {
        Self {
            workflow_id: wf.id.clone(),
            name: wf.name.clone(),
            state: wf.state,
            steps: wf.steps.clone(),
            execution_order: wf.execution_order.clone(),
            metadata: wf.metadata.clone(),
            created_at: wf.created_at,
            timestamp: Utc::now(),
        }
    }
}

impl From<WorkflowSnapshot> for Workflow {
    fn from(s: WorkflowSnapshot) -> Self {
        Self {
            id: s.workflow_id,
            name: s.name,
            steps: s.steps,
            execution_order: s.execution_order,
            state: s.state,
            metadata: s.metadata,
            created_at: s.created_at,
        }
    }
}

// ─── Step outcome ─────────────────────────────────────────────────────────

struct StepOutcome {
    step_id: String,
    checkpoint: bool,
    result: Option<TaskResult>,
    error: Option<String>,
    escalate: bool,
}

impl StepOutcome {
    fn failed(step: &WorkflowStep, error: String, escalate: bool) -> Self {
        Self {
            step_id: step.id.clone(),
            checkpoint: step.checkpoint,
            result: None,
            error: Some(error),
            escalate,
        }
    }
}

#[derive(Default)]
struct RunTotals {
    cost: f64,
    confidence_sum: f64,
    scored_steps: usize,
    completed: usize,
    failed: usize,
    outputs: serde_json::Map<String, serde_json::Value>,
    final_error: Option<String>,
}

enum Dispatch {
    Continue,
    Cancelled,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    agents: AgentManager,
    runner: Arc<dyn StepRunner>,
    memory: WorkingMemory,
    audit: AuditStore,
    event_bus: EventBus,
    config: OrchestratorConfig,
    /// One permit per agent slot, shared by every run of this orchestrator.
    slots: Arc<Semaphore>,
}

impl WorkflowOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        agents: AgentManager,
        runner: Arc<dyn StepRunner>,
        memory: WorkingMemory,
        audit: AuditStore,
        event_bus: EventBus,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(agents.max_concurrent_agents().max(1)));
        Self {
            slots,
            agents,
            runner,
            memory,
            audit,
            event_bus,
            config,
        }
    }

    /// Run a workflow to a terminal state.
    ///
    /// Accepts `PENDING` workflows, or `RUNNING` ones restored from a snapshot
    /// after a crash; checkpointed steps of the latter are skipped.
    pub async fn execute_workflow(&self, mut workflow: Workflow) -> Result<WorkflowResult> {
        workflow.validate()?;
        let resuming = match workflow.state {
            WorkflowState::Pending => false,
            WorkflowState::Running => true,
            other => {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot execute workflow {} from state {}",
                    workflow.id, other
                )))
            }
        };

        let started = Instant::now();
        let metadata = serde_json::Value::Object(workflow.metadata.clone());
        if let Err(e) = self
            .audit
            .create_workflow_record(&workflow.id, &workflow.name, &metadata)
            .await
        {
            tracing::warn!("[Orchestrator] Failed to create record for {}: {}", workflow.id, e);
        }

        workflow.state = WorkflowState::Running;
        self.persist_state(&workflow).await?;
        self.record_status(&workflow.id, WorkflowState::Running).await;

        let done = workflow.completed_steps();
        tracing::info!(
            "[Orchestrator] {} workflow {} ({} steps in {} groups, {} already done)",
            if resuming { "Resuming" } else { "Starting" },
            workflow.id,
            workflow.step_count(),
            workflow.execution_order.len(),
            done.len()
        );
        self.event_bus
            .publish(
                EventTopic::WorkflowStarted,
                serde_json::json!({
                    "workflow_id": workflow.id,
                    "name": workflow.name,
                    "steps": workflow.step_count(),
                    "groups": workflow.execution_order.len(),
                    "resumed": resuming,
                }),
            )
            .await;

        let mut totals = RunTotals {
            completed: done.len(),
            ..RunTotals::default()
        };
        let order = workflow.execution_order.clone();

        for (group_idx, group) in order.iter().enumerate() {
            if let Dispatch::Cancelled = self.await_dispatch(&workflow.id).await? {
                return self.finish(workflow, WorkflowState::Cancelled, totals, started).await;
            }

            let pending: Vec<WorkflowStep> = group
                .iter()
                .filter(|id| !done.contains(*id))
                .filter_map(|id| workflow.steps.get(id).cloned())
                .collect();
            if pending.is_empty() {
                continue;
            }

            tracing::info!(
                "[Orchestrator] Dispatching group {}/{} of {}: {}",
                group_idx + 1,
                order.len(),
                workflow.id,
                group.join(", ")
            );

            let mut set = JoinSet::new();
            for step in pending {
                let this = self.clone();
                let workflow_id = workflow.id.clone();
                set.spawn(async move { this.run_step(&workflow_id, step).await });
            }

            let mut escalated = false;
            let mut checkpointed = Vec::new();
            while let Some(joined) = set.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("[Orchestrator] Step task aborted in {}: {}", workflow.id, e);
                        totals.failed += 1;
                        totals.final_error = Some(format!("step task aborted: {}", e));
                        escalated = true;
                        continue;
                    }
                };

                match outcome.result {
                    Some(result) => {
                        totals.completed += 1;
                        totals.cost += result.cost;
                        totals.confidence_sum += result.confidence;
                        totals.scored_steps += 1;
                        totals.outputs.insert(outcome.step_id.clone(), result.output);
                        if outcome.checkpoint {
                            checkpointed.push(outcome.step_id);
                        }
                    }
                    None => {
                        totals.failed += 1;
                        if outcome.escalate {
                            escalated = true;
                            totals.final_error = outcome.error;
                        }
                    }
                }
            }

            if !checkpointed.is_empty() {
                for step_id in &checkpointed {
                    workflow.mark_step_completed(step_id);
                }
                self.sync_control_state(&mut workflow).await;
                self.persist_state(&workflow).await?;
            }

            if escalated {
                return self.finish(workflow, WorkflowState::Failed, totals, started).await;
            }
        }

        if let Dispatch::Cancelled = self.await_dispatch(&workflow.id).await? {
            return self.finish(workflow, WorkflowState::Cancelled, totals, started).await;
        }
        self.finish(workflow, WorkflowState::Completed, totals, started).await
    }

    /// Wait for an agent slot, spawn an agent for the step, run it, and walk
    /// the recovery ladder. The slot is held until the step settles.
    async fn run_step(&self, workflow_id: &str, step: WorkflowStep) -> StepOutcome {
        let _slot = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return self
                    .step_failed(workflow_id, &step, None, e.to_string(), RecoveryAction::Escalate)
                    .await;
            }
        };

        self.event_bus
            .publish(
                EventTopic::StepStarted,
                serde_json::json!({ "workflow_id": workflow_id, "step_id": step.id }),
            )
            .await;

        let goal = if step.description.is_empty() {
            step.goal_id.clone()
        } else {
            step.description.clone()
        };
        let spawned = self
            .agents
            .spawn_agent(
                step.required_capabilities.clone(),
                self.config.default_trust_level,
                &goal,
                Some(workflow_id),
            )
            .await;
        let mut agent = match spawned {
            Ok(agent) => agent,
            Err(e) => {
                let action = self.handle_failure(workflow_id, &step, &e, None).await;
                return self
                    .step_failed(workflow_id, &step, None, e.to_string(), action)
                    .await;
            }
        };

        let mut ctx = StepContext {
            workflow_id: workflow_id.to_string(),
            attempt: 0,
            provider_offset: 0,
        };
        let mut llm_swapped = false;
        let mut agent_swapped = false;

        loop {
            let error = match self.execute_step(&step, &agent, &ctx).await {
                Ok(result) if result.success => {
                    self.agents.retire_agent(&agent.id, RetireReason::Completed).await;
                    tracing::info!(
                        "[Orchestrator] Step {} completed (confidence {:.2})",
                        step.id,
                        result.confidence
                    );
                    self.event_bus
                        .publish(
                            EventTopic::StepCompleted,
                            serde_json::json!({
                                "workflow_id": workflow_id,
                                "step_id": step.id,
                                "confidence": result.confidence,
                                "cost": result.cost,
                            }),
                        )
                        .await;
                    return StepOutcome {
                        step_id: step.id.clone(),
                        checkpoint: step.checkpoint,
                        result: Some(result),
                        error: None,
                        escalate: false,
                    };
                }
                Ok(result) => EngineError::Step(
                    result
                        .errors
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "step reported failure".to_string()),
                ),
                Err(e) => e,
            };

            let action = self
                .handle_failure(workflow_id, &step, &error, Some(&agent.id))
                .await;

            match action {
                RecoveryAction::LlmSwap if !llm_swapped => {
                    llm_swapped = true;
                    ctx.provider_offset += 1;
                    tracing::info!(
                        "[Orchestrator] Step {}: retrying with next-ranked provider",
                        step.id
                    );
                }
                RecoveryAction::AgentSwap if !agent_swapped => {
                    agent_swapped = true;
                    match self.agents.replace_agent(&agent.id, &error.to_string()).await {
                        Ok(replacement) => {
                            tracing::info!(
                                "[Orchestrator] Step {}: agent {} replaced by {}",
                                step.id,
                                agent.id,
                                replacement.id
                            );
                            agent = replacement;
                        }
                        Err(e) => {
                            tracing::error!(
                                "[Orchestrator] Step {}: agent replacement failed: {}",
                                step.id,
                                e
                            );
                            return self
                                .step_failed(workflow_id, &step, None, e.to_string(), RecoveryAction::Escalate)
                                .await;
                        }
                    }
                }
                RecoveryAction::Retry => {
                    return self
                        .step_failed(workflow_id, &step, Some(&agent), error.to_string(), action)
                        .await;
                }
                _ => {
                    if action != RecoveryAction::Escalate {
                        tracing::warn!(
                            "[Orchestrator] Step {}: {} already used, escalating",
                            step.id,
                            action
                        );
                        self.audit
                            .append_safe(AuditEntry::new(
                                workflow_id,
                                "recovery_exhausted",
                                Some(step.id.as_str()),
                                serde_json::json!({ "repeated_action": action, "error": error.to_string() }),
                            ))
                            .await;
                    }
                    return self
                        .step_failed(
                            workflow_id,
                            &step,
                            Some(&agent),
                            error.to_string(),
                            RecoveryAction::Escalate,
                        )
                        .await;
                }
            }
        }
    }

    async fn step_failed(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        agent: Option<&Agent>,
        error: String,
        action: RecoveryAction,
    ) -> StepOutcome {
        if let Some(agent) = agent {
            self.agents.retire_agent(&agent.id, RetireReason::Failed).await;
        }
        tracing::error!("[Orchestrator] Step {} failed ({}): {}", step.id, action, error);
        self.event_bus
            .publish(
                EventTopic::StepFailed,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "step_id": step.id,
                    "error": error,
                    "recovery_action": action,
                }),
            )
            .await;
        StepOutcome::failed(step, error, action == RecoveryAction::Escalate)
    }

    /// Run one step with its bounded local retry policy. The last error is
    /// returned once `max_attempts` is exhausted.
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        agent: &Agent,
        ctx: &StepContext,
    ) -> Result<TaskResult> {
        let max_attempts = step.retry_config.max_attempts.max(1);
        let mut failures = 0u32;
        loop {
            let attempt_ctx = StepContext {
                attempt: failures + 1,
                ..ctx.clone()
            };
            match self.runner.run(step, agent, &attempt_ctx).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    failures += 1;
                    if failures >= max_attempts {
                        tracing::warn!(
                            "[Orchestrator] Step {} exhausted {} attempts: {}",
                            step.id,
                            max_attempts,
                            e
                        );
                        return Err(e);
                    }
                    let delay = step.retry_config.delay_for(failures);
                    tracing::warn!(
                        "[Orchestrator] Step {} attempt {}/{} failed: {} (retrying in {:?})",
                        step.id,
                        failures,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Classify a failure, record it, and pick the recovery action.
    pub async fn handle_failure(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        error: &EngineError,
        agent_id: Option<&str>,
    ) -> RecoveryAction {
        let failure_type = error.failure_type();
        let action = RecoveryAction::for_failure(failure_type);
        tracing::warn!(
            "[Orchestrator] Step {} failure classified {} -> {}",
            step.id,
            failure_type,
            action
        );

        if let Some(agent_id) = agent_id {
            let record = FailureRecord::new(
                failure_type,
                error.to_string(),
                serde_json::json!({ "workflow_id": workflow_id, "step_id": step.id }),
                action,
            );
            if let Err(e) = self.agents.record_failure(agent_id, record).await {
                tracing::debug!("[Orchestrator] Could not record failure on {}: {}", agent_id, e);
            }
        }

        self.event_bus
            .publish(
                EventTopic::RecoveryTriggered,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "step_id": step.id,
                    "failure_type": failure_type,
                    "action": action,
                    "error": error.to_string(),
                }),
            )
            .await;
        self.audit
            .append_safe(AuditEntry::new(
                workflow_id,
                "step_failure",
                Some(step.id.as_str()),
                serde_json::json!({
                    "error": error.to_string(),
                    "failure_type": failure_type,
                    "recovery_action": action,
                    "agent_id": agent_id,
                }),
            ))
            .await;
        action
    }

    async fn finish(
        &self,
        mut workflow: Workflow,
        state: WorkflowState,
        totals: RunTotals,
        started: Instant,
    ) -> Result<WorkflowResult> {
        workflow.state = state;
        self.persist_state(&workflow).await?;
        self.record_status(&workflow.id, state).await;

        let avg_confidence = if totals.scored_steps > 0 {
            totals.confidence_sum / totals.scored_steps as f64
        } else {
            0.0
        };
        let result = WorkflowResult {
            workflow_id: workflow.id.clone(),
            success: state == WorkflowState::Completed,
            final_output: serde_json::Value::Object(totals.outputs),
            total_cost: totals.cost,
            total_time: started.elapsed().as_secs_f64(),
            avg_confidence,
            steps_completed: totals.completed,
            steps_failed: totals.failed,
            final_state: state,
            audit_trail_id: workflow.id.clone(),
        };

        let (topic, event_type) = match state {
            WorkflowState::Completed => (EventTopic::WorkflowCompleted, "workflow_completed"),
            WorkflowState::Cancelled => (EventTopic::WorkflowCancelled, "workflow_cancelled"),
            _ => (EventTopic::WorkflowFailed, "workflow_failed"),
        };
        let summary = serde_json::json!({
            "workflow_id": result.workflow_id,
            "steps_completed": result.steps_completed,
            "steps_failed": result.steps_failed,
            "total_cost": result.total_cost,
            "total_time": result.total_time,
            "avg_confidence": result.avg_confidence,
            "error": totals.final_error,
        });
        self.audit
            .append_safe(AuditEntry::new(&workflow.id, event_type, None, summary.clone()))
            .await;
        self.event_bus.publish(topic, summary).await;

        match state {
            WorkflowState::Completed => tracing::info!(
                "[Orchestrator] Workflow {} completed: {} steps, cost {:.6}, confidence {:.2}",
                workflow.id,
                result.steps_completed,
                result.total_cost,
                result.avg_confidence
            ),
            _ => tracing::error!(
                "[Orchestrator] Workflow {} ended {}: {} completed, {} failed",
                workflow.id,
                state,
                result.steps_completed,
                result.steps_failed
            ),
        }
        Ok(result)
    }

    /// Block between groups while paused; report cancellation.
    async fn await_dispatch(&self, workflow_id: &str) -> Result<Dispatch> {
        loop {
            let state = self.restore_state(workflow_id).await?.map(|wf| wf.state);
            match state {
                Some(WorkflowState::Cancelled) => {
                    tracing::info!("[Orchestrator] Workflow {} cancelled, stopping dispatch", workflow_id);
                    return Ok(Dispatch::Cancelled);
                }
                Some(WorkflowState::Paused) => {
                    tracing::debug!("[Orchestrator] Workflow {} paused", workflow_id);
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                }
                _ => return Ok(Dispatch::Continue),
            }
        }
    }

    /// Adopt a pause, resume or cancel written by another caller before
    /// overwriting the snapshot.
    async fn sync_control_state(&self, workflow: &mut Workflow) {
        if let Ok(Some(stored)) = self.restore_state(&workflow.id).await {
            if matches!(
                stored.state,
                WorkflowState::Running | WorkflowState::Paused | WorkflowState::Cancelled
            ) {
                workflow.state = stored.state;
            }
        }
    }

    async fn record_status(&self, workflow_id: &str, state: WorkflowState) {
        if let Err(e) = self.audit.update_workflow_status(workflow_id, state).await {
            tracing::warn!(
                "[Orchestrator] Failed to record status {} for {}: {}",
                state,
                workflow_id,
                e
            );
        }
    }

    // ─── Persistence & control ──────────────────────────────────────────

    pub async fn persist_state(&self, workflow: &Workflow) -> Result<()> {
        let snapshot = serde_json::to_value(WorkflowSnapshot::from(workflow))?;
        self.memory
            .store_workflow_snapshot(&workflow.id, snapshot)
            .await?;
        tracing::debug!(
            "[Orchestrator] Persisted {} ({})",
            workflow.id,
            workflow.state
        );
        Ok(())
    }

    pub async fn restore_state(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        match self.memory.workflow_snapshot(workflow_id).await? {
            Some(value) => {
                let snapshot: WorkflowSnapshot = serde_json::from_value(value)?;
                Ok(Some(snapshot.into()))
            }
            None => Ok(None),
        }
    }

    /// `RUNNING -> PAUSED`. Returns false from any other state.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<bool> {
        self.transition(workflow_id, WorkflowState::Running, WorkflowState::Paused, EventTopic::WorkflowPaused)
            .await
    }

    /// `PAUSED -> RUNNING`. Returns false from any other state.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<bool> {
        self.transition(workflow_id, WorkflowState::Paused, WorkflowState::Running, EventTopic::WorkflowResumed)
            .await
    }

    /// Move any non-terminal run to `CANCELLED`. In-flight steps finish;
    /// no further group is dispatched.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<bool> {
        let Some(mut workflow) = self.restore_state(workflow_id).await? else {
            return Ok(false);
        };
        if !workflow.state.can_transition_to(WorkflowState::Cancelled) {
            return Ok(false);
        }
        workflow.state = WorkflowState::Cancelled;
        self.persist_state(&workflow).await?;
        self.record_status(workflow_id, WorkflowState::Cancelled).await;
        self.event_bus
            .publish(
                EventTopic::WorkflowCancelled,
                serde_json::json!({ "workflow_id": workflow_id, "requested": true }),
            )
            .await;
        tracing::info!("[Orchestrator] Cancellation requested for {}", workflow_id);
        Ok(true)
    }

    async fn transition(
        &self,
        workflow_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        topic: EventTopic,
    ) -> Result<bool> {
        let Some(mut workflow) = self.restore_state(workflow_id).await? else {
            return Ok(false);
        };
        if workflow.state != from {
            tracing::debug!(
                "[Orchestrator] Ignoring {} -> {} for {} (state is {})",
                from,
                to,
                workflow_id,
                workflow.state
            );
            return Ok(false);
        }
        workflow.state = to;
        self.persist_state(&workflow).await?;
        self.record_status(workflow_id, to).await;
        self.event_bus
            .publish(topic, serde_json::json!({ "workflow_id": workflow_id }))
            .await;
        tracing::info!("[Orchestrator] Workflow {} {}", workflow_id, to);
        Ok(true)
    }
}
