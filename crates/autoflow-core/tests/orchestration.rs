//! Scenario tests for the workflow orchestrator.
//!
//! Steps run through a scripted `StepRunner` so each test controls which
//! attempts fail and how; agents, working memory, audit and events are the
//! real in-memory implementations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use autoflow_core::agents::AgentManager;
use autoflow_core::error::{EngineError, Result};
use autoflow_core::events::{EventBus, EventTopic};
use autoflow_core::models::agent::{Agent, TrustLevel};
use autoflow_core::models::task::TaskResult;
use autoflow_core::models::workflow::{RetryConfig, Workflow, WorkflowState, WorkflowStep};
use autoflow_core::orchestration::{OrchestratorConfig, WorkflowOrchestrator};
use autoflow_core::store::{AuditStore, MemoryKvStore, WorkingMemory};
use autoflow_core::worker::{StepContext, StepRunner};

// ─── Scripted runner ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Call {
    step_id: String,
    agent_id: String,
    attempt: u32,
    provider_offset: usize,
    started: Instant,
    finished: Instant,
}

#[derive(Default)]
struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<EngineError>>>,
    always_fail: HashMap<String, fn() -> EngineError>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self::default()
    }

    fn fail_always(mut self, step: &str, err: fn() -> EngineError) -> Self {
        self.always_fail.insert(step.to_string(), err);
        self
    }

    fn fail_times(mut self, step: &str, times: usize, err: fn() -> EngineError) -> Self {
        let queue = self
            .queued
            .get_mut()
            .unwrap()
            .entry(step.to_string())
            .or_default();
        for _ in 0..times {
            queue.push_back(err());
        }
        self
    }

    fn delay(mut self, step: &str, delay: Duration) -> Self {
        self.delays.insert(step.to_string(), delay);
        self
    }

    fn calls_for(&self, step: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_id == step)
            .cloned()
            .collect()
    }

    fn all_calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(&self, step: &WorkflowStep, agent: &Agent, ctx: &StepContext) -> Result<TaskResult> {
        let started = Instant::now();
        if let Some(delay) = self.delays.get(&step.id) {
            tokio::time::sleep(*delay).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&step.id)
            .and_then(|q| q.pop_front());
        let outcome = match (queued, self.always_fail.get(&step.id)) {
            (Some(err), _) => Err(err),
            (None, Some(make)) => Err(make()),
            (None, None) => {
                let mut result = TaskResult::success(
                    step.id.clone(),
                    serde_json::json!({ "step": step.id }),
                    0.9,
                );
                result.cost = 0.01;
                Ok(result)
            }
        };

        self.calls.lock().unwrap().push(Call {
            step_id: step.id.clone(),
            agent_id: agent.id.clone(),
            attempt: ctx.attempt,
            provider_offset: ctx.provider_offset,
            started,
            finished: Instant::now(),
        });
        outcome
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    orchestrator: WorkflowOrchestrator,
    agents: AgentManager,
    audit: AuditStore,
    bus: EventBus,
}

fn harness(runner: Arc<ScriptedRunner>, max_agents: usize) -> Harness {
    let memory = WorkingMemory::new(
        Arc::new(MemoryKvStore::new()),
        Duration::from_secs(60),
        Duration::from_secs(600),
    );
    let bus = EventBus::new();
    let audit = AuditStore::open_in_memory().expect("in-memory audit store");
    let agents = AgentManager::new(memory.clone(), bus.clone(), max_agents);
    let orchestrator = WorkflowOrchestrator::new(
        OrchestratorConfig {
            default_trust_level: TrustLevel::Standard,
            pause_poll_interval: Duration::from_millis(10),
        },
        agents.clone(),
        runner,
        memory,
        audit.clone(),
        bus.clone(),
    );
    Harness {
        orchestrator,
        agents,
        audit,
        bus,
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_multiplier: 1.0,
        initial_delay_secs: 0.001,
        max_delay_secs: 0.005,
    }
}

fn step(id: &str, deps: &[&str]) -> WorkflowStep {
    WorkflowStep::new(id, format!("goal-{}", id))
        .with_dependencies(deps)
        .with_retry(fast_retry(3))
}

fn linear() -> Workflow {
    Workflow::from_steps(
        "linear",
        vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
    )
    .unwrap()
}

async fn wait_for_event(bus: &EventBus, sub: &str) {
    for _ in 0..500 {
        if !bus.drain(sub).await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("event never published");
}

// ─── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_linear_workflow_completes() {
    let runner = Arc::new(ScriptedRunner::new());
    let h = harness(runner.clone(), 10);
    let sub = h.bus.subscribe("workflow.*").await;
    let wf = linear();
    let id = wf.id.clone();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.final_state, WorkflowState::Completed);
    assert_eq!(result.steps_completed, 3);
    assert_eq!(result.steps_failed, 0);
    assert!((result.total_cost - 0.03).abs() < 1e-9);
    assert!((result.avg_confidence - 0.9).abs() < 1e-9);
    assert_eq!(result.audit_trail_id, id);
    assert_eq!(result.final_output["b"]["step"], "b");

    let order: Vec<String> = runner.all_calls().into_iter().map(|c| c.step_id).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(h.agents.active_agent_count().await, 0);

    let record = h.audit.get_workflow_record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowState::Completed);
    let trail = h.audit.get_audit_trail(&id).await.unwrap();
    assert_eq!(trail.last().unwrap().event_type, "workflow_completed");

    let topics: Vec<EventTopic> = h.bus.drain(&sub).await.into_iter().map(|e| e.topic).collect();
    assert_eq!(topics.first(), Some(&EventTopic::WorkflowStarted));
    assert_eq!(topics.last(), Some(&EventTopic::WorkflowCompleted));
    assert_eq!(
        topics.iter().filter(|t| **t == EventTopic::StepCompleted).count(),
        3
    );
}

#[tokio::test]
async fn test_model_timeout_escalates_and_fails_workflow() {
    let runner = Arc::new(
        ScriptedRunner::new().fail_always("b", || EngineError::Step("model timeout".into())),
    );
    let h = harness(runner.clone(), 10);
    let sub = h.bus.subscribe("workflow.recovery_triggered").await;
    let wf = linear();
    let id = wf.id.clone();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.final_state, WorkflowState::Failed);
    assert_eq!(result.steps_failed, 1);
    assert_eq!(result.steps_completed, 1);

    let attempts: Vec<u32> = runner.calls_for("b").iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(runner.calls_for("c").is_empty());

    let trail = h.audit.get_audit_trail(&id).await.unwrap();
    let failure = trail
        .iter()
        .find(|e| e.event_type == "step_failure")
        .expect("step failure audited");
    assert_eq!(failure.step_id.as_deref(), Some("b"));
    assert_eq!(failure.details["failure_type"], "timeout");
    assert_eq!(failure.details["recovery_action"], "escalate");
    assert_eq!(trail.last().unwrap().event_type, "workflow_failed");
    assert_eq!(trail.last().unwrap().details["error"], "model timeout");

    let recoveries = h.bus.drain(&sub).await;
    assert_eq!(recoveries.len(), 1);
    assert_eq!(recoveries[0].payload["action"], "escalate");

    let snapshot = h.orchestrator.restore_state(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, WorkflowState::Failed);
    assert_eq!(snapshot.completed_steps(), HashSet::from(["a".to_string()]));
    assert_eq!(h.agents.active_agent_count().await, 0);
}

/// Largest number of call intervals that overlap at any instant.
fn peak_overlap(calls: &[Call]) -> usize {
    calls
        .iter()
        .map(|c| {
            calls
                .iter()
                .filter(|o| o.started <= c.started && c.started < o.finished)
                .count()
        })
        .max()
        .unwrap_or(0)
}

#[tokio::test]
async fn test_group_wider_than_ceiling_runs_in_waves() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .delay("x", Duration::from_millis(30))
            .delay("y", Duration::from_millis(30)),
    );
    let h = harness(runner.clone(), 1);
    let wf = Workflow::from_steps("wide", vec![step("x", &[]), step("y", &[])]).unwrap();
    let id = wf.id.clone();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.final_state, WorkflowState::Completed);
    assert_eq!(result.steps_completed, 2);
    assert_eq!(result.steps_failed, 0);

    let calls = runner.all_calls();
    assert_eq!(calls.len(), 2);
    let (first, second) = if calls[0].started <= calls[1].started {
        (&calls[0], &calls[1])
    } else {
        (&calls[1], &calls[0])
    };
    assert!(second.started >= first.finished, "steps overlapped under ceiling 1");

    let trail = h.audit.get_audit_trail(&id).await.unwrap();
    assert!(trail.iter().all(|e| e.event_type != "step_failure"));
    assert_eq!(h.agents.active_agent_count().await, 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_ceiling() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .delay("a", Duration::from_millis(25))
            .delay("b", Duration::from_millis(25))
            .delay("c", Duration::from_millis(25))
            .delay("d", Duration::from_millis(25))
            .delay("e", Duration::from_millis(25)),
    );
    let h = harness(runner.clone(), 2);
    let wf = Workflow::from_steps(
        "fan-out",
        vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &[]),
            step("d", &[]),
            step("e", &[]),
        ],
    )
    .unwrap();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.steps_completed, 5);
    let calls = runner.all_calls();
    assert_eq!(calls.len(), 5);
    let peak = peak_overlap(&calls);
    assert!(peak <= 2, "{} steps ran at once under ceiling 2", peak);
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn test_capacity_taken_elsewhere_escalates() {
    let runner = Arc::new(ScriptedRunner::new());
    let h = harness(runner.clone(), 1);
    // The only slot is held by an agent spawned outside the orchestrator.
    let outsider = h
        .agents
        .spawn_agent(vec![], TrustLevel::Standard, "outside work", None)
        .await
        .unwrap();
    let wf = single(1);
    let id = wf.id.clone();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Failed);
    assert_eq!(result.steps_failed, 1);
    assert!(runner.all_calls().is_empty());

    let trail = h.audit.get_audit_trail(&id).await.unwrap();
    let failure = trail.iter().find(|e| e.event_type == "step_failure").unwrap();
    assert_eq!(failure.details["failure_type"], "resource_exhaustion");
    assert_eq!(failure.details["recovery_action"], "escalate");
    assert!(failure.details["agent_id"].is_null());
    assert_eq!(h.agents.active_agent_count().await, 1);
    assert!(h.agents.get_agent(&outsider.id).await.is_some());
}

#[tokio::test]
async fn test_groups_respect_dependencies() {
    let d = Duration::from_millis(15);
    let runner = Arc::new(
        ScriptedRunner::new()
            .delay("a", d)
            .delay("b", d)
            .delay("c", d)
            .delay("d", d),
    );
    let h = harness(runner.clone(), 10);
    let wf = Workflow::from_steps(
        "diamond",
        vec![
            step("d", &["b", "c"]),
            step("c", &["a"]),
            step("b", &["a"]),
            step("a", &[]),
        ],
    )
    .unwrap();
    let deps: HashMap<String, Vec<String>> = wf
        .steps
        .values()
        .map(|s| (s.id.clone(), s.dependencies.clone()))
        .collect();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();
    assert!(result.success);

    let calls = runner.all_calls();
    assert_eq!(calls.len(), 4);
    let by_id: HashMap<&str, &Call> = calls.iter().map(|c| (c.step_id.as_str(), c)).collect();
    for call in &calls {
        for dep in &deps[&call.step_id] {
            assert!(
                call.started >= by_id[dep.as_str()].finished,
                "{} started before {} finished",
                call.step_id,
                dep
            );
        }
    }

    // b and c share a group and must be in flight together.
    let (b, c) = (by_id["b"], by_id["c"]);
    assert!(b.started < c.finished && c.started < b.finished, "b and c did not overlap");
}

#[tokio::test]
async fn test_transient_failure_does_not_stop_workflow() {
    let runner = Arc::new(
        ScriptedRunner::new().fail_always("b", || EngineError::Transient("connection reset".into())),
    );
    let h = harness(runner.clone(), 10);

    let result = h.orchestrator.execute_workflow(linear()).await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Completed);
    assert_eq!(result.steps_completed, 2);
    assert_eq!(result.steps_failed, 1);
    assert_eq!(runner.calls_for("b").len(), 3);
    assert_eq!(runner.calls_for("c").len(), 1);
}

#[tokio::test]
async fn test_local_retry_recovers_without_ladder() {
    let runner = Arc::new(
        ScriptedRunner::new().fail_times("b", 2, || EngineError::Step("model timeout".into())),
    );
    let h = harness(runner.clone(), 10);
    let sub = h.bus.subscribe("workflow.recovery_triggered").await;

    let result = h.orchestrator.execute_workflow(linear()).await.unwrap();

    assert!(result.success);
    assert_eq!(runner.calls_for("b").len(), 3);
    assert!(h.bus.drain(&sub).await.is_empty());
}

// ─── Recovery ladder ──────────────────────────────────────────────────────

fn single(retry_attempts: u32) -> Workflow {
    Workflow::from_steps(
        "single",
        vec![WorkflowStep::new("s", "goal-s").with_retry(fast_retry(retry_attempts))],
    )
    .unwrap()
}

#[tokio::test]
async fn test_llm_swap_reruns_with_next_provider() {
    let runner = Arc::new(ScriptedRunner::new().fail_times("s", 1, || {
        EngineError::Step("llm returned malformed output".into())
    }));
    let h = harness(runner.clone(), 10);

    let result = h.orchestrator.execute_workflow(single(1)).await.unwrap();

    assert!(result.success);
    let calls = runner.calls_for("s");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].provider_offset, 0);
    assert_eq!(calls[1].provider_offset, 1);
    assert_eq!(calls[0].agent_id, calls[1].agent_id);
}

#[tokio::test]
async fn test_repeated_llm_swap_escalates() {
    let runner = Arc::new(
        ScriptedRunner::new().fail_always("s", || EngineError::Step("model refused".into())),
    );
    let h = harness(runner.clone(), 10);
    let wf = single(1);
    let id = wf.id.clone();

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Failed);
    assert_eq!(runner.calls_for("s").len(), 2);
    let trail = h.audit.get_audit_trail(&id).await.unwrap();
    let actions: Vec<String> = trail
        .iter()
        .filter(|e| e.event_type == "step_failure")
        .map(|e| e.details["recovery_action"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(actions, vec!["llm_swap", "llm_swap"]);
    assert!(trail.iter().any(|e| e.event_type == "recovery_exhausted"));
}

#[tokio::test]
async fn test_agent_swap_replaces_agent() {
    let runner = Arc::new(
        ScriptedRunner::new().fail_times("s", 1, || EngineError::Tool("tool crashed".into())),
    );
    let h = harness(runner.clone(), 10);
    let sub = h.bus.subscribe("agent.replaced").await;

    let result = h.orchestrator.execute_workflow(single(1)).await.unwrap();

    assert!(result.success);
    let calls = runner.calls_for("s");
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].agent_id, calls[1].agent_id);

    let replaced = h.bus.drain(&sub).await;
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].payload["old_agent_id"], calls[0].agent_id.as_str());
    assert_eq!(replaced[0].payload["new_agent_id"], calls[1].agent_id.as_str());
    assert_eq!(h.agents.active_agent_count().await, 0);
}

// ─── Control & persistence ────────────────────────────────────────────────

#[tokio::test]
async fn test_pause_blocks_next_group_until_resume() {
    let runner = Arc::new(ScriptedRunner::new().delay("a", Duration::from_millis(60)));
    let h = harness(runner.clone(), 10);
    let started = h.bus.subscribe("workflow.step_started").await;
    let wf = Workflow::from_steps("two", vec![step("a", &[]), step("b", &["a"])]).unwrap();
    let id = wf.id.clone();

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.execute_workflow(wf).await });

    wait_for_event(&h.bus, &started).await;
    assert!(h.orchestrator.pause_workflow(&id).await.unwrap());
    assert!(!h.orchestrator.pause_workflow(&id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runner.calls_for("a").len(), 1);
    assert!(runner.calls_for("b").is_empty());
    let paused = h.orchestrator.restore_state(&id).await.unwrap().unwrap();
    assert_eq!(paused.state, WorkflowState::Paused);
    assert!(paused.completed_steps().contains("a"));

    assert!(h.orchestrator.resume_workflow(&id).await.unwrap());
    assert!(!h.orchestrator.resume_workflow(&id).await.unwrap());

    let result = run.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.steps_completed, 2);
    assert_eq!(runner.calls_for("b").len(), 1);
}

#[tokio::test]
async fn test_cancel_stops_dispatch() {
    let runner = Arc::new(ScriptedRunner::new().delay("a", Duration::from_millis(50)));
    let h = harness(runner.clone(), 10);
    let started = h.bus.subscribe("workflow.step_started").await;
    let wf = linear();
    let id = wf.id.clone();

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.execute_workflow(wf).await });

    wait_for_event(&h.bus, &started).await;
    assert!(h.orchestrator.cancel_workflow(&id).await.unwrap());

    let result = run.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.final_state, WorkflowState::Cancelled);
    assert_eq!(result.steps_completed, 1);
    assert!(runner.calls_for("b").is_empty());

    assert!(!h.orchestrator.cancel_workflow(&id).await.unwrap());
    let record = h.audit.get_workflow_record(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WorkflowState::Cancelled);
}

#[tokio::test]
async fn test_control_calls_on_unknown_workflow() {
    let h = harness(Arc::new(ScriptedRunner::new()), 10);
    assert!(!h.orchestrator.pause_workflow("nope").await.unwrap());
    assert!(!h.orchestrator.resume_workflow("nope").await.unwrap());
    assert!(!h.orchestrator.cancel_workflow("nope").await.unwrap());
    assert!(h.orchestrator.restore_state("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_completed_steps() {
    let runner = Arc::new(ScriptedRunner::new());
    let h = harness(runner.clone(), 10);
    let mut wf = linear();
    wf.mark_step_completed("a");
    wf.state = WorkflowState::Running;

    let result = h.orchestrator.execute_workflow(wf).await.unwrap();

    assert!(result.success);
    assert_eq!(result.steps_completed, 3);
    assert!(runner.calls_for("a").is_empty());
    assert_eq!(runner.calls_for("b").len(), 1);
    assert_eq!(runner.calls_for("c").len(), 1);
}

#[tokio::test]
async fn test_persist_and_restore_round_trip() {
    let h = harness(Arc::new(ScriptedRunner::new()), 10);
    let mut wf = linear();
    wf.mark_step_completed("a");

    h.orchestrator.persist_state(&wf).await.unwrap();
    let restored = h.orchestrator.restore_state(&wf.id).await.unwrap().unwrap();

    assert_eq!(restored.id, wf.id);
    assert_eq!(restored.name, "linear");
    assert_eq!(restored.state, WorkflowState::Pending);
    assert_eq!(restored.execution_order, wf.execution_order);
    assert_eq!(restored.steps["c"].dependencies, vec!["b"]);
    assert!(restored.completed_steps().contains("a"));
}

#[tokio::test]
async fn test_terminal_workflow_is_rejected() {
    let h = harness(Arc::new(ScriptedRunner::new()), 10);
    let mut wf = linear();
    wf.state = WorkflowState::Completed;

    let err = h.orchestrator.execute_workflow(wf).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
}
