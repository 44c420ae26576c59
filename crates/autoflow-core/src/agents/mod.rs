//! AgentManager - lifecycle of short-lived step agents.
//!
//! The manager owns every live agent in a single id-keyed arena. Callers get
//! cloned snapshots and refer back by id:
//!   1. spawn_agent    - capacity check, trust-derived tool grant, READY
//!   2. retire_agent   - RETIRED, memory cleared, removed (idempotent)
//!   3. replace_agent  - failure recorded, retire + respawn with history
//!   4. get_agent_health - read-only snapshot or a not-found marker

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{classify_message, EngineError, Result};
use crate::events::{EventBus, EventTopic};
use crate::models::agent::{Agent, AgentStatus, FailureRecord, TrustLevel};
use crate::models::failure::RecoveryAction;
use crate::store::WorkingMemory;
use crate::tools::{allowed_tools_for, is_authorized, Tool};

pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 10;

/// Why an agent left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    Completed,
    Failed,
    Replaced,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Replaced => "replaced",
        }
    }
}

/// Health snapshot; serializes to `{"status": "not_found"}` for unknown ids.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AgentHealth {
    Live {
        status: AgentStatus,
        created_at: DateTime<Utc>,
        failure_count: usize,
        memory_size: usize,
        trust_level: TrustLevel,
        confidence_threshold: f64,
    },
    NotFound {
        status: &'static str,
    },
}

impl AgentHealth {
    fn not_found() -> Self {
        Self::NotFound {
            status: "not_found",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Clone)]
pub struct AgentManager {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    memory: WorkingMemory,
    event_bus: EventBus,
    max_concurrent_agents: usize,
}

impl AgentManager {
    pub fn new(memory: WorkingMemory, event_bus: EventBus, max_concurrent_agents: usize) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            memory,
            event_bus,
            max_concurrent_agents,
        }
    }

    pub fn max_concurrent_agents(&self) -> usize {
        self.max_concurrent_agents
    }

    /// Create an agent for a goal. Fails without side effects at capacity.
    pub async fn spawn_agent(
        &self,
        capabilities: Vec<String>,
        trust_level: TrustLevel,
        goal: &str,
        workflow_id: Option<&str>,
    ) -> Result<Agent> {
        let agent = Agent::new(
            uuid::Uuid::new_v4().to_string(),
            goal.to_string(),
            capabilities,
            allowed_tools_for(trust_level),
            trust_level,
            workflow_id.map(|s| s.to_string()),
        );

        {
            let mut agents = self.agents.write().await;
            if agents.len() >= self.max_concurrent_agents {
                tracing::warn!(
                    "[AgentManager] Refusing spawn: {} agents active (limit {})",
                    agents.len(),
                    self.max_concurrent_agents
                );
                return Err(EngineError::Capacity(self.max_concurrent_agents));
            }
            agents.insert(agent.id.clone(), agent.clone());
        }

        let memory = serde_json::json!({
            "goal": agent.goal,
            "capabilities": agent.capabilities,
            "trust_level": agent.trust_level,
            "created_at": agent.created_at,
        });
        if let Err(e) = self.memory.store_agent_memory(&agent.id, memory).await {
            self.agents.write().await.remove(&agent.id);
            return Err(e);
        }

        let agent = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&agent.id) {
                Some(a) => {
                    a.status = AgentStatus::Ready;
                    a.clone()
                }
                None => return Err(EngineError::NotFound(format!("agent {}", agent.id))),
            }
        };

        tracing::info!(
            "[AgentManager] Spawned agent {} (trust: {}, tools: {})",
            agent.id,
            agent.trust_level,
            agent.allowed_tools.join(",")
        );
        self.event_bus
            .publish(
                EventTopic::AgentSpawned,
                serde_json::json!({
                    "agent_id": agent.id,
                    "capabilities": agent.capabilities,
                    "trust_level": agent.trust_level,
                    "workflow_id": agent.workflow_id,
                }),
            )
            .await;
        Ok(agent)
    }

    /// Retire an agent. Unknown ids are a logged no-op.
    pub async fn retire_agent(&self, agent_id: &str, reason: RetireReason) {
        let removed = self.agents.write().await.remove(agent_id);
        let Some(mut agent) = removed else {
            tracing::warn!("[AgentManager] Retire of unknown agent {} ignored", agent_id);
            return;
        };
        agent.status = AgentStatus::Retired;

        if let Err(e) = self.memory.clear_agent_memory(agent_id).await {
            tracing::warn!(
                "[AgentManager] Failed to clear memory for {}: {}",
                agent_id,
                e
            );
        }

        tracing::info!(
            "[AgentManager] Retired agent {} ({})",
            agent_id,
            reason.as_str()
        );
        self.event_bus
            .publish(
                EventTopic::AgentRetired,
                serde_json::json!({
                    "agent_id": agent_id,
                    "reason": reason.as_str(),
                    "failure_count": agent.failure_history.len(),
                }),
            )
            .await;
    }

    /// Swap a failing agent for a fresh one with the same goal, capabilities
    /// and trust. The replacement inherits the failure history.
    pub async fn replace_agent(&self, agent_id: &str, reason: &str) -> Result<Agent> {
        let record = FailureRecord::new(
            classify_message(reason),
            reason,
            serde_json::json!({ "agent_id": agent_id }),
            RecoveryAction::AgentSwap,
        );
        self.record_failure(agent_id, record).await?;

        let old = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;
        self.retire_agent(agent_id, RetireReason::Replaced).await;

        let spawned = self
            .spawn_agent(
                old.capabilities.clone(),
                old.trust_level,
                &old.goal,
                old.workflow_id.as_deref(),
            )
            .await?;

        let replacement = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&spawned.id) {
                Some(a) => {
                    a.failure_history = old.failure_history.clone();
                    a.clone()
                }
                None => return Err(EngineError::NotFound(format!("agent {}", spawned.id))),
            }
        };

        tracing::info!(
            "[AgentManager] Replaced agent {} with {}",
            agent_id,
            replacement.id
        );
        self.event_bus
            .publish(
                EventTopic::AgentReplaced,
                serde_json::json!({
                    "old_agent_id": agent_id,
                    "new_agent_id": replacement.id,
                    "reason": reason,
                }),
            )
            .await;
        Ok(replacement)
    }

    pub async fn get_agent_health(&self, agent_id: &str) -> AgentHealth {
        let Some(agent) = self.get_agent(agent_id).await else {
            return AgentHealth::not_found();
        };
        let memory_size = match self.memory.agent_memory(agent_id).await {
            Ok(Some(value)) => value.to_string().len(),
            _ => 0,
        };
        AgentHealth::Live {
            status: agent.status,
            created_at: agent.created_at,
            failure_count: agent.failure_history.len(),
            memory_size,
            trust_level: agent.trust_level,
            confidence_threshold: agent.confidence_threshold,
        }
    }

    pub async fn record_failure(&self, agent_id: &str, record: FailureRecord) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;
        agent.failure_history.push(record);
        Ok(())
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;
        agent.status = status;
        Ok(())
    }

    /// Execution-time tool check against the live record, not a snapshot.
    pub async fn authorize_tool(&self, agent_id: &str, tool: &Tool) -> bool {
        match self.get_agent(agent_id).await {
            Some(agent) => is_authorized(tool, &agent),
            None => false,
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn active_agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn all_agents(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureType;
    use crate::store::MemoryKvStore;
    use std::time::Duration;

    fn manager(limit: usize) -> (AgentManager, EventBus, WorkingMemory) {
        let memory = WorkingMemory::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let bus = EventBus::new();
        (AgentManager::new(memory.clone(), bus.clone(), limit), bus, memory)
    }

    #[tokio::test]
    async fn test_spawn_sets_ready_and_writes_memory() {
        let (mgr, bus, memory) = manager(2);
        let sub = bus.subscribe("agent.*").await;

        let agent = mgr
            .spawn_agent(vec!["search".into()], TrustLevel::Restricted, "find docs", Some("wf"))
            .await
            .unwrap();

        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.allowed_tools, vec!["read_file", "list_directory"]);
        let stored = memory.agent_memory(&agent.id).await.unwrap().unwrap();
        assert_eq!(stored["goal"], "find docs");
        assert_eq!(stored["trust_level"], "restricted");

        let events = bus.drain(&sub).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, EventTopic::AgentSpawned);
    }

    #[tokio::test]
    async fn test_capacity_error_leaves_active_set_untouched() {
        let (mgr, _, _) = manager(2);
        mgr.spawn_agent(vec![], TrustLevel::Standard, "a", None).await.unwrap();
        mgr.spawn_agent(vec![], TrustLevel::Standard, "b", None).await.unwrap();
        let before: Vec<String> = {
            let mut ids: Vec<_> = mgr.all_agents().await.into_iter().map(|a| a.id).collect();
            ids.sort();
            ids
        };

        let err = mgr
            .spawn_agent(vec![], TrustLevel::Standard, "c", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Capacity(2)));
        assert_eq!(err.failure_type(), FailureType::ResourceExhaustion);

        let mut after: Vec<_> = mgr.all_agents().await.into_iter().map(|a| a.id).collect();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_concurrent_spawns_never_exceed_limit() {
        let (mgr, _, _) = manager(3);
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    mgr.spawn_agent(vec![], TrustLevel::Standard, &format!("g{}", i), None)
                        .await
                        .is_ok()
                })
            })
            .collect();
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(mgr.active_agent_count().await, 3);
    }

    #[tokio::test]
    async fn test_retire_is_idempotent() {
        let (mgr, bus, memory) = manager(2);
        let agent = mgr.spawn_agent(vec![], TrustLevel::Standard, "g", None).await.unwrap();
        let sub = bus.subscribe("agent.retired").await;

        mgr.retire_agent(&agent.id, RetireReason::Completed).await;
        mgr.retire_agent(&agent.id, RetireReason::Completed).await;
        mgr.retire_agent("never-existed", RetireReason::Failed).await;

        assert_eq!(mgr.active_agent_count().await, 0);
        assert!(memory.agent_memory(&agent.id).await.unwrap().is_none());
        let events = bus.drain(&sub).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["reason"], "completed");
    }

    #[tokio::test]
    async fn test_replace_inherits_history() {
        let (mgr, bus, _) = manager(1);
        let sub = bus.subscribe("agent.replaced").await;
        let agent = mgr
            .spawn_agent(vec!["write".into()], TrustLevel::Elevated, "ship it", Some("wf"))
            .await
            .unwrap();

        // Works at capacity: the old agent is retired before the new one spawns.
        let replacement = mgr.replace_agent(&agent.id, "tool crashed").await.unwrap();

        assert_ne!(replacement.id, agent.id);
        assert_eq!(replacement.goal, "ship it");
        assert_eq!(replacement.trust_level, TrustLevel::Elevated);
        assert_eq!(replacement.capabilities, vec!["write"]);
        assert_eq!(replacement.failure_history.len(), 1);
        assert_eq!(replacement.failure_history[0].failure_type, FailureType::ToolError);
        assert_eq!(
            replacement.failure_history[0].recovery_action,
            RecoveryAction::AgentSwap
        );
        assert!(mgr.get_agent(&agent.id).await.is_none());
        assert_eq!(bus.drain(&sub).await.len(), 1);

        assert!(matches!(
            mgr.replace_agent("ghost", "x").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let (mgr, _, _) = manager(2);
        let agent = mgr.spawn_agent(vec![], TrustLevel::Standard, "g", None).await.unwrap();

        let health = serde_json::to_value(mgr.get_agent_health(&agent.id).await).unwrap();
        assert_eq!(health["status"], "ready");
        assert_eq!(health["failure_count"], 0);
        assert_eq!(health["trust_level"], "standard");
        assert_eq!(health["confidence_threshold"], 0.75);
        assert!(health["memory_size"].as_u64().unwrap() > 0);

        let missing = mgr.get_agent_health("nope").await;
        assert!(missing.is_not_found());
        assert_eq!(
            serde_json::to_value(missing).unwrap(),
            serde_json::json!({"status": "not_found"})
        );
    }

    #[tokio::test]
    async fn test_authorize_tool_uses_live_record() {
        let (mgr, _, _) = manager(2);
        let agent = mgr.spawn_agent(vec![], TrustLevel::Standard, "g", None).await.unwrap();
        let write = Tool::new("write_file", "", TrustLevel::Standard);

        assert!(mgr.authorize_tool(&agent.id, &write).await);
        mgr.retire_agent(&agent.id, RetireReason::Completed).await;
        assert!(!mgr.authorize_tool(&agent.id, &write).await);
    }
}
