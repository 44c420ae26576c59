use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::store::KvStore;

const KEY_PREFIX: &str = "autoflow";

/// Key layout over the fast store for workflow snapshots and agent memory.
#[derive(Clone)]
pub struct WorkingMemory {
    kv: Arc<dyn KvStore>,
    agent_ttl: Duration,
    workflow_ttl: Duration,
}

impl WorkingMemory {
    pub fn new(kv: Arc<dyn KvStore>, agent_ttl: Duration, workflow_ttl: Duration) -> Self {
        Self {
            kv,
            agent_ttl,
            workflow_ttl,
        }
    }

    pub fn workflow_key(workflow_id: &str) -> String {
        format!("{}:workflow:{}", KEY_PREFIX, workflow_id)
    }

    pub fn agent_key(agent_id: &str) -> String {
        format!("{}:agent:{}", KEY_PREFIX, agent_id)
    }

    pub async fn store_agent_memory(
        &self,
        agent_id: &str,
        memory: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.kv
            .set(&Self::agent_key(agent_id), memory, Some(self.agent_ttl))
            .await
    }

    pub async fn agent_memory(&self, agent_id: &str) -> Result<Option<serde_json::Value>, EngineError> {
        self.kv.get(&Self::agent_key(agent_id)).await
    }

    pub async fn clear_agent_memory(&self, agent_id: &str) -> Result<(), EngineError> {
        self.kv.delete(&Self::agent_key(agent_id)).await
    }

    pub async fn store_workflow_snapshot(
        &self,
        workflow_id: &str,
        snapshot: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.kv
            .set(&Self::workflow_key(workflow_id), snapshot, Some(self.workflow_ttl))
            .await
    }

    pub async fn workflow_snapshot(
        &self,
        workflow_id: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        self.kv.get(&Self::workflow_key(workflow_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn test_agent_and_workflow_keys_are_separate() {
        let kv = Arc::new(MemoryKvStore::new());
        let memory = WorkingMemory::new(kv.clone(), Duration::from_secs(60), Duration::from_secs(60));

        memory
            .store_agent_memory("x", serde_json::json!({"goal": "g"}))
            .await
            .unwrap();
        memory
            .store_workflow_snapshot("x", serde_json::json!({"state": "running"}))
            .await
            .unwrap();

        assert_eq!(
            kv.get("autoflow:agent:x").await.unwrap().unwrap()["goal"],
            "g"
        );
        assert_eq!(
            memory.workflow_snapshot("x").await.unwrap().unwrap()["state"],
            "running"
        );

        memory.clear_agent_memory("x").await.unwrap();
        assert!(memory.agent_memory("x").await.unwrap().is_none());
        assert!(memory.workflow_snapshot("x").await.unwrap().is_some());
    }
}
