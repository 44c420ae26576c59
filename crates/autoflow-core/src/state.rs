//! Shared engine state: one wired set of components per process.

use std::sync::Arc;

use crate::agents::AgentManager;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::intelligence::{ApiStyle, HttpBackend, HttpBackendConfig, IntelligenceFabric, LlmBackend};
use crate::orchestration::{OrchestratorConfig, WorkflowOrchestrator};
use crate::store::{AuditStore, MemoryKvStore, WorkingMemory};
use crate::tools::{NoopToolRunner, ToolRunner};
use crate::worker::AgentWorker;

pub struct AppStateInner {
    pub db: Database,
    pub config: EngineConfig,
    pub event_bus: EventBus,
    pub memory: WorkingMemory,
    pub audit: AuditStore,
    pub agents: AgentManager,
    pub fabric: IntelligenceFabric,
    pub orchestrator: WorkflowOrchestrator,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire the engine with the no-op tool runner.
    pub async fn new(db: Database, config: EngineConfig) -> Self {
        Self::with_tool_runner(db, config, Arc::new(NoopToolRunner)).await
    }

    pub async fn with_tool_runner(
        db: Database,
        config: EngineConfig,
        tool_runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let event_bus = EventBus::new();
        let memory = WorkingMemory::new(
            Arc::new(MemoryKvStore::new()),
            config.working_memory_ttl(),
            config.workflow_snapshot_ttl(),
        );
        let audit = AuditStore::new(db.clone());
        let agents = AgentManager::new(memory.clone(), event_bus.clone(), config.max_concurrent_agents);

        let fabric = IntelligenceFabric::new(config.fabric.clone());
        let mut live = 0;
        for entry in config.provider_catalog() {
            let backend: Option<Arc<dyn LlmBackend>> = entry.api_key().map(|key| {
                let style = ApiStyle::for_vendor(&entry.vendor);
                let mut http = HttpBackendConfig::new(style, &entry.model, &key);
                if let Some(endpoint) = entry.endpoint.as_ref().filter(|e| !e.is_empty()) {
                    http.base_url = endpoint.clone();
                }
                Arc::new(HttpBackend::new(http)) as Arc<dyn LlmBackend>
            });
            if backend.is_some() {
                live += 1;
            } else {
                tracing::debug!(
                    "[AppState] No API key for {}:{}, registering without backend",
                    entry.vendor,
                    entry.model
                );
            }
            fabric.register_provider(entry.to_provider(), backend).await;
        }
        tracing::info!(
            "[AppState] {} providers registered ({} with credentials)",
            config.provider_catalog().len(),
            live
        );

        let worker = AgentWorker::new(fabric.clone(), agents.clone(), tool_runner);
        let orchestrator = WorkflowOrchestrator::new(
            OrchestratorConfig {
                default_trust_level: config.default_trust_level,
                pause_poll_interval: config.pause_poll_interval(),
            },
            agents.clone(),
            Arc::new(worker),
            memory.clone(),
            audit.clone(),
            event_bus.clone(),
        );

        Self {
            db,
            config,
            event_bus,
            memory,
            audit,
            agents,
            fabric,
            orchestrator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_registers_catalog() {
        let config = EngineConfig {
            providers: vec![crate::config::ProviderConfig {
                vendor: "openai".into(),
                model: "gpt-4".into(),
                endpoint: None,
                cost_per_token: 0.00003,
                capabilities: vec![],
                api_key_env: Some("AUTOFLOW_TEST_STATE_UNSET_KEY".into()),
            }],
            ..EngineConfig::default()
        };
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), config).await;
        let providers = state.fabric.providers().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].key(), "openai:gpt-4");
        assert_eq!(state.agents.max_concurrent_agents(), 10);
    }
}
