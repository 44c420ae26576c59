//! Event Bus - fire-and-forget lifecycle notifications.
//!
//! Features:
//!   - Direct handlers: invoked on a spawned task for every published event
//!   - Pattern subscriptions: `workflow.*`-style buffers drained by the caller
//!   - Publishing never fails and never blocks on handlers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle topics published by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    #[serde(rename = "agent.retired")]
    AgentRetired,
    #[serde(rename = "agent.replaced")]
    AgentReplaced,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.step_started")]
    StepStarted,
    #[serde(rename = "workflow.step_completed")]
    StepCompleted,
    #[serde(rename = "workflow.step_failed")]
    StepFailed,
    #[serde(rename = "workflow.recovery_triggered")]
    RecoveryTriggered,
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentSpawned => "agent.spawned",
            Self::AgentRetired => "agent.retired",
            Self::AgentReplaced => "agent.replaced",
            Self::WorkflowStarted => "workflow.started",
            Self::StepStarted => "workflow.step_started",
            Self::StepCompleted => "workflow.step_completed",
            Self::StepFailed => "workflow.step_failed",
            Self::RecoveryTriggered => "workflow.recovery_triggered",
            Self::WorkflowPaused => "workflow.paused",
            Self::WorkflowResumed => "workflow.resumed",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "agent.spawned" => Some(Self::AgentSpawned),
            "agent.retired" => Some(Self::AgentRetired),
            "agent.replaced" => Some(Self::AgentReplaced),
            "workflow.started" => Some(Self::WorkflowStarted),
            "workflow.step_started" => Some(Self::StepStarted),
            "workflow.step_completed" => Some(Self::StepCompleted),
            "workflow.step_failed" => Some(Self::StepFailed),
            "workflow.recovery_triggered" => Some(Self::RecoveryTriggered),
            "workflow.paused" => Some(Self::WorkflowPaused),
            "workflow.resumed" => Some(Self::WorkflowResumed),
            "workflow.completed" => Some(Self::WorkflowCompleted),
            "workflow.failed" => Some(Self::WorkflowFailed),
            "workflow.cancelled" => Some(Self::WorkflowCancelled),
            _ => None,
        }
    }

    /// `*` matches everything, `prefix.*` matches a topic family,
    /// anything else must match exactly.
    pub fn matches(&self, pattern: &str) -> bool {
        let topic = self.as_str();
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) => topic
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => topic == pattern,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: EventTopic,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

struct EventBusInner {
    handlers: HashMap<String, EventHandler>,
    /// subscription id -> topic pattern
    subscriptions: HashMap<String, String>,
    /// subscription id -> buffered events
    pending_events: HashMap<String, Vec<Event>>,
}

/// Thread-safe in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<EventBusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EventBusInner {
                handlers: HashMap::new(),
                subscriptions: HashMap::new(),
                pending_events: HashMap::new(),
            })),
        }
    }

    // ─── Direct handlers ────────────────────────────────────────────────

    /// Register a handler under `key`, replacing any previous one.
    pub async fn on<F>(&self, key: &str, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        inner.handlers.insert(key.to_string(), Arc::new(handler));
    }

    pub async fn off(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.handlers.remove(key);
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Buffer every event matching `pattern`; returns the subscription id.
    pub async fn subscribe(&self, pattern: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;
        inner.subscriptions.insert(id.clone(), pattern.to_string());
        inner.pending_events.insert(id.clone(), Vec::new());
        id
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        let mut inner = self.inner.write().await;
        inner.subscriptions.remove(subscription_id);
        inner.pending_events.remove(subscription_id);
    }

    /// Take all buffered events for a subscription, oldest first.
    pub async fn drain(&self, subscription_id: &str) -> Vec<Event> {
        let mut inner = self.inner.write().await;
        inner
            .pending_events
            .get_mut(subscription_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    // ─── Publish ────────────────────────────────────────────────────────

    pub async fn publish(&self, topic: EventTopic, payload: serde_json::Value) {
        let event = Event {
            topic,
            payload,
            timestamp: Utc::now(),
        };
        tracing::debug!("[EventBus] {}", topic.as_str());

        let mut inner = self.inner.write().await;

        for handler in inner.handlers.values() {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                handler(event);
            });
        }

        let matching: Vec<String> = inner
            .subscriptions
            .iter()
            .filter(|(_, pattern)| topic.matches(pattern))
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            inner
                .pending_events
                .entry(id)
                .or_default()
                .push(event.clone());
        }
    }
}
