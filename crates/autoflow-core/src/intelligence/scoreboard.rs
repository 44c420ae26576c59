use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::llm::LlmProvider;

pub const RELIABILITY_REWARD: f64 = 0.01;
pub const RELIABILITY_PENALTY: f64 = 0.05;
/// Weight kept from the previous latency average.
pub const LATENCY_SMOOTHING: f64 = 0.9;

struct ScoreboardInner {
    providers: HashMap<String, LlmProvider>,
    /// Registration order, used as the final tie-break when ranking.
    order: Vec<String>,
}

/// Shared provider table. `record_outcome` is the only path that mutates
/// reliability and latency.
#[derive(Clone)]
pub struct Scoreboard {
    inner: Arc<RwLock<ScoreboardInner>>,
}

impl Default for Scoreboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Scoreboard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ScoreboardInner {
                providers: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// Add a provider, or replace the catalog entry with the same key.
    pub async fn register(&self, provider: LlmProvider) {
        let key = provider.key();
        let mut inner = self.inner.write().await;
        if inner.providers.insert(key.clone(), provider).is_none() {
            inner.order.push(key);
        }
    }

    pub async fn get(&self, key: &str) -> Option<LlmProvider> {
        let inner = self.inner.read().await;
        inner.providers.get(key).cloned()
    }

    /// Consistent copy of every provider, in registration order.
    pub async fn snapshot(&self) -> Vec<LlmProvider> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|k| inner.providers.get(k).cloned())
            .collect()
    }

    /// Feed one call outcome back: latency is smoothed, reliability moves by
    /// `+RELIABILITY_REWARD` / `-RELIABILITY_PENALTY` within `[0, 1]`.
    pub async fn record_outcome(
        &self,
        key: &str,
        success: bool,
        latency_secs: f64,
    ) -> Option<LlmProvider> {
        let mut inner = self.inner.write().await;
        let provider = inner.providers.get_mut(key)?;

        provider.avg_latency =
            LATENCY_SMOOTHING * provider.avg_latency + (1.0 - LATENCY_SMOOTHING) * latency_secs;
        provider.reliability_score = if success {
            (provider.reliability_score + RELIABILITY_REWARD).min(1.0)
        } else {
            (provider.reliability_score - RELIABILITY_PENALTY).max(0.0)
        };

        tracing::debug!(
            "[Fabric] {} reliability={:.3} latency={:.3}s",
            key,
            provider.reliability_score,
            provider.avg_latency
        );
        Some(provider.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(reliability: f64) -> LlmProvider {
        let mut p = LlmProvider::new("openai", "gpt-4", 0.00003);
        p.reliability_score = reliability;
        p
    }

    #[tokio::test]
    async fn test_reliability_rises_on_success_and_caps() {
        let board = Scoreboard::new();
        board.register(provider(0.9)).await;

        let mut last = 0.9;
        for _ in 0..5 {
            let p = board.record_outcome("openai:gpt-4", true, 1.0).await.unwrap();
            assert!(p.reliability_score > last);
            last = p.reliability_score;
        }
        for _ in 0..20 {
            board.record_outcome("openai:gpt-4", true, 1.0).await;
        }
        assert_eq!(board.get("openai:gpt-4").await.unwrap().reliability_score, 1.0);
    }

    #[tokio::test]
    async fn test_reliability_drops_on_failure_and_floors() {
        let board = Scoreboard::new();
        board.register(provider(0.07)).await;

        let p = board.record_outcome("openai:gpt-4", false, 0.0).await.unwrap();
        assert!(p.reliability_score < 0.07);
        let p = board.record_outcome("openai:gpt-4", false, 0.0).await.unwrap();
        assert_eq!(p.reliability_score, 0.0);
    }

    #[tokio::test]
    async fn test_latency_is_smoothed() {
        let board = Scoreboard::new();
        board.register(provider(1.0)).await;
        let p = board.record_outcome("openai:gpt-4", true, 10.0).await.unwrap();
        assert!((p.avg_latency - 1.0).abs() < 1e-9);
        let p = board.record_outcome("openai:gpt-4", true, 10.0).await.unwrap();
        assert!((p.avg_latency - 1.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_key_is_ignored() {
        let board = Scoreboard::new();
        assert!(board.record_outcome("nope:none", true, 1.0).await.is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_in_place() {
        let board = Scoreboard::new();
        board.register(LlmProvider::new("a", "m1", 1.0)).await;
        board.register(LlmProvider::new("b", "m2", 1.0)).await;
        board.register(LlmProvider::new("a", "m1", 2.0)).await;
        let snapshot = board.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key(), "a:m1");
        assert_eq!(snapshot[0].cost_per_token, 2.0);
    }
}
