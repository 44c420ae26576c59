use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::backend::LlmBackend;
use super::scoreboard::Scoreboard;
use super::scoring::{
    estimate_confidence, has_hallucination_markers, text_similarity,
    HALLUCINATION_CONFIDENCE_FLOOR,
};
use crate::error::{EngineError, Result};
use crate::models::failure::FailureType;
use crate::models::llm::{LlmConfig, LlmProvider, LlmResponse, LlmRole, VerificationResult};
use crate::models::task::Task;

pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.7;

/// Routing table and consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Role to preferred model-name fragments, matched by substring.
    pub role_preferences: HashMap<LlmRole, Vec<String>>,
    pub consensus_threshold: f64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        let table: [(LlmRole, &[&str]); 5] = [
            (LlmRole::Planner, &["gpt-4", "claude-3-opus"]),
            (LlmRole::Executor, &["gpt-3.5-turbo", "claude-3-haiku"]),
            (LlmRole::Verifier, &["claude-3-opus", "gpt-4"]),
            (LlmRole::Auditor, &["gpt-4", "claude-3-sonnet"]),
            (LlmRole::Synthesizer, &["claude-3-opus", "gpt-4"]),
        ];
        Self {
            role_preferences: table
                .into_iter()
                .map(|(role, models)| (role, models.iter().map(|m| m.to_string()).collect()))
                .collect(),
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
        }
    }
}

/// The built-in provider catalog.
pub fn default_providers() -> Vec<LlmProvider> {
    vec![
        LlmProvider::new("openai", "gpt-4", 0.00003)
            .with_endpoint("https://api.openai.com/v1")
            .with_capabilities(&["reasoning", "code", "analysis"]),
        LlmProvider::new("openai", "gpt-3.5-turbo", 0.000002)
            .with_endpoint("https://api.openai.com/v1")
            .with_capabilities(&["general", "fast"]),
        LlmProvider::new("anthropic", "claude-3-opus-20240229", 0.000015)
            .with_endpoint("https://api.anthropic.com")
            .with_capabilities(&["reasoning", "analysis", "long_context"]),
        LlmProvider::new("anthropic", "claude-3-haiku-20240307", 0.00000025)
            .with_endpoint("https://api.anthropic.com")
            .with_capabilities(&["fast", "general"]),
    ]
}

/// Routes role-tagged tasks to model backends, with fallback and consensus.
#[derive(Clone)]
pub struct IntelligenceFabric {
    scoreboard: Scoreboard,
    backends: Arc<RwLock<HashMap<String, Arc<dyn LlmBackend>>>>,
    config: FabricConfig,
}

impl IntelligenceFabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            scoreboard: Scoreboard::new(),
            backends: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    /// Register a provider. Without a backend its calls fail as unauthorized.
    pub async fn register_provider(&self, provider: LlmProvider, backend: Option<Arc<dyn LlmBackend>>) {
        let key = provider.key();
        tracing::info!(
            "[Fabric] Registered provider {} (backend: {})",
            key,
            if backend.is_some() { "yes" } else { "none" }
        );
        self.scoreboard.register(provider).await;
        let mut backends = self.backends.write().await;
        match backend {
            Some(b) => {
                backends.insert(key, b);
            }
            None => {
                backends.remove(&key);
            }
        }
    }

    pub async fn providers(&self) -> Vec<LlmProvider> {
        self.scoreboard.snapshot().await
    }

    /// Providers eligible for `role`, best first: highest reliability, then
    /// lowest cost, then lowest latency.
    pub async fn ranked_providers(&self, role: LlmRole) -> Vec<LlmProvider> {
        let preferred = self
            .config
            .role_preferences
            .get(&role)
            .cloned()
            .unwrap_or_default();

        let mut candidates: Vec<LlmProvider> = self
            .scoreboard
            .snapshot()
            .await
            .into_iter()
            .filter(|p| preferred.iter().any(|m| p.model.contains(m.as_str())))
            .collect();

        candidates.sort_by(|a, b| {
            b.reliability_score
                .total_cmp(&a.reliability_score)
                .then(a.cost_per_token.total_cmp(&b.cost_per_token))
                .then(a.avg_latency.total_cmp(&b.avg_latency))
        });
        candidates
    }

    /// Best provider for a task in the given role.
    pub async fn route_task(&self, task: &Task, role: LlmRole) -> Result<LlmProvider> {
        let provider = self
            .ranked_providers(role)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Routing(role.as_str().to_string()))?;
        tracing::info!(
            "[Fabric] Routed task {} ({}) to {}",
            task.id,
            role.as_str(),
            provider.key()
        );
        Ok(provider)
    }

    /// Call one provider and feed the outcome back into the scoreboard.
    pub async fn call_llm(
        &self,
        provider: &LlmProvider,
        prompt: &str,
        config: &LlmConfig,
        role: LlmRole,
    ) -> Result<LlmResponse> {
        let key = provider.key();
        let backend = self.backends.read().await.get(&key).cloned();

        let started = Instant::now();
        let outcome = match backend {
            Some(backend) => backend.call(prompt, config, role).await,
            None => Err(EngineError::Provider {
                provider: key.clone(),
                message: "unauthorized: no backend configured (missing API key?)".to_string(),
                kind: Some(FailureType::PolicyViolation),
            }),
        };
        let latency = started.elapsed().as_secs_f64();

        match outcome {
            Ok(reply) => {
                let updated = self.scoreboard.record_outcome(&key, true, latency).await;
                let confidence = estimate_confidence(&reply.text);
                Ok(LlmResponse {
                    provider: updated.unwrap_or_else(|| provider.clone()),
                    role,
                    prompt: prompt.to_string(),
                    cost: reply.tokens_used as f64 * provider.cost_per_token,
                    response: reply.text,
                    confidence,
                    tokens_used: reply.tokens_used,
                    latency,
                    timestamp: Utc::now(),
                })
            }
            Err(e) => {
                self.scoreboard.record_outcome(&key, false, 0.0).await;
                tracing::warn!("[Fabric] LLM call to {} failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Try ranked providers in order; the first success wins.
    pub async fn execute_with_fallback(
        &self,
        task: &Task,
        role: LlmRole,
        config: &LlmConfig,
    ) -> Result<LlmResponse> {
        self.execute_with_fallback_from(task, role, config, 0).await
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback) but starts
    /// `skip` positions down the ranked list (clamped to the last provider).
    pub async fn execute_with_fallback_from(
        &self,
        task: &Task,
        role: LlmRole,
        config: &LlmConfig,
        skip: usize,
    ) -> Result<LlmResponse> {
        let ranked = self.ranked_providers(role).await;
        if ranked.is_empty() {
            return Err(EngineError::Routing(role.as_str().to_string()));
        }

        let start = skip.min(ranked.len() - 1);
        let mut last_error = None;
        for (idx, provider) in ranked.iter().enumerate().skip(start) {
            match self.call_llm(provider, &task.prompt, config, role).await {
                Ok(response) => {
                    if idx > start {
                        tracing::info!(
                            "[Fabric] Task {} served by fallback provider {}",
                            task.id,
                            provider.key()
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        "[Fabric] Provider {} failed for task {}, trying next: {}",
                        provider.key(),
                        task.id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        tracing::error!("[Fabric] All providers failed for task {}", task.id);
        Err(EngineError::AllProvidersFailed {
            role: role.as_str().to_string(),
            last: Box::new(
                last_error.unwrap_or_else(|| EngineError::Routing(role.as_str().to_string())),
            ),
        })
    }

    /// Ask the top two providers concurrently and cross-verify the answers.
    pub async fn execute_critical_task(
        &self,
        task: &Task,
        role: LlmRole,
        config: &LlmConfig,
    ) -> Result<LlmResponse> {
        self.execute_critical_task_from(task, role, config, 0).await
    }

    /// Like [`execute_critical_task`](Self::execute_critical_task) but the
    /// pair starts `skip` positions down the ranked list (clamped to the last
    /// provider, which then answers alone).
    pub async fn execute_critical_task_from(
        &self,
        task: &Task,
        role: LlmRole,
        config: &LlmConfig,
        skip: usize,
    ) -> Result<LlmResponse> {
        let ranked = self.ranked_providers(role).await;
        if ranked.is_empty() {
            return Err(EngineError::Routing(role.as_str().to_string()));
        }

        let start = skip.min(ranked.len() - 1);
        let calls = ranked
            .iter()
            .skip(start)
            .take(2)
            .map(|p| self.call_llm(p, &task.prompt, config, role));
        let outcomes = futures::future::join_all(calls).await;

        let mut responses = Vec::new();
        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(r) => responses.push(r),
                Err(e) => last_error = Some(e),
            }
        }

        if responses.is_empty() {
            tracing::error!("[Fabric] No provider answered critical task {}", task.id);
            return Err(EngineError::AllProvidersFailed {
                role: role.as_str().to_string(),
                last: Box::new(
                    last_error.unwrap_or_else(|| EngineError::Routing(role.as_str().to_string())),
                ),
            });
        }

        let verification = self.cross_verify(task, &responses);
        if !verification.consensus {
            tracing::warn!(
                "[Fabric] No consensus on critical task {}: {}",
                task.id,
                verification.discrepancies.join("; ")
            );
        }

        let mut selected = verification
            .selected_response
            .ok_or_else(|| EngineError::Internal("cross-verification selected nothing".into()))?;
        selected.confidence = verification.confidence;
        Ok(selected)
    }

    /// Compare responses pairwise; consensus when mean similarity exceeds the
    /// threshold. The most confident response is always selected.
    pub fn cross_verify(&self, task: &Task, responses: &[LlmResponse]) -> VerificationResult {
        if responses.len() < 2 {
            let selected = responses.first().cloned();
            return VerificationResult {
                consensus: true,
                confidence: selected.as_ref().map(|r| r.confidence).unwrap_or(0.0),
                selected_response: selected,
                discrepancies: Vec::new(),
            };
        }

        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..responses.len() {
            for j in (i + 1)..responses.len() {
                total += text_similarity(&responses[i].response, &responses[j].response);
                pairs += 1;
            }
        }
        let avg_similarity = total / pairs as f64;
        let consensus = avg_similarity > self.config.consensus_threshold;

        let mut best = 0;
        for (idx, r) in responses.iter().enumerate() {
            if r.confidence > responses[best].confidence {
                best = idx;
            }
        }
        let selected = &responses[best];

        let mut confidence = selected.confidence;
        let mut discrepancies = Vec::new();
        if !consensus {
            confidence /= 2.0;
            for (idx, other) in responses.iter().enumerate() {
                if idx == best {
                    continue;
                }
                let similarity = text_similarity(&selected.response, &other.response);
                discrepancies.push(format!(
                    "Model {} disagreed (similarity: {:.2})",
                    other.provider.model, similarity
                ));
            }
        }

        tracing::debug!(
            "[Fabric] Cross-verified task {}: similarity={:.2} consensus={}",
            task.id,
            avg_similarity,
            consensus
        );

        VerificationResult {
            consensus,
            selected_response: Some(selected.clone()),
            discrepancies,
            confidence,
        }
    }

    /// Low confidence or explicit uncertainty marks a likely hallucination.
    pub fn detect_hallucination(&self, response: &LlmResponse, _context: &serde_json::Value) -> bool {
        response.confidence < HALLUCINATION_CONFIDENCE_FLOOR
            || has_hallucination_markers(&response.response)
    }
}
