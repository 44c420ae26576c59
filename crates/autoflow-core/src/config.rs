//! Engine configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional YAML file
//! (`${VAR}` references expanded), then `AUTOFLOW_*` environment variables.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::DEFAULT_MAX_CONCURRENT_AGENTS;
use crate::error::{EngineError, Result};
use crate::intelligence::{default_providers, FabricConfig};
use crate::models::agent::TrustLevel;
use crate::models::llm::LlmProvider;

pub const ENV_MAX_AGENTS: &str = "AUTOFLOW_MAX_AGENTS";
pub const ENV_MEMORY_TTL: &str = "AUTOFLOW_MEMORY_TTL_SECS";
pub const ENV_SNAPSHOT_TTL: &str = "AUTOFLOW_SNAPSHOT_TTL_SECS";
pub const ENV_DB_PATH: &str = "AUTOFLOW_DB_PATH";
pub const ENV_DEFAULT_TRUST: &str = "AUTOFLOW_DEFAULT_TRUST";

/// One entry of the provider catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub cost_per_token: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    pub fn to_provider(&self) -> LlmProvider {
        let mut provider = LlmProvider::new(&self.vendor, &self.model, self.cost_per_token);
        provider.endpoint = self.endpoint.clone().unwrap_or_default();
        provider.capabilities = self.capabilities.clone();
        provider
    }

    /// The API key, when its variable is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        let var = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| default_key_env(&self.vendor));
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }
}

fn default_key_env(vendor: &str) -> String {
    match vendor.to_lowercase().as_str() {
        "anthropic" | "claude" => "ANTHROPIC_API_KEY".to_string(),
        "openai" => "OPENAI_API_KEY".to_string(),
        other => format!("{}_API_KEY", other.to_uppercase().replace('-', "_")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_agents: usize,
    pub default_trust_level: TrustLevel,
    pub working_memory_ttl_secs: u64,
    pub workflow_snapshot_ttl_secs: u64,
    pub pause_poll_interval_ms: u64,
    #[serde(flatten)]
    pub fabric: FabricConfig,
    /// Empty means the built-in catalog
    pub providers: Vec<ProviderConfig>,
    pub database_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            default_trust_level: TrustLevel::Standard,
            working_memory_ttl_secs: 3600,
            workflow_snapshot_ttl_secs: 86400,
            pause_poll_interval_ms: 200,
            fabric: FabricConfig::default(),
            providers: Vec::new(),
            database_path: "autoflow.db".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let expanded = resolve_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| EngineError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Defaults, or the given file, with environment overrides applied.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_value(ENV_MAX_AGENTS) {
            self.max_concurrent_agents = parse_env(ENV_MAX_AGENTS, &v)?;
        }
        if let Some(v) = env_value(ENV_MEMORY_TTL) {
            self.working_memory_ttl_secs = parse_env(ENV_MEMORY_TTL, &v)?;
        }
        if let Some(v) = env_value(ENV_SNAPSHOT_TTL) {
            self.workflow_snapshot_ttl_secs = parse_env(ENV_SNAPSHOT_TTL, &v)?;
        }
        if let Some(v) = env_value(ENV_DB_PATH) {
            self.database_path = v;
        }
        if let Some(v) = env_value(ENV_DEFAULT_TRUST) {
            self.default_trust_level = TrustLevel::from_str(&v).ok_or_else(|| {
                EngineError::Config(format!("{}: unknown trust level '{}'", ENV_DEFAULT_TRUST, v))
            })?;
        }
        Ok(())
    }

    /// Configured providers, or the built-in catalog when none are listed.
    pub fn provider_catalog(&self) -> Vec<ProviderConfig> {
        if !self.providers.is_empty() {
            return self.providers.clone();
        }
        default_providers()
            .into_iter()
            .map(|p| ProviderConfig {
                api_key_env: Some(default_key_env(&p.vendor)),
                endpoint: Some(p.endpoint).filter(|e| !e.is_empty()),
                vendor: p.vendor,
                model: p.model,
                cost_per_token: p.cost_per_token,
                capabilities: p.capabilities,
            })
            .collect()
    }

    pub fn working_memory_ttl(&self) -> Duration {
        Duration::from_secs(self.working_memory_ttl_secs)
    }

    pub fn workflow_snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.workflow_snapshot_ttl_secs)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{}: invalid value '{}'", name, value)))
}

static ENV_REF: OnceLock<Option<regex::Regex>> = OnceLock::new();

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax; unset variables
/// without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    let Some(re) = ENV_REF
        .get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
    else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::llm::LlmRole;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent_agents, 10);
        assert_eq!(cfg.default_trust_level, TrustLevel::Standard);
        assert_eq!(cfg.working_memory_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.workflow_snapshot_ttl(), Duration::from_secs(86400));
        assert_eq!(cfg.pause_poll_interval(), Duration::from_millis(200));
        assert_eq!(cfg.fabric.consensus_threshold, 0.7);
        assert_eq!(cfg.database_path, "autoflow.db");
    }

    #[test]
    fn test_yaml_partial_override_keeps_defaults() {
        let yaml = r#"
max_concurrent_agents: 4
default_trust_level: elevated
consensus_threshold: 0.9
role_preferences:
  planner: ["claude-3-opus"]
providers:
  - vendor: openai
    model: gpt-4
    cost_per_token: 0.00003
    capabilities: [reasoning]
"#;
        let cfg = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.max_concurrent_agents, 4);
        assert_eq!(cfg.default_trust_level, TrustLevel::Elevated);
        assert_eq!(cfg.fabric.consensus_threshold, 0.9);
        assert_eq!(cfg.fabric.role_preferences[&LlmRole::Planner], vec!["claude-3-opus"]);
        assert_eq!(cfg.working_memory_ttl_secs, 3600);
        assert_eq!(cfg.provider_catalog().len(), 1);
        assert_eq!(cfg.provider_catalog()[0].to_provider().key(), "openai:gpt-4");
    }

    #[test]
    fn test_builtin_catalog_names_key_vars() {
        let catalog = EngineConfig::default().provider_catalog();
        assert_eq!(catalog.len(), 4);
        assert!(catalog
            .iter()
            .filter(|p| p.vendor == "anthropic")
            .all(|p| p.api_key_env.as_deref() == Some("ANTHROPIC_API_KEY")));
        assert!(catalog
            .iter()
            .filter(|p| p.vendor == "openai")
            .all(|p| p.api_key_env.as_deref() == Some("OPENAI_API_KEY")));
    }

    #[test]
    fn test_provider_api_key_reads_named_var() {
        let mut p = ProviderConfig {
            vendor: "local".into(),
            model: "m".into(),
            endpoint: None,
            cost_per_token: 0.0,
            capabilities: vec![],
            api_key_env: Some("AUTOFLOW_TEST_PROVIDER_KEY".into()),
        };
        std::env::set_var("AUTOFLOW_TEST_PROVIDER_KEY", "sk-test");
        assert_eq!(p.api_key().as_deref(), Some("sk-test"));
        std::env::set_var("AUTOFLOW_TEST_PROVIDER_KEY", "  ");
        assert_eq!(p.api_key(), None);
        std::env::remove_var("AUTOFLOW_TEST_PROVIDER_KEY");

        p.api_key_env = None;
        assert_eq!(default_key_env(&p.vendor), "LOCAL_API_KEY");
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("AUTOFLOW_TEST_CONFIG_VAR", "hello");
        assert_eq!(resolve_env_vars("${AUTOFLOW_TEST_CONFIG_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix-${AUTOFLOW_TEST_CONFIG_VAR}-suffix"),
            "prefix-hello-suffix"
        );
        assert_eq!(resolve_env_vars("${AUTOFLOW_NONEXISTENT_VAR:-fallback}"), "fallback");
        assert_eq!(
            resolve_env_vars("${AUTOFLOW_NONEXISTENT_VAR}"),
            "${AUTOFLOW_NONEXISTENT_VAR}"
        );
        std::env::remove_var("AUTOFLOW_TEST_CONFIG_VAR");
    }

    #[test]
    fn test_env_overrides_win_over_file_values() {
        std::env::set_var(ENV_MAX_AGENTS, "3");
        std::env::set_var(ENV_DEFAULT_TRUST, "restricted");
        let mut cfg = EngineConfig::from_yaml("max_concurrent_agents: 7\n").unwrap();
        let applied = cfg.apply_env_overrides();
        std::env::set_var(ENV_DEFAULT_TRUST, "root");
        let rejected = EngineConfig::default().apply_env_overrides();
        std::env::remove_var(ENV_MAX_AGENTS);
        std::env::remove_var(ENV_DEFAULT_TRUST);

        applied.unwrap();
        assert_eq!(cfg.max_concurrent_agents, 3);
        assert_eq!(cfg.default_trust_level, TrustLevel::Restricted);
        assert!(matches!(rejected, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        assert_eq!(parse_env::<usize>("X", " 12 ").unwrap(), 12);
        assert!(matches!(parse_env::<u64>("X", "soon"), Err(EngineError::Config(_))));
    }
}
