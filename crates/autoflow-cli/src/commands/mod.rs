//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! autoflow-core engine through `AppState`.

pub mod audit;
pub mod providers;
pub mod workflow;

use std::sync::Arc;

use autoflow_core::config::EngineConfig;
use autoflow_core::state::{AppState, AppStateInner};

/// Build the engine from configuration.
///
/// `db_path` overrides the configured database path.
pub async fn init_state(config_path: Option<&str>, db_path: Option<&str>) -> Result<AppState, String> {
    let mut config = EngineConfig::load(config_path).map_err(|e| e.to_string())?;
    if let Some(path) = db_path {
        config.database_path = path.to_string();
    }

    let db = autoflow_core::Database::open(&config.database_path)
        .map_err(|e| format!("Failed to open database '{}': {}", config.database_path, e))?;

    Ok(Arc::new(AppStateInner::new(db, config).await))
}

/// Load .env and .env.local files for environment variables.
/// Variables already present in the environment win.
pub fn load_dotenv() {
    for filename in &[".env.local", ".env"] {
        let path = std::path::Path::new(filename);
        if !path.exists() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
            }
        }
        tracing::info!("[CLI] Loaded environment from '{}'", filename);
    }
}

/// Parse `KEY=VALUE` lines, skipping comments and stripping one level of
/// surrounding quotes.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq_idx) = line.find('=') else {
            continue;
        };
        let key = line[..eq_idx].trim().trim_start_matches("export ").trim();
        let mut value = line[eq_idx + 1..].trim().to_string();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = value[1..value.len() - 1].to_string();
        }
        if !key.is_empty() {
            pairs.push((key.to_string(), value));
        }
    }
    pairs
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}
