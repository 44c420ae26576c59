//! `autoflow providers` - inspect the provider catalog and role routing.

use autoflow_core::models::llm::{LlmProvider, LlmRole};
use autoflow_core::state::AppState;

use super::truncate;

/// List every registered provider, or the ranked candidates for a role.
pub async fn list(state: &AppState, role: Option<&str>) -> Result<(), String> {
    let providers = match role {
        Some(name) => {
            let role = LlmRole::from_str(name).ok_or_else(|| {
                let known: Vec<&str> = LlmRole::ALL.iter().map(|r| r.as_str()).collect();
                format!("Unknown role '{}'. Expected one of: {}", name, known.join(", "))
            })?;
            println!("Providers for role '{}', best first:", role);
            state.fabric.ranked_providers(role).await
        }
        None => state.fabric.providers().await,
    };

    if providers.is_empty() {
        println!("No providers available.");
        return Ok(());
    }
    print_table(&providers);
    Ok(())
}

fn print_table(providers: &[LlmProvider]) {
    println!("┌──────────────────────────────────────┬──────────────┬─────────────┬────────────┐");
    println!("│ Provider                             │ Cost/token   │ Reliability │ Latency    │");
    println!("├──────────────────────────────────────┼──────────────┼─────────────┼────────────┤");
    for p in providers {
        println!(
            "│ {:<36} │ {:<12.8} │ {:<11.3} │ {:<9.2}s │",
            truncate(&p.key(), 36),
            p.cost_per_token,
            p.reliability_score,
            p.avg_latency
        );
    }
    println!("└──────────────────────────────────────┴──────────────┴─────────────┴────────────┘");
}
