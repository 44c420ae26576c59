//! `autoflow audit` - print a workflow's durable record and audit trail.

use autoflow_core::state::AppState;

use super::print_json;

pub async fn show(state: &AppState, workflow_id: &str) -> Result<(), String> {
    let record = state
        .audit
        .get_workflow_record(workflow_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Workflow {} not found", workflow_id))?;

    println!("Workflow {} ({})", record.id, record.name);
    println!("   Status:  {}", record.status);
    println!("   Created: {}", record.created_at.to_rfc3339());
    println!("   Updated: {}", record.updated_at.to_rfc3339());
    println!();

    let trail = state
        .audit
        .get_audit_trail(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    if trail.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }

    for entry in &trail {
        println!(
            "{}  {:<20} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.event_type,
            entry.step_id.as_deref().unwrap_or("-")
        );
        print_json(&entry.details);
    }
    Ok(())
}
