//! `autoflow run | validate | plan` - YAML workflow commands.

use autoflow_core::models::task::WorkflowResult;
use autoflow_core::models::workflow::Workflow;
use autoflow_core::state::AppState;
use autoflow_core::workflow::WorkflowDefinition;

use super::truncate;

fn load(workflow_file: &str) -> Result<Workflow, String> {
    WorkflowDefinition::from_file(workflow_file)
        .and_then(|def| def.into_workflow())
        .map_err(|e| e.to_string())
}

/// Load and execute a workflow, returning the engine's result.
pub async fn execute(state: &AppState, workflow_file: &str, verbose: bool) -> Result<WorkflowResult, String> {
    let workflow = load(workflow_file)?;

    println!("📄 Loaded workflow: {} ({})", workflow.name, workflow_file);
    println!(
        "   {} step(s) in {} group(s), id {}",
        workflow.step_count(),
        workflow.execution_order.len(),
        workflow.id
    );
    println!();

    if verbose {
        state
            .event_bus
            .on("cli-verbose", |event| {
                println!("  · {} {}", event.topic.as_str(), event.payload);
            })
            .await;
    }

    let result = state
        .orchestrator
        .execute_workflow(workflow)
        .await
        .map_err(|e| e.to_string());

    if verbose {
        state.event_bus.off("cli-verbose").await;
    }
    result
}

/// Run a workflow from a YAML file and print a summary.
pub async fn run(state: &AppState, workflow_file: &str, verbose: bool) -> Result<(), String> {
    let result = execute(state, workflow_file, verbose).await?;
    print_summary(&result);

    if result.success {
        println!("\n🎉 Workflow completed successfully!");
        Ok(())
    } else {
        Err(format!(
            "Workflow {} ended {} ({} step(s) failed). Inspect with: autoflow audit {}",
            result.workflow_id, result.final_state, result.steps_failed, result.workflow_id
        ))
    }
}

fn print_summary(result: &WorkflowResult) {
    println!();
    println!("┌──────────────────┬──────────────────────────────┐");
    println!("│ Step             │ Provider                     │");
    println!("├──────────────────┼──────────────────────────────┤");
    if let Some(outputs) = result.final_output.as_object() {
        let mut ids: Vec<&String> = outputs.keys().collect();
        ids.sort();
        for id in ids {
            let provider = outputs[id]
                .get("provider")
                .and_then(|p| p.as_str())
                .unwrap_or("-");
            println!("│ {:<16} │ {:<28} │", truncate(id, 16), truncate(provider, 28));
        }
    }
    println!("└──────────────────┴──────────────────────────────┘");
    println!("   State:      {}", result.final_state);
    println!(
        "   Steps:      {} completed, {} failed",
        result.steps_completed, result.steps_failed
    );
    println!("   Cost:       ${:.6}", result.total_cost);
    println!("   Time:       {:.2}s", result.total_time);
    println!("   Confidence: {:.2}", result.avg_confidence);
}

/// Validate a workflow YAML file without executing it.
pub async fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    if let Some(version) = workflow.metadata.get("version").and_then(|v| v.as_str()) {
        println!("   Version: {}", version);
    }
    println!("   Steps: {}", workflow.step_count());
    println!("   Groups: {}", workflow.execution_order.len());
    Ok(())
}

/// Print the execution order as numbered groups.
pub async fn plan(workflow_file: &str) -> Result<(), String> {
    let workflow = load(workflow_file)?;
    println!("Execution plan for '{}':", workflow.name);
    for line in render_plan(&workflow) {
        println!("{}", line);
    }
    Ok(())
}

/// One line per group; each step shows its dependencies and flags.
pub fn render_plan(workflow: &Workflow) -> Vec<String> {
    workflow
        .execution_order
        .iter()
        .enumerate()
        .map(|(idx, group)| {
            let steps: Vec<String> = group
                .iter()
                .map(|id| match workflow.steps.get(id) {
                    Some(step) => {
                        let mut label = id.clone();
                        if !step.dependencies.is_empty() {
                            label.push_str(&format!(" <- {}", step.dependencies.join(",")));
                        }
                        if step.critical {
                            label.push_str(" [critical]");
                        }
                        label
                    }
                    None => id.clone(),
                })
                .collect();
            format!("  {}. {}", idx + 1, steps.join(" | "))
        })
        .collect()
}
