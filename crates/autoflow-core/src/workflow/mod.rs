//! Workflow definitions: YAML in, layered `Workflow` out.
//!
//! ```text
//! flow.yaml ──► WorkflowDefinition ──► into_workflow()
//!                                          │
//!                          compute_execution_order (Kahn layers)
//!                                          │
//!                               WorkflowOrchestrator::execute_workflow
//! ```

pub mod schema;

pub use schema::{StepDefinition, WorkflowDefinition};
