//! Autoflow Core - multi-agent workflow orchestration engine.
//!
//! A workflow is a dependency graph of steps, layered into groups that run
//! concurrently. Each step gets a short-lived agent whose tool grant follows
//! its trust level; the agent reasons through a role-routed set of model
//! providers and runs tools. Failures are classified and walked up a
//! recovery ladder before the workflow is failed.
//!
//! The crate has no CLI or HTTP dependency; the `autoflow` binary lives in
//! `autoflow-cli`.

pub mod agents;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod intelligence;
pub mod models;
pub mod orchestration;
pub mod state;
pub mod store;
pub mod tools;
pub mod worker;
pub mod workflow;

// Convenience re-exports
pub use agents::AgentManager;
pub use config::EngineConfig;
pub use db::Database;
pub use error::{EngineError, Result};
pub use orchestration::{OrchestratorConfig, WorkflowOrchestrator};
pub use state::{AppState, AppStateInner};
pub use workflow::WorkflowDefinition;
