//! Intelligence routing fabric - picks a model backend per role.
//!
//! ```text
//! Task + LlmRole ──► ranked_providers (role table, scoreboard order)
//!                        │
//!          ┌─────────────┼──────────────────┐
//!   execute_with_fallback      execute_critical_task
//!   (first success wins)       (top two + cross_verify)
//!                        │
//!                   LlmBackend::call ──► record_outcome
//! ```

pub mod backend;
pub mod fabric;
pub mod scoreboard;
pub mod scoring;

pub use backend::{ApiStyle, BackendReply, HttpBackend, HttpBackendConfig, LlmBackend};
pub use fabric::{default_providers, FabricConfig, IntelligenceFabric};
pub use scoreboard::Scoreboard;
