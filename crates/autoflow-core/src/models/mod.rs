pub mod agent;
pub mod failure;
pub mod llm;
pub mod task;
pub mod workflow;

pub use agent::*;
pub use failure::*;
pub use llm::*;
pub use task::*;
pub use workflow::*;
