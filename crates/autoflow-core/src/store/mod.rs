pub mod audit_store;
pub mod kv_store;
pub mod working_memory;

pub use audit_store::{AuditEntry, AuditStore, WorkflowRecord};
pub use kv_store::{KvStore, MemoryKvStore};
pub use working_memory::WorkingMemory;
