use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::EngineError;
use crate::models::WorkflowState;

/// Durable row for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub status: WorkflowState,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub step_id: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(workflow_id: &str, event_type: &str, step_id: Option<&str>, details: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            step_id: step_id.map(|s| s.to_string()),
            details,
        }
    }
}

/// Durable relational store: workflow records plus an append-only audit log.
#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub async fn create_workflow_record(
        &self,
        workflow_id: &str,
        name: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let id = workflow_id.to_string();
        let name = name.to_string();
        let metadata = serde_json::to_string(metadata)?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, status, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       metadata = excluded.metadata,
                       updated_at = excluded.updated_at",
                    rusqlite::params![id, name, WorkflowState::Pending.as_str(), metadata, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowState,
    ) -> Result<(), EngineError> {
        let id = workflow_id.to_string();
        let now = Utc::now().timestamp_millis();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status.as_str(), now, id],
                )
            })
            .await?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("workflow record {}", workflow_id)));
        }
        Ok(())
    }

    pub async fn get_workflow_record(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, metadata, created_at, updated_at
                     FROM workflows WHERE id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_record(row)))
                    .optional()
            })
            .await
    }

    pub async fn append_audit_entry(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        let e = entry.clone();
        let details = serde_json::to_string(&e.details)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (workflow_id, timestamp, event_type, step_id, details)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        e.workflow_id,
                        e.timestamp.timestamp_millis(),
                        e.event_type,
                        e.step_id,
                        details,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Audit log for a workflow, oldest first.
    pub async fn get_audit_trail(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT workflow_id, timestamp, event_type, step_id, details
                     FROM audit_log WHERE workflow_id = ?1 ORDER BY timestamp ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |row| Ok(row_to_entry(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Write an audit entry, logging instead of failing.
    pub async fn append_safe(&self, entry: AuditEntry) {
        if let Err(e) = self.append_audit_entry(&entry).await {
            tracing::warn!(
                "[AuditStore] Failed to append {} for {}: {}",
                entry.event_type,
                entry.workflow_id,
                e
            );
        }
    }
}

use rusqlite::Row;

fn row_to_record(row: &Row<'_>) -> WorkflowRecord {
    let metadata_str: String = row.get(3).unwrap_or_default();
    let created_ms: i64 = row.get(4).unwrap_or(0);
    let updated_ms: i64 = row.get(5).unwrap_or(0);

    WorkflowRecord {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        status: WorkflowState::from_str(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(WorkflowState::Pending),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}

fn row_to_entry(row: &Row<'_>) -> AuditEntry {
    let ts_ms: i64 = row.get(1).unwrap_or(0);
    let details_str: String = row.get(4).unwrap_or_default();

    AuditEntry {
        workflow_id: row.get(0).unwrap_or_default(),
        timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
        event_type: row.get(2).unwrap_or_default(),
        step_id: row.get(3).unwrap_or(None),
        details: serde_json::from_str(&details_str).unwrap_or_default(),
    }
}
