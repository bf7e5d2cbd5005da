//! Audit logging service.
//!
//! Records migrations, source deletions and trust changes so operators can
//! reconstruct what happened between two instances.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    // Transfers
    FileMigrated,
    SourceDeleted,
    SourceDeleteFailed,
    PullRequested,

    // Trust
    PeerPaired,
    PeerConnected,
    PeerVerified,
    PeerUrlChanged,
    PeerRejected,
    PeerTerminated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::FileMigrated => "FILE_MIGRATED",
            AuditAction::SourceDeleted => "SOURCE_DELETED",
            AuditAction::SourceDeleteFailed => "SOURCE_DELETE_FAILED",
            AuditAction::PullRequested => "PULL_REQUESTED",
            AuditAction::PeerPaired => "PEER_PAIRED",
            AuditAction::PeerConnected => "PEER_CONNECTED",
            AuditAction::PeerVerified => "PEER_VERIFIED",
            AuditAction::PeerUrlChanged => "PEER_URL_CHANGED",
            AuditAction::PeerRejected => "PEER_REJECTED",
            AuditAction::PeerTerminated => "PEER_TERMINATED",
        }
    }
}

/// Resource types for audit logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    TransferJob,
    FileRecord,
    PeerConnection,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::TransferJob => "transfer_job",
            ResourceType::FileRecord => "file_record",
            ResourceType::PeerConnection => "peer_connection",
        }
    }
}

/// Audit log entry builder
pub struct AuditEntry {
    action: AuditAction,
    resource_type: ResourceType,
    resource_id: Option<Uuid>,
    details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, resource_type: ResourceType) -> Self {
        Self {
            action,
            resource_type,
            resource_id: None,
            details: None,
        }
    }

    pub fn resource(mut self, resource_id: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Audit log entry from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit service
#[derive(Clone)]
pub struct AuditService {
    db: SqlitePool,
}

impl AuditService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Log an audit entry
    pub async fn log(&self, entry: AuditEntry) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, action, resource_type, resource_id, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(entry.action.as_str())
        .bind(entry.resource_type.as_str())
        .bind(entry.resource_id)
        .bind(entry.details.map(|d| d.to_string()))
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(id)
    }

    /// Log without failing the caller; audit trouble must not undo real work.
    pub async fn record(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.log(entry).await {
            tracing::warn!(action = action.as_str(), "Failed to write audit entry: {}", e);
        }
    }

    /// Get audit logs for a specific resource, newest first
    pub async fn get_resource_history(
        &self,
        resource_type: ResourceType,
        resource_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT id, action, resource_type, resource_id, details, created_at
            FROM audit_log
            WHERE resource_type = ? AND resource_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(resource_type.as_str())
        .bind(resource_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_audit_action_as_str() {
        assert_eq!(AuditAction::FileMigrated.as_str(), "FILE_MIGRATED");
        assert_eq!(AuditAction::SourceDeleted.as_str(), "SOURCE_DELETED");
        assert_eq!(
            AuditAction::SourceDeleteFailed.as_str(),
            "SOURCE_DELETE_FAILED"
        );
        assert_eq!(AuditAction::PeerTerminated.as_str(), "PEER_TERMINATED");
    }

    #[test]
    fn test_resource_type_as_str() {
        assert_eq!(ResourceType::TransferJob.as_str(), "transfer_job");
        assert_eq!(ResourceType::FileRecord.as_str(), "file_record");
        assert_eq!(ResourceType::PeerConnection.as_str(), "peer_connection");
    }

    #[test]
    fn test_audit_entry_builder() {
        let id = Uuid::new_v4();
        let entry = AuditEntry::new(AuditAction::FileMigrated, ResourceType::TransferJob)
            .resource(id)
            .details(serde_json::json!({"bytes": 10}));
        assert_eq!(entry.resource_id, Some(id));
        assert!(entry.details.is_some());
    }

    #[tokio::test]
    async fn test_log_and_history() {
        let pool = db::create_memory_pool().await.unwrap();
        db::migrate(&pool).await.unwrap();
        let audit = AuditService::new(pool);
        let job = Uuid::new_v4();

        audit
            .log(
                AuditEntry::new(AuditAction::FileMigrated, ResourceType::TransferJob)
                    .resource(job)
                    .details(serde_json::json!({"peer": "cold"})),
            )
            .await
            .unwrap();
        audit
            .record(AuditEntry::new(AuditAction::PeerPaired, ResourceType::PeerConnection))
            .await;

        let history = audit
            .get_resource_history(ResourceType::TransferJob, job, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "FILE_MIGRATED");
        assert!(history[0].details.as_deref().unwrap().contains("cold"));
    }
}
