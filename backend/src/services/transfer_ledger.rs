//! Transfer job ledger.
//!
//! Single source of truth for job state. Every transition is one guarded
//! `UPDATE`, so a crash between statements can never leave a half-applied
//! transition, and two executors racing for the same job cannot both win.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;
use crate::models::transfer_job::{
    ConflictResolution, Direction, TransferJob, TransferStatus, TransferStrategy,
};
use crate::services::retry_policy::ErrorClass;

const JOB_COLUMNS: &str = r#"
    id, file_id, peer_id, remote_path_id, relative_path, storage_tier, direction,
    strategy, conflict_resolution, status, total_size, current_size, checksum,
    start_time, end_time, throughput_bps, eta_seconds, retry_count, max_retries,
    last_error, error_class, next_attempt_at, created_at, updated_at
"#;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

#[derive(Debug, Clone)]
pub struct NewTransferJob {
    pub file_id: Uuid,
    pub peer_id: Uuid,
    pub remote_path_id: i64,
    pub relative_path: String,
    pub storage_tier: StorageTier,
    pub direction: Direction,
    pub strategy: TransferStrategy,
    pub conflict_resolution: ConflictResolution,
    pub total_size: i64,
    pub checksum: String,
    pub max_retries: i64,
}

/// How a failed attempt is written down.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub message: String,
    pub class: ErrorClass,
    /// False for attempts that never started (open circuit).
    pub counts_as_attempt: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TransferLedger {
    db: SqlitePool,
}

impl TransferLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: NewTransferJob) -> Result<TransferJob> {
        if new.total_size < 0 {
            return Err(AppError::Validation("total_size must be >= 0".into()));
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO transfer_jobs (
                id, file_id, peer_id, remote_path_id, relative_path, storage_tier,
                direction, strategy, conflict_resolution, status, total_size,
                current_size, checksum, retry_count, max_retries, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, 0, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(new.file_id)
        .bind(new.peer_id)
        .bind(new.remote_path_id)
        .bind(&new.relative_path)
        .bind(new.storage_tier)
        .bind(new.direction)
        .bind(new.strategy)
        .bind(new.conflict_resolution)
        .bind(new.total_size)
        .bind(&new.checksum)
        .bind(new.max_retries)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        self.get(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<TransferJob> {
        sqlx::query_as::<_, TransferJob>(&format!(
            "SELECT {} FROM transfer_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transfer job {} not found", id)))
    }

    pub async fn list(&self, status: Option<TransferStatus>, limit: i64) -> Result<Vec<TransferJob>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, TransferJob>(&format!(
                    "SELECT {} FROM transfer_jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                    JOB_COLUMNS
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, TransferJob>(&format!(
                    "SELECT {} FROM transfer_jobs ORDER BY created_at DESC LIMIT ?",
                    JOB_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.db)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Atomically move `PENDING -> IN_PROGRESS`. `None` if someone else has it.
    pub async fn claim(&self, id: Uuid) -> Result<Option<TransferJob>> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'IN_PROGRESS', start_time = ?, end_time = NULL,
                throughput_bps = NULL, eta_seconds = NULL, next_attempt_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await.map(Some)
    }

    /// Set where this attempt starts. Called once per attempt before streaming.
    pub async fn start_at_offset(&self, id: Uuid, offset: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfer_jobs SET current_size = ?, updated_at = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(offset)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Persist live progress; `current_size` never moves backwards here.
    pub async fn record_progress(
        &self,
        id: Uuid,
        current_size: i64,
        throughput_bps: Option<f64>,
        eta_seconds: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET current_size = MAX(current_size, MIN(?, total_size)),
                throughput_bps = ?, eta_seconds = ?, updated_at = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(current_size)
        .bind(throughput_bps)
        .bind(eta_seconds)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Record the name actually used on the peer (conflict renames).
    pub async fn set_relative_path(&self, id: Uuid, relative_path: &str) -> Result<()> {
        sqlx::query("UPDATE transfer_jobs SET relative_path = ?, updated_at = ? WHERE id = ?")
            .bind(relative_path)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<TransferJob> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'COMPLETED', current_size = total_size, end_time = ?,
                eta_seconds = 0, last_error = NULL, error_class = NULL,
                next_attempt_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Transfer job {} is not in progress",
                id
            )));
        }
        self.get(id).await
    }

    pub async fn mark_failed(&self, id: Uuid, failure: &FailureRecord) -> Result<TransferJob> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'FAILED', end_time = ?, last_error = ?, error_class = ?,
                retry_count = retry_count + ?, next_attempt_at = ?,
                eta_seconds = NULL, updated_at = ?
            WHERE id = ? AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .bind(&failure.message)
        .bind(failure.class)
        .bind(if failure.counts_as_attempt { 1i64 } else { 0i64 })
        .bind(failure.next_attempt_at)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Transfer job {} is not in progress",
                id
            )));
        }
        self.get(id).await
    }

    /// Bounded retry: `FAILED -> PENDING` while the budget lasts.
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'PENDING', next_attempt_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'FAILED' AND retry_count < max_retries
              AND (error_class IS NULL OR error_class != 'PERMANENT')
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator re-enqueue of a failed job with a fresh retry budget.
    pub async fn manual_retry(&self, id: Uuid) -> Result<TransferJob> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'PENDING', retry_count = 0, error_class = NULL,
                next_attempt_at = NULL, end_time = NULL, updated_at = ?
            WHERE id = ? AND status = 'FAILED'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            let job = self.get(id).await?;
            return Err(AppError::Conflict(format!(
                "Only failed jobs can be retried (job is {})",
                job.status
            )));
        }
        self.get(id).await
    }

    /// Jobs the scheduler should start now: pending ones, and failed ones
    /// whose backoff has elapsed.
    pub async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TransferJob>> {
        let candidates = sqlx::query_as::<_, TransferJob>(&format!(
            r#"
            SELECT {} FROM transfer_jobs
            WHERE status = 'PENDING'
               OR (status = 'FAILED' AND next_attempt_at IS NOT NULL
                   AND retry_count < max_retries)
            ORDER BY created_at
            LIMIT ?
            "#,
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(candidates
            .into_iter()
            .filter(|job| match job.status {
                TransferStatus::Pending => true,
                _ => job.next_attempt_at.map(|t| t <= now).unwrap_or(false),
            })
            .collect())
    }

    /// Crash recovery: nothing can be running at startup.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'FAILED', error_class = 'TRANSIENT', last_error = ?,
                end_time = ?, retry_count = retry_count + 1,
                next_attempt_at = CASE WHEN retry_count + 1 < max_retries THEN ? ELSE NULL END,
                updated_at = ?
            WHERE status = 'IN_PROGRESS'
            "#,
        )
        .bind(INTERRUPTED_MESSAGE)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
