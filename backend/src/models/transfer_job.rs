//! Transfer job model: one file moving to or from one peer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::file_record::StorageTier;
use crate::services::retry_policy::ErrorClass;

/// Lifecycle status of a transfer job.
///
/// `PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}`, plus `FAILED -> PENDING`
/// while the retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStrategy {
    Copy,
    Move,
}

/// What to do when the target already exists on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolution {
    Skip,
    Overwrite,
    Rename,
    Compare,
}

/// Transfer job entity.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TransferJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub peer_id: Uuid,
    pub remote_path_id: i64,
    pub relative_path: String,
    pub storage_tier: StorageTier,
    pub direction: Direction,
    pub strategy: TransferStrategy,
    pub conflict_resolution: ConflictResolution,
    pub status: TransferStatus,
    pub total_size: i64,
    pub current_size: i64,
    pub checksum: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub throughput_bps: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.current_size as f64 / self.total_size as f64) * 100.0
    }
}

/// Instantaneous throughput (bytes/s) and ETA (s) for a running job.
///
/// Returns `(None, None)` until there is enough elapsed time to measure.
pub fn compute_rate(
    bytes_this_attempt: u64,
    elapsed_secs: f64,
    current_size: i64,
    total_size: i64,
) -> (Option<f64>, Option<f64>) {
    if elapsed_secs <= 0.0 || bytes_this_attempt == 0 {
        return (None, None);
    }
    let throughput = bytes_this_attempt as f64 / elapsed_secs;
    let remaining = (total_size - current_size).max(0) as f64;
    (Some(throughput), Some(remaining / throughput))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_rate_basic() {
        let (tp, eta) = compute_rate(1_000, 2.0, 1_000, 3_000);
        assert_eq!(tp, Some(500.0));
        assert_eq!(eta, Some(4.0));
    }

    #[test]
    fn test_compute_rate_no_elapsed_time() {
        assert_eq!(compute_rate(1_000, 0.0, 1_000, 3_000), (None, None));
    }

    #[test]
    fn test_compute_rate_done_has_zero_eta() {
        let (_, eta) = compute_rate(3_000, 1.0, 3_000, 3_000);
        assert_eq!(eta, Some(0.0));
    }

    #[test]
    fn test_status_terminal() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
    }
}
