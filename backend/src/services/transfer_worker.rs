//! Background transfer worker.
//!
//! Drives jobs to a terminal state: a retryable failure waits out its backoff,
//! goes back to `PENDING` and runs again. A periodic tick picks up new jobs and
//! failed jobs whose backoff has elapsed; a second loop sweeps orphaned temp
//! files on the receiving side.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::transfer_job::{TransferJob, TransferStatus};
use crate::services::receiver_service::ReceiverService;
use crate::services::transfer_engine::{RunOutcome, TransferEngine};

const DUE_BATCH: i64 = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct TransferWorker {
    engine: TransferEngine,
    running: Mutex<HashSet<Uuid>>,
}

/// Removes the job from the running set when the drive ends, however it ends.
struct RunningGuard<'a> {
    worker: &'a TransferWorker,
    job_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.worker
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
    }
}

impl TransferWorker {
    pub fn new(engine: TransferEngine) -> Arc<Self> {
        Arc::new(Self {
            engine,
            running: Mutex::new(HashSet::new()),
        })
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    fn acquire(&self, job_id: Uuid) -> Option<RunningGuard<'_>> {
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
        inserted.then_some(RunningGuard {
            worker: self,
            job_id,
        })
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&job_id)
    }

    /// Drive `job_id` until it completes or runs out of retries.
    pub async fn drive(&self, job_id: Uuid) -> Result<TransferJob> {
        let _guard = self
            .acquire(job_id)
            .ok_or_else(|| AppError::Conflict(format!("Transfer job {} is already running", job_id)))?;

        let ledger = self.engine.ledger();
        let job = ledger.get(job_id).await?;
        if job.status == TransferStatus::Failed && !ledger.requeue(job_id).await? {
            return Ok(job);
        }

        loop {
            match self.engine.run_transfer(job_id).await? {
                RunOutcome::Completed(job) => return Ok(job),
                RunOutcome::NotClaimed => return ledger.get(job_id).await,
                RunOutcome::Failed {
                    job,
                    retry_in: None,
                } => return Ok(job),
                RunOutcome::Failed {
                    job,
                    retry_in: Some(delay),
                } => {
                    tracing::info!(
                        job_id = %job_id,
                        attempts = job.retry_count,
                        max_retries = job.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying transfer after backoff"
                    );
                    sleep(delay).await;
                    if !ledger.requeue(job_id).await? {
                        return ledger.get(job_id).await;
                    }
                }
            }
        }
    }

    /// Drive a job on its own task.
    pub fn spawn(self: &Arc<Self>, job_id: Uuid) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            match worker.drive(job_id).await {
                Ok(job) => tracing::debug!(job_id = %job_id, status = %job.status, "Transfer settled"),
                Err(AppError::Conflict(_)) => {}
                Err(e) => tracing::error!(job_id = %job_id, "Transfer worker error: {}", e),
            }
        })
    }

    /// Start every due job not already being driven.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let due = self
            .engine
            .ledger()
            .due_jobs(Utc::now(), DUE_BATCH)
            .await?;
        let mut started = 0;
        for job in due {
            if !self.is_running(job.id) {
                self.spawn(job.id);
                started += 1;
            }
        }
        Ok(started)
    }
}

/// Spawn the polling loop and the temp-file sweeper.
pub fn spawn_background(
    worker: Arc<TransferWorker>,
    receiver: Arc<ReceiverService>,
    poll_interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        loop {
            ticker.tick().await;
            match worker.tick().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(started = n, "Picked up due transfer jobs"),
                Err(e) => tracing::error!("Transfer worker tick failed: {}", e),
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match receiver.sweep(SystemTime::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "Swept orphaned temp files"),
                Err(e) => tracing::warn!("Temp file sweep failed: {}", e),
            }
        }
    });
}
