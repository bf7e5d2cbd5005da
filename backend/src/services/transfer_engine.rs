//! Transfer engine: drives one job attempt from claim to terminal state.
//!
//! An attempt is: claim the job, gate on the peer's circuit breaker, ask the
//! peer how much of the target it already has, stream the remainder in
//! compressed (and, over plain HTTP, encrypted) chunks, then ask the peer to
//! verify and commit. The engine is the only place that decides between
//! retrying and failing for good.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;
use crate::models::peer_connection::PeerConnection;
use crate::models::transfer_job::{
    compute_rate, ConflictResolution, Direction, TransferJob, TransferStrategy,
};
use crate::protocol::{PullRequest, RemoteFileStatus, TransferStatusQuery, VerifyTransferRequest};
use crate::services::audit_service::{AuditAction, AuditEntry, AuditService, ResourceType};
use crate::services::chunk_codec::StreamCompressor;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::encryption::{self, chunk_aad, SessionCipher};
use crate::services::file_record_service::FileRecordService;
use crate::services::peer_client::{ChunkMeta, PeerClient};
use crate::services::retry_policy::{classify, ErrorClass, RetryPolicy};
use crate::services::transfer_ledger::{FailureRecord, NewTransferJob, TransferLedger};
use crate::services::trust_store::TrustStore;
use crate::storage::{filesystem, numbered_variant, StorageLayout};

/// Upper bound on `name (n).ext` probes for the rename policy.
const MAX_RENAME_PROBES: u32 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub file_id: Uuid,
    pub peer_id: Uuid,
    pub remote_path_id: i64,
    pub relative_path: String,
    pub storage_tier: StorageTier,
    pub direction: Direction,
    pub strategy: TransferStrategy,
    pub conflict_resolution: ConflictResolution,
}

/// What one `run_transfer` call did.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(TransferJob),
    /// `retry_in` is set when the job will be eligible again.
    Failed {
        job: TransferJob,
        retry_in: Option<Duration>,
    },
    /// The job was not `PENDING`; another executor owns it or it is done.
    NotClaimed,
}

/// How a successful attempt got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Transferred { bytes: u64 },
    /// Peer already holds an identical file.
    Identical,
    /// `SKIP` on a `COPY`: nothing sent, nothing to delete.
    Skipped,
    PullAccepted { remote_job: Uuid },
}

/// TLS already protects the channel; otherwise chunks are sealed end to end.
fn uses_tls(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| u.scheme() == "https")
        .unwrap_or(false)
}

/// Where the bytes go for this attempt.
struct PushTarget {
    relative_path: String,
    offset: u64,
}

#[derive(Clone)]
pub struct TransferEngine {
    ledger: TransferLedger,
    files: FileRecordService,
    trust_store: TrustStore,
    audit: AuditService,
    client: PeerClient,
    breakers: Arc<CircuitBreakerRegistry>,
    layout: StorageLayout,
    settings: EngineSettings,
}

impl TransferEngine {
    pub fn new(
        db: SqlitePool,
        client: PeerClient,
        breakers: Arc<CircuitBreakerRegistry>,
        layout: StorageLayout,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger: TransferLedger::new(db.clone()),
            files: FileRecordService::new(db.clone()),
            trust_store: TrustStore::new(db.clone()),
            audit: AuditService::new(db),
            client,
            breakers,
            layout,
            settings,
        }
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    /// Persist a new `PENDING` job. Touches the local disk, never the network.
    pub async fn create_job(&self, req: CreateJob) -> Result<TransferJob> {
        let file = self.files.get(req.file_id).await?;
        let peer = self.trust_store.get(req.peer_id).await?;
        crate::storage::validate_relative(&req.relative_path)?;

        let (total_size, checksum) = match req.direction {
            Direction::Push => {
                if file.removed {
                    return Err(AppError::Validation(format!(
                        "File {} is no longer on this instance",
                        file.path
                    )));
                }
                self.files.size_and_checksum(&file).await?
            }
            Direction::Pull => {
                if !peer.effective_bidirectional() {
                    return Err(AppError::Validation(format!(
                        "Pull from {} needs bidirectional mode on both instances",
                        peer.name
                    )));
                }
                (file.size, file.checksum.clone().unwrap_or_default())
            }
        };

        let job = self
            .ledger
            .insert(NewTransferJob {
                file_id: file.id,
                peer_id: peer.id,
                remote_path_id: req.remote_path_id,
                relative_path: req.relative_path,
                storage_tier: req.storage_tier,
                direction: req.direction,
                strategy: req.strategy,
                conflict_resolution: req.conflict_resolution,
                total_size,
                checksum,
                max_retries: i64::from(self.settings.retry.max_retries),
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            peer = %peer.name,
            direction = ?job.direction,
            size = job.total_size,
            "Transfer job created"
        );
        Ok(job)
    }

    /// Run one attempt of `job_id` and record the result in the ledger.
    ///
    /// Errors returned here are ledger failures; attempt failures are written
    /// to the job and reported as `RunOutcome::Failed`.
    pub async fn run_transfer(&self, job_id: Uuid) -> Result<RunOutcome> {
        let Some(job) = self.ledger.claim(job_id).await? else {
            return Ok(RunOutcome::NotClaimed);
        };

        let breaker = self.breakers.get(job.peer_id);
        if !breaker.can_attempt() {
            let wait = breaker
                .retry_after()
                .unwrap_or(self.settings.retry.base_delay);
            let failure = FailureRecord {
                message: format!("Circuit open for peer {}", job.peer_id),
                class: ErrorClass::CircuitOpen,
                counts_as_attempt: false,
                next_attempt_at: Some(Utc::now() + chrono_duration(wait)),
            };
            let job = self.ledger.mark_failed(job.id, &failure).await?;
            tracing::warn!(job_id = %job.id, peer_id = %job.peer_id, "Circuit open, attempt skipped");
            return Ok(RunOutcome::Failed {
                job,
                retry_in: Some(wait),
            });
        }

        tracing::info!(
            job_id = %job.id,
            attempt = job.retry_count + 1,
            max_retries = job.max_retries,
            "Starting transfer attempt"
        );

        match self.attempt(&job).await {
            Ok(outcome) => {
                breaker.record_success();
                let completed = self.finish(&job, outcome).await?;
                Ok(RunOutcome::Completed(completed))
            }
            Err(err) => {
                let class = classify(&err);
                if matches!(class, ErrorClass::Transient | ErrorClass::RateLimited) {
                    breaker.record_failure();
                }

                let attempt = u32::try_from(job.retry_count).unwrap_or(u32::MAX);
                let retry_in = self
                    .settings
                    .retry
                    .should_retry(class, attempt.saturating_add(1))
                    .then(|| self.settings.retry.delay_for(class, attempt));

                if err.is_security() {
                    tracing::error!(job_id = %job.id, class = %class, security = true, "Transfer failed: {}", err);
                } else {
                    tracing::warn!(job_id = %job.id, class = %class, "Transfer failed: {}", err);
                }

                let failure = FailureRecord {
                    message: err.to_string(),
                    class,
                    counts_as_attempt: true,
                    next_attempt_at: retry_in.map(|d| Utc::now() + chrono_duration(d)),
                };
                let job = self.ledger.mark_failed(job.id, &failure).await?;
                Ok(RunOutcome::Failed {
                    retry_in: retry_in.filter(|_| job.has_retries_left()),
                    job,
                })
            }
        }
    }

    async fn attempt(&self, job: &TransferJob) -> Result<AttemptOutcome> {
        let peer = self.trust_store.get(job.peer_id).await?;
        if !peer.is_trusted() {
            return Err(AppError::Authentication(format!(
                "Peer {} is {}, not trusted",
                peer.name, peer.trust_status
            )));
        }
        match job.direction {
            Direction::Push => self.push(job, &peer).await,
            Direction::Pull => self.request_pull(job, &peer).await,
        }
    }

    async fn push(&self, job: &TransferJob, peer: &PeerConnection) -> Result<AttemptOutcome> {
        let file = self.files.get(job.file_id).await?;
        let source = Path::new(&file.path);
        let on_disk = filesystem::file_len(source)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Source file {} is missing", file.path)))?;
        if on_disk as i64 != job.total_size {
            return Err(AppError::Corruption(format!(
                "Source {} is {} bytes, job expects {}",
                file.path, on_disk, job.total_size
            )));
        }
        let total = on_disk;

        let target = match self.resolve_target(job, peer, total).await? {
            Ok(target) => target,
            Err(done) => return Ok(done),
        };
        if target.relative_path != job.relative_path {
            self.ledger
                .set_relative_path(job.id, &target.relative_path)
                .await?;
        }

        self.ledger
            .start_at_offset(job.id, target.offset as i64)
            .await?;
        let bytes = if target.offset < total {
            self.stream_chunks(job, peer, source, &target, total).await?
        } else {
            0
        };

        self.client
            .verify_transfer(
                peer,
                &VerifyTransferRequest {
                    job_id: job.id,
                    checksum: job.checksum.clone(),
                    relative_path: target.relative_path.clone(),
                    remote_path_id: job.remote_path_id,
                    storage_tier: job.storage_tier,
                    compare_existing: false,
                },
            )
            .await?;

        Ok(AttemptOutcome::Transferred { bytes })
    }

    /// Work out where to write and from which offset, applying the conflict
    /// policy when the target already exists. `Err(outcome)` means the job is
    /// done without sending anything.
    async fn resolve_target(
        &self,
        job: &TransferJob,
        peer: &PeerConnection,
        total: u64,
    ) -> Result<std::result::Result<PushTarget, AttemptOutcome>> {
        let status = self
            .remote_status(peer, job, &job.relative_path, total)
            .await?;
        let existing = match status {
            Some(offset) => {
                return Ok(Ok(PushTarget {
                    relative_path: job.relative_path.clone(),
                    offset,
                }))
            }
            None => &job.relative_path,
        };

        let compare_first = match job.conflict_resolution {
            ConflictResolution::Overwrite => {
                return Ok(Ok(PushTarget {
                    relative_path: existing.clone(),
                    offset: 0,
                }))
            }
            ConflictResolution::Skip if job.strategy == TransferStrategy::Copy => {
                tracing::info!(job_id = %job.id, path = %existing, "Target exists, skipping");
                return Ok(Err(AttemptOutcome::Skipped));
            }
            ConflictResolution::Skip | ConflictResolution::Compare => true,
            ConflictResolution::Rename => false,
        };

        if compare_first && self.remote_matches(job, peer, existing).await? {
            tracing::info!(job_id = %job.id, path = %existing, "Peer already has an identical file");
            return Ok(Err(AttemptOutcome::Identical));
        }

        for n in 1..=MAX_RENAME_PROBES {
            let candidate = numbered_variant(&job.relative_path, n);
            if let Some(offset) = self.remote_status(peer, job, &candidate, total).await? {
                tracing::info!(job_id = %job.id, path = %candidate, "Target exists, writing under a new name");
                return Ok(Ok(PushTarget {
                    relative_path: candidate,
                    offset,
                }));
            }
        }
        Err(AppError::Conflict(format!(
            "No free name for {} after {} attempts",
            job.relative_path, MAX_RENAME_PROBES
        )))
    }

    /// Resume offset for `relative`, or `None` if a finished file is there.
    async fn remote_status(
        &self,
        peer: &PeerConnection,
        job: &TransferJob,
        relative: &str,
        total: u64,
    ) -> Result<Option<u64>> {
        let status = self
            .client
            .transfer_status(
                peer,
                &TransferStatusQuery {
                    path_id: job.remote_path_id,
                    relative_path: relative.to_string(),
                    storage_tier: job.storage_tier,
                },
            )
            .await?;

        match status.status {
            RemoteFileStatus::NotFound => Ok(Some(0)),
            RemoteFileStatus::Partial if status.size > total => Err(AppError::Corruption(format!(
                "Peer holds {} bytes of {}, more than the {} byte source",
                status.size, relative, total
            ))),
            RemoteFileStatus::Partial => {
                if status.size > 0 {
                    tracing::info!(job_id = %job.id, offset = status.size, "Resuming from peer offset");
                }
                Ok(Some(status.size))
            }
            RemoteFileStatus::Complete => Ok(None),
        }
    }

    async fn remote_matches(
        &self,
        job: &TransferJob,
        peer: &PeerConnection,
        relative: &str,
    ) -> Result<bool> {
        let result = self
            .client
            .verify_transfer(
                peer,
                &VerifyTransferRequest {
                    job_id: job.id,
                    checksum: job.checksum.clone(),
                    relative_path: relative.to_string(),
                    remote_path_id: job.remote_path_id,
                    storage_tier: job.storage_tier,
                    compare_existing: true,
                },
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(AppError::Corruption(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send `[offset, total)` of `source`. Chunks go out strictly one after
    /// another; each is acknowledged before the next is read.
    async fn stream_chunks(
        &self,
        job: &TransferJob,
        peer: &PeerConnection,
        source: &Path,
        target: &PushTarget,
        total: u64,
    ) -> Result<u64> {
        let session = if uses_tls(&peer.base_url) {
            None
        } else {
            let key = peer.agreement_public_key.as_deref().ok_or_else(|| {
                AppError::Security(format!(
                    "Peer {} has no agreement key for an encrypted transfer",
                    peer.name
                ))
            })?;
            Some(encryption::initiate_session(key, job.id)?)
        };

        let chunk_size = self.settings.chunk_size.max(1) as u64;
        let mut file = tokio::fs::File::open(source).await?;
        file.seek(SeekFrom::Start(target.offset)).await?;

        let mut compressor = StreamCompressor::new();
        let mut buf = vec![0u8; chunk_size as usize];
        let mut index = target.offset.div_ceil(chunk_size);
        let mut sent = target.offset;
        let started = Instant::now();

        while sent < total {
            let len = (total - sent).min(chunk_size) as usize;
            file.read_exact(&mut buf[..len]).await?;
            let is_final = sent + len as u64 == total;

            let compressed = compressor.compress_chunk(&buf[..len], is_final)?;
            let (payload, nonce) = match &session {
                Some((_, cipher)) => seal_chunk(cipher, job.id, index, &compressed)?,
                None => (compressed, None),
            };

            let meta = ChunkMeta {
                job_id: job.id,
                chunk_index: index,
                is_final,
                relative_path: target.relative_path.clone(),
                path_id: job.remote_path_id,
                storage_tier: job.storage_tier,
                stream_start: sent == target.offset,
                nonce,
                session_key: session.as_ref().map(|(key, _)| *key),
            };
            self.client.send_chunk(peer, &meta, payload).await?;

            sent += len as u64;
            index += 1;
            let (throughput, eta) = compute_rate(
                sent - target.offset,
                started.elapsed().as_secs_f64(),
                sent as i64,
                total as i64,
            );
            self.ledger
                .record_progress(job.id, sent as i64, throughput, eta)
                .await?;
            tracing::debug!(job_id = %job.id, chunk = index - 1, offset = sent, "Chunk acknowledged");
        }

        Ok(sent - target.offset)
    }

    async fn request_pull(&self, job: &TransferJob, peer: &PeerConnection) -> Result<AttemptOutcome> {
        if !peer.effective_bidirectional() {
            return Err(AppError::Validation(format!(
                "Pull from {} needs bidirectional mode on both instances",
                peer.name
            )));
        }
        let file = self.files.get(job.file_id).await?;
        let local = self.layout.locate(Path::new(&file.path)).ok_or_else(|| {
            AppError::Validation(format!(
                "{} is not inside a configured storage path",
                file.path
            ))
        })?;

        let response = self
            .client
            .pull_request(
                peer,
                &PullRequest {
                    relative_path: job.relative_path.clone(),
                    source_path_id: job.remote_path_id,
                    source_tier: job.storage_tier,
                    target_path_id: local.path_id,
                    target_relative_path: local.relative_path,
                    target_tier: local.tier,
                    strategy: job.strategy,
                    conflict_resolution: job.conflict_resolution,
                },
            )
            .await?;
        Ok(AttemptOutcome::PullAccepted {
            remote_job: response.job_id,
        })
    }

    async fn finish(&self, job: &TransferJob, outcome: AttemptOutcome) -> Result<TransferJob> {
        let completed = self.ledger.mark_completed(job.id).await?;
        tracing::info!(job_id = %job.id, outcome = ?outcome, "Transfer completed");

        let moved = job.direction == Direction::Push
            && job.strategy == TransferStrategy::Move
            && matches!(
                outcome,
                AttemptOutcome::Transferred { .. } | AttemptOutcome::Identical
            );
        if moved {
            // The ledger already says COMPLETED; a bookkeeping error here must not undo that.
            if let Err(e) = self.remove_source(job).await {
                tracing::error!(
                    job_id = %job.id,
                    file_id = %job.file_id,
                    "Move committed but source cleanup failed: {}",
                    e
                );
            }
        }

        let details = match outcome {
            AttemptOutcome::Transferred { bytes } => serde_json::json!({
                "peer_id": job.peer_id,
                "relative_path": completed.relative_path,
                "bytes_sent": bytes,
                "strategy": job.strategy,
            }),
            AttemptOutcome::Identical | AttemptOutcome::Skipped => serde_json::json!({
                "peer_id": job.peer_id,
                "relative_path": completed.relative_path,
                "bytes_sent": 0,
                "strategy": job.strategy,
                "already_present": true,
            }),
            AttemptOutcome::PullAccepted { remote_job } => serde_json::json!({
                "peer_id": job.peer_id,
                "remote_job_id": remote_job,
            }),
        };
        let action = match outcome {
            AttemptOutcome::PullAccepted { .. } => AuditAction::PullRequested,
            _ => AuditAction::FileMigrated,
        };
        self.audit
            .record(
                AuditEntry::new(action, ResourceType::TransferJob)
                    .resource(job.id)
                    .details(details),
            )
            .await;

        Ok(completed)
    }

    /// Delete the local copy after a committed move. A failure here leaves
    /// the file on both instances, which is logged but never retried.
    async fn remove_source(&self, job: &TransferJob) -> Result<()> {
        let file = self.files.get(job.file_id).await?;
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => {
                self.files.mark_removed(file.id).await?;
                self.audit
                    .record(
                        AuditEntry::new(AuditAction::SourceDeleted, ResourceType::FileRecord)
                            .resource(file.id)
                            .details(serde_json::json!({ "path": file.path, "job_id": job.id })),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    path = %file.path,
                    "Move committed on peer but local source could not be deleted: {}",
                    e
                );
                self.audit
                    .record(
                        AuditEntry::new(AuditAction::SourceDeleteFailed, ResourceType::FileRecord)
                            .resource(file.id)
                            .details(serde_json::json!({
                                "path": file.path,
                                "job_id": job.id,
                                "error": e.to_string(),
                            })),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Serve a peer's pull: find the file here and queue a push back to it.
    pub async fn accept_pull(&self, requester: &PeerConnection, req: &PullRequest) -> Result<TransferJob> {
        if !requester.effective_bidirectional() {
            return Err(AppError::Validation(format!(
                "Pulls from {} are not allowed in push-only mode",
                requester.name
            )));
        }
        let source = self
            .layout
            .resolve(req.source_path_id, req.source_tier, &req.relative_path)
            .await?;
        let record = self.files.register(&source, req.source_tier).await?;

        let job = self
            .create_job(CreateJob {
                file_id: record.id,
                peer_id: requester.id,
                remote_path_id: req.target_path_id,
                relative_path: req.target_relative_path.clone(),
                storage_tier: req.target_tier,
                direction: Direction::Push,
                strategy: req.strategy,
                conflict_resolution: req.conflict_resolution,
            })
            .await?;

        self.audit
            .record(
                AuditEntry::new(AuditAction::PullRequested, ResourceType::TransferJob)
                    .resource(job.id)
                    .details(serde_json::json!({
                        "requested_by": requester.fingerprint,
                        "path": source.display().to_string(),
                    })),
            )
            .await;
        Ok(job)
    }
}

fn seal_chunk(
    cipher: &SessionCipher,
    job_id: Uuid,
    index: u64,
    compressed: &[u8],
) -> Result<(Vec<u8>, Option<[u8; encryption::NONCE_LEN]>)> {
    let (nonce, ciphertext) = cipher.encrypt_chunk(compressed, &chunk_aad(job_id, index))?;
    Ok((ciphertext, Some(nonce)))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}
