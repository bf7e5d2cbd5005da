//! Receiving side of a transfer.
//!
//! Chunks land in a `.part` sibling of the target; only a checksum-verified
//! finalize renames it into place, so the final name never shows a partial
//! file. Decompression state for in-flight streams is kept per job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;
use crate::protocol::{
    RemoteFileStatus, ReceiveResponse, TransferStatusQuery, TransferStatusResponse,
    VerifyTransferRequest, VerifyTransferResponse,
};
use crate::services::chunk_codec::StreamDecompressor;
use crate::services::encryption::{self, chunk_aad};
use crate::services::identity::InstanceIdentity;
use crate::storage::{filesystem, temp_path, StorageLayout};

/// One chunk as decoded from the `/receive` request.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub job_id: Uuid,
    pub chunk_index: u64,
    pub is_final: bool,
    pub relative_path: String,
    pub path_id: i64,
    pub storage_tier: StorageTier,
    pub stream_start: bool,
    pub nonce: Option<Vec<u8>>,
    pub session_key: Option<Vec<u8>>,
    pub payload: Bytes,
}

struct StreamSlot {
    decoder: StreamDecompressor,
    last_used: Instant,
}

pub struct ReceiverService {
    layout: StorageLayout,
    identity: Arc<InstanceIdentity>,
    streams: Mutex<HashMap<Uuid, StreamSlot>>,
    part_ttl: Duration,
}

impl ReceiverService {
    pub fn new(layout: StorageLayout, identity: Arc<InstanceIdentity>, part_ttl: Duration) -> Self {
        Self {
            layout,
            identity,
            streams: Mutex::new(HashMap::new()),
            part_ttl,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    async fn paths(
        &self,
        path_id: i64,
        tier: StorageTier,
        relative: &str,
    ) -> Result<(PathBuf, PathBuf)> {
        let final_path = self.layout.resolve(path_id, tier, relative).await?;
        let temp = temp_path(&final_path);
        Ok((final_path, temp))
    }

    /// Resume probe: temp length if a transfer is underway, else whether the
    /// final file exists.
    pub async fn status(&self, query: &TransferStatusQuery) -> Result<TransferStatusResponse> {
        let (final_path, temp) = self
            .paths(query.path_id, query.storage_tier, &query.relative_path)
            .await?;

        if let Some(size) = filesystem::file_len(&temp).await? {
            return Ok(TransferStatusResponse {
                size,
                status: RemoteFileStatus::Partial,
            });
        }
        if let Some(size) = filesystem::file_len(&final_path).await? {
            return Ok(TransferStatusResponse {
                size,
                status: RemoteFileStatus::Complete,
            });
        }
        Ok(TransferStatusResponse {
            size: 0,
            status: RemoteFileStatus::NotFound,
        })
    }

    fn take_stream(&self, job_id: Uuid, stream_start: bool) -> Result<StreamDecompressor> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if stream_start {
            streams.remove(&job_id);
            return Ok(StreamDecompressor::new());
        }
        streams.remove(&job_id).map(|slot| slot.decoder).ok_or_else(|| {
            AppError::Validation(format!(
                "No open compression stream for job {}; restart the attempt",
                job_id
            ))
        })
    }

    fn put_stream(&self, job_id: Uuid, decoder: StreamDecompressor) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                job_id,
                StreamSlot {
                    decoder,
                    last_used: Instant::now(),
                },
            );
    }

    pub fn forget_stream(&self, job_id: Uuid) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn receive_chunk(&self, chunk: IncomingChunk) -> Result<ReceiveResponse> {
        let (_, temp) = self
            .paths(chunk.path_id, chunk.storage_tier, &chunk.relative_path)
            .await?;

        let compressed = match &chunk.nonce {
            Some(nonce) => {
                let key = chunk.session_key.as_deref().ok_or_else(|| {
                    AppError::Validation("Encrypted chunk without a session key".into())
                })?;
                let cipher =
                    encryption::accept_session(self.identity.agreement_secret(), key, chunk.job_id)?;
                cipher.decrypt_chunk(
                    nonce,
                    &chunk.payload,
                    &chunk_aad(chunk.job_id, chunk.chunk_index),
                )?
            }
            None => chunk.payload.to_vec(),
        };

        let mut decoder = self.take_stream(chunk.job_id, chunk.stream_start)?;
        let plain = decoder
            .decompress_chunk(&compressed, chunk.is_final)
            .map_err(|e| AppError::Validation(format!("Decompression failed: {}", e)))?;
        if !chunk.is_final {
            self.put_stream(chunk.job_id, decoder);
        }

        let truncate = chunk.chunk_index == 0;
        if !truncate && filesystem::file_len(&temp).await?.is_none() {
            return Err(AppError::Validation(format!(
                "Chunk {} for job {} continues a temp file that does not exist",
                chunk.chunk_index, chunk.job_id
            )));
        }
        let size = filesystem::write_chunk(&temp, &plain, truncate).await?;

        tracing::debug!(
            job_id = %chunk.job_id,
            chunk = chunk.chunk_index,
            is_final = chunk.is_final,
            bytes = plain.len(),
            size,
            "Chunk written"
        );

        Ok(ReceiveResponse {
            status: "ok".to_string(),
            chunk: chunk.chunk_index,
            size,
        })
    }

    /// Finalize (or, with `compare_existing`, compare against the final file).
    pub async fn verify(&self, req: &VerifyTransferRequest) -> Result<VerifyTransferResponse> {
        let (final_path, temp) = self
            .paths(req.remote_path_id, req.storage_tier, &req.relative_path)
            .await?;
        let expected = req.checksum.to_ascii_lowercase();

        if req.compare_existing {
            if filesystem::file_len(&final_path).await?.is_none() {
                return Err(AppError::NotFound(format!(
                    "{} does not exist",
                    req.relative_path
                )));
            }
            let (_, actual) = filesystem::sha256_file(&final_path).await?;
            if actual != expected {
                return Err(AppError::Corruption(format!(
                    "Existing {} differs (have {}, sender has {})",
                    req.relative_path, actual, expected
                )));
            }
            return Ok(VerifyTransferResponse {
                status: "match".to_string(),
            });
        }

        self.forget_stream(req.job_id);

        // No temp file means nothing was sent: a zero-byte transfer.
        if filesystem::file_len(&temp).await?.is_none() {
            filesystem::write_chunk(&temp, &[], true).await?;
        }

        let (size, actual) = filesystem::sha256_file(&temp).await?;
        if actual != expected {
            filesystem::remove_if_exists(&temp).await?;
            tracing::warn!(
                job_id = %req.job_id,
                path = %req.relative_path,
                expected = %expected,
                actual = %actual,
                security = true,
                "Checksum mismatch at finalize, temp file removed"
            );
            return Err(AppError::Corruption(format!(
                "Checksum mismatch for {}: expected {}, got {}",
                req.relative_path, expected, actual
            )));
        }

        filesystem::commit(&temp, &final_path).await?;
        tracing::info!(
            job_id = %req.job_id,
            path = %final_path.display(),
            size,
            "Transfer finalized"
        );
        Ok(VerifyTransferResponse {
            status: "ok".to_string(),
        })
    }

    /// Remove stale temp files and idle decoder state.
    pub async fn sweep(&self, now: SystemTime) -> Result<u64> {
        let mut removed = 0;
        for dir in self.layout.tier_dirs() {
            removed += filesystem::sweep_part_files(dir, self.part_ttl, now).await?;
        }

        let ttl = self.part_ttl;
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, slot| slot.last_used.elapsed() < ttl);

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePathConfig;
    use crate::services::chunk_codec::StreamCompressor;
    use x25519_dalek::PublicKey;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        receiver: ReceiverService,
        identity: Arc<InstanceIdentity>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let identity = Arc::new(InstanceIdentity::generate("cold", "http://cold"));
        let layout = StorageLayout::new(vec![StoragePathConfig {
            id: 1,
            hot_path: root.join("hot"),
            cold_path: root.join("cold"),
        }]);
        Fixture {
            _dir: dir,
            root,
            receiver: ReceiverService::new(layout, identity.clone(), Duration::from_secs(3600)),
            identity,
        }
    }

    fn chunk(job_id: Uuid, index: u64, is_final: bool, payload: Vec<u8>) -> IncomingChunk {
        IncomingChunk {
            job_id,
            chunk_index: index,
            is_final,
            relative_path: "dir/file.bin".into(),
            path_id: 1,
            storage_tier: StorageTier::Cold,
            stream_start: index == 0,
            nonce: None,
            session_key: None,
            payload: Bytes::from(payload),
        }
    }

    fn query() -> TransferStatusQuery {
        TransferStatusQuery {
            path_id: 1,
            relative_path: "dir/file.bin".into(),
            storage_tier: StorageTier::Cold,
        }
    }

    fn verify_req(job_id: Uuid, checksum: String) -> VerifyTransferRequest {
        VerifyTransferRequest {
            job_id,
            checksum,
            relative_path: "dir/file.bin".into(),
            remote_path_id: 1,
            storage_tier: StorageTier::Cold,
            compare_existing: false,
        }
    }

    #[tokio::test]
    async fn test_receive_and_finalize() {
        let f = fixture();
        let job = Uuid::new_v4();
        let mut tx = StreamCompressor::new();

        assert_eq!(
            f.receiver.status(&query()).await.unwrap().status,
            RemoteFileStatus::NotFound
        );

        let c0 = tx.compress_chunk(b"hello ", false).unwrap();
        f.receiver.receive_chunk(chunk(job, 0, false, c0)).await.unwrap();
        let st = f.receiver.status(&query()).await.unwrap();
        assert_eq!(st.status, RemoteFileStatus::Partial);
        assert_eq!(st.size, 6);

        let c1 = tx.compress_chunk(b"world", true).unwrap();
        f.receiver.receive_chunk(chunk(job, 1, true, c1)).await.unwrap();
        assert_eq!(f.receiver.open_streams(), 0);

        let sum = filesystem::sha256_bytes(b"hello world");
        f.receiver.verify(&verify_req(job, sum)).await.unwrap();

        let final_path = f.root.join("cold/dir/file.bin");
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!f.root.join("cold/dir/file.bin.part").exists());
        let st = f.receiver.status(&query()).await.unwrap();
        assert_eq!(st.status, RemoteFileStatus::Complete);
        assert_eq!(st.size, 11);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_temp() {
        let f = fixture();
        let job = Uuid::new_v4();
        let mut tx = StreamCompressor::new();
        let c0 = tx.compress_chunk(b"data", true).unwrap();
        f.receiver.receive_chunk(chunk(job, 0, true, c0)).await.unwrap();

        let err = f
            .receiver
            .verify(&verify_req(job, "00".repeat(32)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Corruption(_)));
        assert!(!f.root.join("cold/dir/file.bin.part").exists());
        assert!(!f.root.join("cold/dir/file.bin").exists());
    }

    #[tokio::test]
    async fn test_empty_finalize_creates_empty_file() {
        let f = fixture();
        let sum = filesystem::sha256_bytes(b"");
        f.receiver
            .verify(&verify_req(Uuid::new_v4(), sum))
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(f.root.join("cold/dir/file.bin")).await.unwrap(),
            b""
        );
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let f = fixture();
        let mut c = chunk(Uuid::new_v4(), 0, true, vec![]);
        c.relative_path = "../../etc/cron.d/x".into();
        assert!(matches!(
            f.receiver.receive_chunk(c).await,
            Err(AppError::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_target_named_like_temp_file_rejected() {
        let f = fixture();
        let job = Uuid::new_v4();
        let mut tx = StreamCompressor::new();
        let mut c = chunk(job, 0, true, tx.compress_chunk(b"data", true).unwrap());
        c.relative_path = "backup.part".into();
        assert!(matches!(
            f.receiver.receive_chunk(c).await,
            Err(AppError::Validation(_))
        ));

        let mut req = verify_req(job, filesystem::sha256_bytes(b""));
        req.relative_path = "backup.part".into();
        assert!(f.receiver.verify(&req).await.is_err());
        assert!(!f.root.join("cold/backup.part").exists());

        let mut q = query();
        q.relative_path = "backup".into();
        assert_eq!(
            f.receiver.status(&q).await.unwrap().status,
            RemoteFileStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_continuation_without_stream_rejected() {
        let f = fixture();
        let mut c = chunk(Uuid::new_v4(), 3, false, vec![1, 2, 3]);
        c.stream_start = false;
        assert!(matches!(
            f.receiver.receive_chunk(c).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypted_chunk() {
        let f = fixture();
        let job = Uuid::new_v4();
        let receiver_pub = PublicKey::from(f.identity.agreement_secret());
        let (ephemeral, cipher) =
            encryption::initiate_session(receiver_pub.as_bytes(), job).unwrap();

        let mut tx = StreamCompressor::new();
        let compressed = tx.compress_chunk(b"secret bytes", true).unwrap();
        let (nonce, sealed) = cipher.encrypt_chunk(&compressed, &chunk_aad(job, 0)).unwrap();

        let mut c = chunk(job, 0, true, sealed.clone());
        c.nonce = Some(nonce.to_vec());
        c.session_key = Some(ephemeral.to_vec());
        f.receiver.receive_chunk(c).await.unwrap();

        // Replaying the ciphertext under another index fails authentication.
        let mut replay = chunk(job, 1, true, sealed);
        replay.nonce = Some(nonce.to_vec());
        replay.session_key = Some(ephemeral.to_vec());
        replay.stream_start = true;
        assert!(matches!(
            f.receiver.receive_chunk(replay).await,
            Err(AppError::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_existing() {
        let f = fixture();
        tokio::fs::create_dir_all(f.root.join("cold/dir")).await.unwrap();
        tokio::fs::write(f.root.join("cold/dir/file.bin"), b"same")
            .await
            .unwrap();

        let mut req = verify_req(Uuid::new_v4(), filesystem::sha256_bytes(b"same"));
        req.compare_existing = true;
        assert_eq!(f.receiver.verify(&req).await.unwrap().status, "match");

        req.checksum = filesystem::sha256_bytes(b"other");
        assert!(matches!(
            f.receiver.verify(&req).await,
            Err(AppError::Corruption(_))
        ));
    }
}
