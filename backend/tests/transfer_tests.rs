//! End-to-end transfer tests.
//!
//! Each test starts real instances on 127.0.0.1 (or a scripted peer that
//! records what it receives) and drives jobs through the engine and worker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::fixtures::{noise, sha256_hex, trusted_peer_at, trusted_peer_for, MIB};
use common::{eventually, pair, serve_mock, TestInstance, PATH_ID};
use fridge_backend::models::file_record::StorageTier;
use fridge_backend::models::peer_connection::TransferMode;
use fridge_backend::models::transfer_job::{
    ConflictResolution, Direction, TransferStatus, TransferStrategy,
};
use fridge_backend::protocol::*;
use fridge_backend::services::audit_service::ResourceType;
use fridge_backend::services::chunk_codec::StreamDecompressor;
use fridge_backend::services::encryption::{accept_session, chunk_aad};
use fridge_backend::services::identity::InstanceIdentity;
use fridge_backend::services::retry_policy::ErrorClass;
use fridge_backend::services::transfer_engine::{CreateJob, RunOutcome};
use fridge_backend::storage::temp_path;
use uuid::Uuid;

fn push(
    file_id: Uuid,
    peer_id: Uuid,
    relative_path: &str,
    strategy: TransferStrategy,
    conflict_resolution: ConflictResolution,
) -> CreateJob {
    CreateJob {
        file_id,
        peer_id,
        remote_path_id: PATH_ID,
        relative_path: relative_path.to_string(),
        storage_tier: StorageTier::Cold,
        direction: Direction::Push,
        strategy,
        conflict_resolution,
    }
}

// --- Scripted peer ---

#[derive(Debug, Clone)]
struct SeenChunk {
    index: u64,
    is_final: bool,
    stream_start: bool,
    encrypted: bool,
    /// Decrypted and inflated length, when the script holds the peer's keys.
    plain_len: Option<usize>,
}

#[derive(Default)]
struct Script {
    /// Bytes the peer claims to already hold.
    partial: u64,
    fail_verify: bool,
    identity: Option<Arc<InstanceIdentity>>,
    decoder: Mutex<Option<StreamDecompressor>>,
    chunks: Mutex<Vec<SeenChunk>>,
    verifies: Mutex<Vec<VerifyTransferRequest>>,
}

impl Script {
    /// Undo encryption and compression the way a real receiver would.
    fn open_chunk(&self, headers: &HeaderMap, index: u64, body: &[u8]) -> Option<usize> {
        let identity = self.identity.as_ref()?;
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let job_id = Uuid::parse_str(header(HEADER_JOB_ID)?).unwrap();
        let nonce = STANDARD.decode(header(HEADER_NONCE)?).unwrap();
        let session_key = STANDARD.decode(header(HEADER_SESSION_KEY)?).unwrap();

        let cipher = accept_session(identity.agreement_secret(), &session_key, job_id).unwrap();
        let compressed = cipher
            .decrypt_chunk(&nonce, body, &chunk_aad(job_id, index))
            .unwrap();

        let mut decoder = self.decoder.lock().unwrap();
        if header(HEADER_STREAM_START) == Some("1") {
            *decoder = Some(StreamDecompressor::new());
        }
        let is_final = header(HEADER_FINAL) == Some("1");
        let plain = decoder
            .as_mut()
            .expect("continuation without a stream start")
            .decompress_chunk(&compressed, is_final)
            .unwrap();
        Some(plain.len())
    }
}

fn mock_router(script: Arc<Script>) -> Router {
    Router::new()
        .route(PATH_TRANSFER_STATUS, get(mock_status))
        .route(PATH_RECEIVE, post(mock_receive))
        .route(PATH_VERIFY_TRANSFER, post(mock_verify))
        .with_state(script)
}

async fn mock_status(State(script): State<Arc<Script>>) -> Json<TransferStatusResponse> {
    let status = if script.partial > 0 {
        RemoteFileStatus::Partial
    } else {
        RemoteFileStatus::NotFound
    };
    Json(TransferStatusResponse {
        size: script.partial,
        status,
    })
}

async fn mock_receive(
    State(script): State<Arc<Script>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ReceiveResponse> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let index: u64 = value(HEADER_CHUNK_INDEX).parse().unwrap();
    let plain_len = script.open_chunk(&headers, index, &body);
    script.chunks.lock().unwrap().push(SeenChunk {
        index,
        is_final: value(HEADER_FINAL) == "1",
        stream_start: value(HEADER_STREAM_START) == "1",
        encrypted: headers.contains_key(HEADER_NONCE) && headers.contains_key(HEADER_SESSION_KEY),
        plain_len,
    });
    Json(ReceiveResponse {
        status: "ok".to_string(),
        chunk: index,
        size: 0,
    })
}

async fn mock_verify(State(script): State<Arc<Script>>, body: Bytes) -> Response {
    let request: VerifyTransferRequest = serde_json::from_slice(&body).unwrap();
    script.verifies.lock().unwrap().push(request);
    if script.fail_verify {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "code": "CHECKSUM_MISMATCH",
                "message": "Checksum mismatch",
            })),
        )
            .into_response()
    } else {
        Json(VerifyTransferResponse {
            status: "ok".to_string(),
        })
        .into_response()
    }
}

// --- Against a scripted peer ---

#[tokio::test]
async fn test_push_splits_into_chunks_and_encrypts_over_http() {
    let hot = TestInstance::start("hot").await;
    let remote = Arc::new(InstanceIdentity::generate("mock", "http://mock"));
    let script = Arc::new(Script {
        identity: Some(remote.clone()),
        ..Script::default()
    });
    let (url, _server) = serve_mock(mock_router(script.clone())).await;
    let peer = trusted_peer_for(&hot.state.trust_store, &remote).await;
    let peer = hot.state.trust_store.update_url(peer.id, &url).await.unwrap();

    let data = noise(5 * MIB / 2, 1);
    let file = hot.add_file("big.bin", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "archive/big.bin",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();
    assert_eq!(job.checksum, sha256_hex(&data));

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.current_size, data.len() as i64);
    assert_eq!(done.progress_percent(), 100.0);

    let chunks = script.chunks.lock().unwrap().clone();
    assert_eq!(
        chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        chunks.iter().map(|c| c.is_final).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert!(chunks[0].stream_start);
    assert!(!chunks[1].stream_start && !chunks[2].stream_start);
    assert!(chunks.iter().all(|c| c.encrypted));
    assert_eq!(
        chunks.iter().map(|c| c.plain_len).collect::<Vec<_>>(),
        vec![Some(MIB), Some(MIB), Some(MIB / 2)]
    );

    let verifies = script.verifies.lock().unwrap();
    assert_eq!(verifies.len(), 1);
    assert_eq!(verifies[0].checksum, job.checksum);
    assert!(!verifies[0].compare_existing);
}

#[tokio::test]
async fn test_checksum_rejection_fails_job_and_keeps_move_source() {
    let hot = TestInstance::start("hot").await;
    let script = Arc::new(Script {
        fail_verify: true,
        ..Script::default()
    });
    let (url, _server) = serve_mock(mock_router(script.clone())).await;
    let peer = trusted_peer_at(&hot.state.trust_store, "mock", &url).await;

    let file = hot.add_file("report.pdf", &noise(4096, 2)).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "report.pdf",
            TransferStrategy::Move,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();

    let outcome = hot.state.engine().run_transfer(job.id).await.unwrap();
    let RunOutcome::Failed { job, retry_in } = outcome else {
        panic!("expected a failed attempt, got {:?}", outcome);
    };
    assert!(retry_in.is_none());
    assert_eq!(job.status, TransferStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.error_class, Some(ErrorClass::Permanent));
    assert!(job.last_error.unwrap().contains("CHECKSUM_MISMATCH"));

    assert!(tokio::fs::metadata(&file.path).await.is_ok());
    let record = hot.state.files.get(file.id).await.unwrap();
    assert!(!record.removed);
}

#[tokio::test]
async fn test_resume_starts_after_the_partial_offset() {
    let hot = TestInstance::start("hot").await;
    let script = Arc::new(Script {
        partial: MIB as u64,
        ..Script::default()
    });
    let (url, _server) = serve_mock(mock_router(script.clone())).await;
    let peer = trusted_peer_at(&hot.state.trust_store, "mock", &url).await;

    let data = noise(5 * MIB / 2, 3);
    let file = hot.add_file("resume.bin", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "resume.bin",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);

    let chunks = script.chunks.lock().unwrap().clone();
    assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2]);
    assert!(chunks[0].stream_start);
    assert!(chunks[1].is_final);
}

#[tokio::test]
async fn test_unreachable_peer_exhausts_retries() {
    let hot = TestInstance::start_with("hot", |c| c.max_retries = 2).await;
    // Nothing listens on the discard port.
    let peer = trusted_peer_at(&hot.state.trust_store, "gone", "http://127.0.0.1:9").await;

    let file = hot.add_file("lost.bin", b"payload").await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "lost.bin",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();
    assert_eq!(job.max_retries, 2);

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(done.error_class, Some(ErrorClass::Transient));
    assert!(done.next_attempt_at.is_none());
    assert_eq!(hot.state.breakers.get(peer.id).failure_count(), 2);
}

// --- Between two real instances ---

#[tokio::test]
async fn test_push_between_instances() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let data = noise(5 * MIB / 2, 4);
    let file = hot.add_file("videos/clip.mp4", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "archive/clip.mp4",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);

    let stored = cold.stored(StorageTier::Cold, "archive/clip.mp4");
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), data);
    assert!(tokio::fs::metadata(temp_path(&stored)).await.is_err());
    assert_eq!(cold.state.receiver.open_streams(), 0);

    // COPY leaves the source alone.
    assert_eq!(tokio::fs::read(&file.path).await.unwrap(), data);

    let history = hot
        .state
        .audit
        .get_resource_history(ResourceType::TransferJob, job.id, 10)
        .await
        .unwrap();
    assert!(history.iter().any(|e| e.action == "FILE_MIGRATED"));
}

#[tokio::test]
async fn test_resume_appends_to_existing_part_file() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let data = noise(5 * MIB / 2, 5);
    let stored = cold.stored(StorageTier::Cold, "resume.bin");
    tokio::fs::write(temp_path(&stored), &data[..MIB]).await.unwrap();

    let file = hot.add_file("resume.bin", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "resume.bin",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), data);
}

#[tokio::test]
async fn test_move_deletes_source_after_commit() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let data = noise(300_000, 6);
    let file = hot.add_file("old/scan.tiff", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "scans/scan.tiff",
            TransferStrategy::Move,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);

    assert_eq!(
        tokio::fs::read(cold.stored(StorageTier::Cold, "scans/scan.tiff"))
            .await
            .unwrap(),
        data
    );
    assert!(tokio::fs::metadata(&file.path).await.is_err());
    assert!(hot.state.files.get(file.id).await.unwrap().removed);
}

#[tokio::test]
async fn test_empty_file_transfer() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let file = hot.add_file("empty.txt", b"").await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "empty.txt",
            TransferStrategy::Copy,
            ConflictResolution::Overwrite,
        ))
        .await
        .unwrap();
    assert_eq!(job.total_size, 0);

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);
    assert_eq!(done.progress_percent(), 100.0);

    let meta = tokio::fs::metadata(cold.stored(StorageTier::Cold, "empty.txt"))
        .await
        .unwrap();
    assert_eq!(meta.len(), 0);
}

#[tokio::test]
async fn test_rename_writes_next_free_name() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let existing = cold.stored(StorageTier::Cold, "docs/report.txt");
    tokio::fs::create_dir_all(existing.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&existing, b"their version").await.unwrap();

    let file = hot.add_file("report.txt", b"our version").await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "docs/report.txt",
            TransferStrategy::Copy,
            ConflictResolution::Rename,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);
    assert_eq!(done.relative_path, "docs/report (1).txt");

    assert_eq!(tokio::fs::read(&existing).await.unwrap(), b"their version");
    assert_eq!(
        tokio::fs::read(cold.stored(StorageTier::Cold, "docs/report (1).txt"))
            .await
            .unwrap(),
        b"our version"
    );
}

#[tokio::test]
async fn test_compare_identical_move_completes_without_sending() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let data = noise(10_000, 7);
    let existing = cold.stored(StorageTier::Cold, "same.bin");
    tokio::fs::write(&existing, &data).await.unwrap();

    let file = hot.add_file("same.bin", &data).await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "same.bin",
            TransferStrategy::Move,
            ConflictResolution::Compare,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);
    assert_eq!(done.relative_path, "same.bin");
    // The peer already had it, so the move is complete once the source goes.
    assert!(tokio::fs::metadata(&file.path).await.is_err());
    assert!(tokio::fs::metadata(cold.stored(StorageTier::Cold, "same (1).bin"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_skip_copy_leaves_existing_target() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let existing = cold.stored(StorageTier::Cold, "keep.txt");
    tokio::fs::write(&existing, b"keep me").await.unwrap();

    let file = hot.add_file("keep.txt", b"replacement").await;
    let job = hot
        .state
        .engine()
        .create_job(push(
            file.id,
            peer.id,
            "keep.txt",
            TransferStrategy::Copy,
            ConflictResolution::Skip,
        ))
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(tokio::fs::read(&existing).await.unwrap(), b"keep me");
    assert!(tokio::fs::metadata(&file.path).await.is_ok());
}

#[tokio::test]
async fn test_pull_has_peer_push_back() {
    let bidirectional = |c: &mut fridge_backend::Config| c.transfer_mode = TransferMode::Bidirectional;
    let hot = TestInstance::start_with("hot", bidirectional).await;
    let cold = TestInstance::start_with("cold", bidirectional).await;
    let (peer, _) = pair(&hot, &cold).await;
    assert!(peer.effective_bidirectional());

    // The file lives in the peer's cold tier.
    let data = noise(3 * MIB / 2, 8);
    let remote = cold.stored(StorageTier::Cold, "archive/restore-me.bin");
    tokio::fs::create_dir_all(remote.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&remote, &data).await.unwrap();

    let target = hot.stored(StorageTier::Hot, "restored/restore-me.bin");
    let record = hot
        .state
        .files
        .reserve(&target, StorageTier::Hot)
        .await
        .unwrap();

    let job = hot
        .state
        .engine()
        .create_job(CreateJob {
            file_id: record.id,
            peer_id: peer.id,
            remote_path_id: PATH_ID,
            relative_path: "archive/restore-me.bin".to_string(),
            storage_tier: StorageTier::Cold,
            direction: Direction::Pull,
            strategy: TransferStrategy::Copy,
            conflict_resolution: ConflictResolution::Overwrite,
        })
        .await
        .unwrap();

    let done = hot.state.worker.drive(job.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed, "{:?}", done.last_error);

    let arrived = eventually(Duration::from_secs(10), || {
        let target = target.clone();
        async move { tokio::fs::metadata(&target).await.is_ok() }
    })
    .await;
    assert!(arrived, "pulled file never arrived");
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);

    // The serving side ran an ordinary push job.
    let served = cold.state.ledger().list(None, 10).await.unwrap();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].direction, Direction::Push);
}

#[tokio::test]
async fn test_pull_refused_in_push_only_mode() {
    let hot = TestInstance::start("hot").await;
    let cold = TestInstance::start("cold").await;
    let (peer, _) = pair(&hot, &cold).await;

    let record = hot
        .state
        .files
        .reserve(&hot.stored(StorageTier::Hot, "x.bin"), StorageTier::Hot)
        .await
        .unwrap();
    let err = hot
        .state
        .engine()
        .create_job(CreateJob {
            file_id: record.id,
            peer_id: peer.id,
            remote_path_id: PATH_ID,
            relative_path: "x.bin".to_string(),
            storage_tier: StorageTier::Cold,
            direction: Direction::Pull,
            strategy: TransferStrategy::Copy,
            conflict_resolution: ConflictResolution::Overwrite,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, fridge_backend::AppError::Validation(_)));
}
