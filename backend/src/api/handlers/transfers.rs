//! Operator endpoints for file records and transfer jobs.

use std::path::PathBuf;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::file_record::{FileRecord, StorageTier};
use crate::models::transfer_job::{
    ConflictResolution, Direction, TransferJob, TransferStatus, TransferStrategy,
};
use crate::services::transfer_engine::CreateJob;

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

/// Create transfer routes (nested under /api/v1/transfers)
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_transfers).post(create_transfer))
        .route("/:id", get(get_transfer))
        .route("/:id/retry", post(retry_transfer))
}

/// Create file record routes (nested under /api/v1/files)
pub fn file_router() -> Router<SharedState> {
    Router::new().route("/", post(register_file))
}

// --- Request/Response types ---

#[derive(Debug, Deserialize)]
pub struct RegisterFileRequest {
    pub path: PathBuf,
    pub storage_tier: StorageTier,
    /// Reserve the path as the target of a pull instead of indexing a file.
    #[serde(default)]
    pub incoming: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub file_id: Uuid,
    pub peer_id: Uuid,
    pub remote_path_id: i64,
    pub relative_path: String,
    pub storage_tier: StorageTier,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default = "default_strategy")]
    pub strategy: TransferStrategy,
    #[serde(default = "default_conflict")]
    pub conflict_resolution: ConflictResolution,
    /// Start right away instead of waiting for the next worker tick.
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_direction() -> Direction {
    Direction::Push
}

fn default_strategy() -> TransferStrategy {
    TransferStrategy::Copy
}

fn default_conflict() -> ConflictResolution {
    ConflictResolution::Overwrite
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ListTransfersQuery {
    pub status: Option<TransferStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransferJobResponse {
    #[serde(flatten)]
    pub job: TransferJob,
    pub progress_percent: f64,
}

impl From<TransferJob> for TransferJobResponse {
    fn from(job: TransferJob) -> Self {
        Self {
            progress_percent: job.progress_percent(),
            job,
        }
    }
}

// --- Handlers ---

pub async fn register_file(
    State(state): State<SharedState>,
    Json(body): Json<RegisterFileRequest>,
) -> Result<(StatusCode, Json<FileRecord>)> {
    if !body.path.is_absolute() {
        return Err(AppError::Validation("File path must be absolute".into()));
    }
    let record = if body.incoming {
        state.files.reserve(&body.path, body.storage_tier).await?
    } else {
        state.files.register(&body.path, body.storage_tier).await?
    };
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn create_transfer(
    State(state): State<SharedState>,
    Json(body): Json<CreateTransferRequest>,
) -> Result<(StatusCode, Json<TransferJobResponse>)> {
    let job = state
        .engine()
        .create_job(CreateJob {
            file_id: body.file_id,
            peer_id: body.peer_id,
            remote_path_id: body.remote_path_id,
            relative_path: body.relative_path,
            storage_tier: body.storage_tier,
            direction: body.direction,
            strategy: body.strategy,
            conflict_resolution: body.conflict_resolution,
        })
        .await?;
    if body.start {
        state.worker.spawn(job.id);
    }
    Ok((StatusCode::CREATED, Json(job.into())))
}

pub async fn list_transfers(
    State(state): State<SharedState>,
    Query(query): Query<ListTransfersQuery>,
) -> Result<Json<Vec<TransferJobResponse>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.ledger().list(query.status, limit).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

pub async fn get_transfer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferJobResponse>> {
    let job = state.ledger().get(id).await?;
    Ok(Json(job.into()))
}

pub async fn retry_transfer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferJobResponse>> {
    if state.worker.is_running(id) {
        return Err(AppError::Conflict(format!(
            "Transfer job {} is already running",
            id
        )));
    }
    let job = state.ledger().manual_retry(id).await?;
    state.worker.spawn(job.id);
    Ok(Json(job.into()))
}
