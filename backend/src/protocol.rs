//! Peer-to-peer wire protocol: paths, header names and JSON messages.
//!
//! Sender and receiver are the same binary, so everything both ends must agree
//! on lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::file_record::StorageTier;
use crate::models::peer_connection::{TransferMode, TrustStatus};
use crate::models::transfer_job::{ConflictResolution, TransferStrategy};

pub const PATH_IDENTITY: &str = "/api/v1/remote/identity";
pub const PATH_HANDSHAKE: &str = "/api/v1/remote/handshake";
pub const PATH_CHALLENGE: &str = "/api/v1/remote/challenge";
pub const PATH_TRANSFER_STATUS: &str = "/api/v1/remote/transfer-status";
pub const PATH_RECEIVE: &str = "/api/v1/remote/receive";
pub const PATH_VERIFY_TRANSFER: &str = "/api/v1/remote/verify-transfer";
pub const PATH_TERMINATE: &str = "/api/v1/remote/terminate-connection";
pub const PATH_PULL_REQUEST: &str = "/api/v1/remote/pull-request";

/// Every protocol header starts with this; all but the auth headers are signed.
pub const HEADER_PREFIX: &str = "x-fridge-";

/// Fingerprint of the calling instance.
pub const HEADER_INSTANCE: &str = "x-fridge-instance";
/// Unix seconds at signing time.
pub const HEADER_TIMESTAMP: &str = "x-fridge-timestamp";
/// Base64 signature over the canonical request.
pub const HEADER_SIGNATURE: &str = "x-fridge-signature";
/// `ed25519` or `hmac-sha256`.
pub const HEADER_AUTH: &str = "x-fridge-auth";

pub const HEADER_JOB_ID: &str = "x-fridge-job-id";
pub const HEADER_CHUNK_INDEX: &str = "x-fridge-chunk-index";
pub const HEADER_FINAL: &str = "x-fridge-final";
/// URL-safe base64 of the UTF-8 relative path.
pub const HEADER_RELATIVE_PATH: &str = "x-fridge-relative-path";
pub const HEADER_PATH_ID: &str = "x-fridge-path-id";
pub const HEADER_STORAGE_TIER: &str = "x-fridge-storage-tier";
/// Base64 AES-GCM nonce; absent when the chunk is not encrypted.
pub const HEADER_NONCE: &str = "x-fridge-nonce";
/// Base64 ephemeral X25519 public key of the sender.
pub const HEADER_SESSION_KEY: &str = "x-fridge-session-key";
/// `1` on the first chunk of a compression stream.
pub const HEADER_STREAM_START: &str = "x-fridge-stream-start";

/// Public identity an instance announces to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub name: String,
    pub url: String,
    pub fingerprint: String,
    /// Base64 Ed25519 verifying key.
    pub signing_public_key: String,
    /// Base64 X25519 public key.
    pub agreement_public_key: String,
    pub transfer_mode: TransferMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub identity: IdentityDocument,
    pub pairing_code: String,
    /// Optional legacy secret both operators agreed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: TrustStatus,
    pub identity: IdentityDocument,
}

/// Which key material a challenge was sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKey {
    Agreement,
    SharedSecret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub initiator_fingerprint: String,
    pub key: ChallengeKey,
    /// Base64 `nonce || ciphertext`.
    pub encrypted_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Base64 of the decrypted challenge.
    pub decrypted: String,
    /// Public URL the answering instance is configured with.
    pub url: String,
    /// Base64 Ed25519 signature over the challenge, the verifier and `url`.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatusQuery {
    pub path_id: i64,
    pub relative_path: String,
    pub storage_tier: StorageTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFileStatus {
    NotFound,
    Partial,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatusResponse {
    pub size: u64,
    pub status: RemoteFileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveResponse {
    pub status: String,
    pub chunk: u64,
    /// Bytes in the temp file after this chunk.
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyTransferRequest {
    pub job_id: Uuid,
    pub checksum: String,
    pub relative_path: String,
    pub remote_path_id: i64,
    pub storage_tier: StorageTier,
    /// Compare against the already-finalized file instead of the temp file.
    #[serde(default)]
    pub compare_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyTransferResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// Path of the wanted file inside the serving peer's tier directory.
    pub relative_path: String,
    pub source_path_id: i64,
    pub source_tier: StorageTier,
    /// Where the requester wants it written.
    pub target_path_id: i64,
    pub target_relative_path: String,
    pub target_tier: StorageTier,
    pub strategy: TransferStrategy,
    pub conflict_resolution: ConflictResolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub status: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
