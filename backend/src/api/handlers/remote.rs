//! Peer-facing protocol endpoints.
//!
//! `identity`, `handshake` and `challenge` are open: they carry their own
//! proof (pairing code, sealed challenge). Everything else must be signed by
//! a trusted peer; the signature covers method, path, query, the
//! `x-fridge-*` metadata headers and body.

use axum::{
    body::Bytes,
    extract::{OriginalUri, Query, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;
use crate::models::peer_connection::PeerConnection;
use crate::protocol::*;
use crate::services::receiver_service::IncomingChunk;
use crate::services::request_signing::{self, SignedHeaders};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route(PATH_IDENTITY, get(identity))
        .route(PATH_HANDSHAKE, post(handshake))
        .route(PATH_CHALLENGE, post(challenge))
        .route(PATH_TRANSFER_STATUS, get(transfer_status))
        .route(PATH_RECEIVE, post(receive))
        .route(PATH_VERIFY_TRANSFER, post(verify_transfer))
        .route(PATH_TERMINATE, post(terminate))
        .route(PATH_PULL_REQUEST, post(pull_request))
}

/// Resolve the trusted peer that signed this request.
async fn authenticate(
    state: &SharedState,
    method: &Method,
    uri: &OriginalUri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<PeerConnection> {
    let signed = SignedHeaders::from_headers(headers)?;
    let peer = state.trust_store.require_trusted(&signed.instance).await?;
    let path_and_query = uri
        .0
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.0.path());
    request_signing::verify(
        &peer,
        &signed,
        method.as_str(),
        path_and_query,
        headers,
        body,
        Utc::now().timestamp(),
        state.config.request_max_age,
    )?;
    Ok(peer)
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("Invalid body: {}", e)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))
}

fn header_opt<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_b64(headers: &HeaderMap, name: &str) -> Result<Option<Vec<u8>>> {
    header_opt(headers, name)
        .map(|v| {
            STANDARD
                .decode(v)
                .map_err(|_| AppError::Validation(format!("{} is not valid base64", name)))
        })
        .transpose()
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(header_opt(headers, name), Some("1") | Some("true"))
}

/// Decode chunk metadata from the `/receive` headers.
fn incoming_chunk(headers: &HeaderMap, payload: Bytes) -> Result<IncomingChunk> {
    let job_id = Uuid::parse_str(header_str(headers, HEADER_JOB_ID)?)
        .map_err(|_| AppError::Validation("Malformed job id".into()))?;
    let chunk_index = header_str(headers, HEADER_CHUNK_INDEX)?
        .parse()
        .map_err(|_| AppError::Validation("Malformed chunk index".into()))?;
    let path_id = header_str(headers, HEADER_PATH_ID)?
        .parse()
        .map_err(|_| AppError::Validation("Malformed path id".into()))?;
    let storage_tier: StorageTier = header_str(headers, HEADER_STORAGE_TIER)?
        .parse()
        .map_err(AppError::Validation)?;
    let relative_path = URL_SAFE_NO_PAD
        .decode(header_str(headers, HEADER_RELATIVE_PATH)?)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| AppError::Validation("Malformed relative path".into()))?;

    Ok(IncomingChunk {
        job_id,
        chunk_index,
        is_final: flag(headers, HEADER_FINAL),
        relative_path,
        path_id,
        storage_tier,
        stream_start: flag(headers, HEADER_STREAM_START),
        nonce: header_b64(headers, HEADER_NONCE)?,
        session_key: header_b64(headers, HEADER_SESSION_KEY)?,
        payload,
    })
}

pub async fn identity(State(state): State<SharedState>) -> Json<IdentityDocument> {
    Json(state.identity.document(state.config.transfer_mode))
}

pub async fn handshake(
    State(state): State<SharedState>,
    Json(request): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>> {
    let response = state.handshake.accept_handshake(request).await?;
    Ok(Json(response))
}

pub async fn challenge(
    State(state): State<SharedState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>> {
    let response = state.handshake.answer_challenge(request).await?;
    Ok(Json(response))
}

pub async fn transfer_status(
    State(state): State<SharedState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(query): Query<TransferStatusQuery>,
) -> Result<Json<TransferStatusResponse>> {
    authenticate(&state, &method, &uri, &headers, &[]).await?;
    let status = state.receiver.status(&query).await?;
    Ok(Json(status))
}

pub async fn receive(
    State(state): State<SharedState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReceiveResponse>> {
    let peer = authenticate(&state, &method, &uri, &headers, &body).await?;
    let chunk = incoming_chunk(&headers, body)?;
    tracing::debug!(
        peer = %peer.name,
        job_id = %chunk.job_id,
        chunk = chunk.chunk_index,
        "Receiving chunk"
    );
    let response = state.receiver.receive_chunk(chunk).await?;
    Ok(Json(response))
}

pub async fn verify_transfer(
    State(state): State<SharedState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VerifyTransferResponse>> {
    authenticate(&state, &method, &uri, &headers, &body).await?;
    let request: VerifyTransferRequest = parse_json(&body)?;
    let response = state.receiver.verify(&request).await?;
    Ok(Json(response))
}

pub async fn terminate(
    State(state): State<SharedState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusResponse>> {
    let peer = authenticate(&state, &method, &uri, &headers, &body).await?;
    state.handshake.handle_remote_terminate(&peer).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn pull_request(
    State(state): State<SharedState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PullResponse>> {
    let peer = authenticate(&state, &method, &uri, &headers, &body).await?;
    let request: PullRequest = parse_json(&body)?;
    let job = state.engine().accept_pull(&peer, &request).await?;
    state.worker.spawn(job.id);
    Ok(Json(PullResponse {
        status: "accepted".to_string(),
        job_id: job.id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_incoming_chunk_from_headers() {
        let job = Uuid::new_v4();
        let encoded = URL_SAFE_NO_PAD.encode("dir/some file.bin");
        let map = headers(&[
            (HEADER_JOB_ID, &job.to_string()),
            (HEADER_CHUNK_INDEX, "2"),
            (HEADER_FINAL, "1"),
            (HEADER_RELATIVE_PATH, &encoded),
            (HEADER_PATH_ID, "7"),
            (HEADER_STORAGE_TIER, "cold"),
        ]);
        let chunk = incoming_chunk(&map, Bytes::from_static(b"x")).unwrap();
        assert_eq!(chunk.job_id, job);
        assert_eq!(chunk.chunk_index, 2);
        assert!(chunk.is_final);
        assert!(!chunk.stream_start);
        assert_eq!(chunk.relative_path, "dir/some file.bin");
        assert_eq!(chunk.path_id, 7);
        assert_eq!(chunk.storage_tier, StorageTier::Cold);
        assert!(chunk.nonce.is_none());
    }

    #[test]
    fn test_incoming_chunk_missing_header() {
        let map = headers(&[(HEADER_CHUNK_INDEX, "0")]);
        assert!(matches!(
            incoming_chunk(&map, Bytes::new()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_nonce_encoding() {
        let map = headers(&[(HEADER_NONCE, "***")]);
        assert!(header_b64(&map, HEADER_NONCE).is_err());
    }
}
