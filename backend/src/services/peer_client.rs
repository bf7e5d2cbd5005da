//! HTTP client for the peer-facing protocol.
//!
//! Owns the request signing and the translation of transport and HTTP
//! failures into the error taxonomy the retry policy understands.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;
use crate::models::peer_connection::PeerConnection;
use crate::protocol::*;
use crate::services::identity::InstanceIdentity;
use crate::services::request_signing;

/// Per-chunk metadata sent as headers on `/receive`.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub job_id: Uuid,
    pub chunk_index: u64,
    pub is_final: bool,
    pub relative_path: String,
    pub path_id: i64,
    pub storage_tier: StorageTier,
    pub stream_start: bool,
    pub nonce: Option<[u8; 12]>,
    pub session_key: Option<[u8; 32]>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Clone)]
pub struct PeerClient {
    http: Client,
    identity: Arc<InstanceIdentity>,
}

fn header(name: &'static str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation(format!("Invalid value for header {}", name)))?;
    Ok((HeaderName::from_static(name), value))
}

/// Transport-level failures are always worth retrying.
fn map_send_error(url: &str, e: reqwest::Error) -> AppError {
    if e.is_builder() {
        return AppError::Validation(format!("Invalid peer URL {}: {}", url, e));
    }
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    AppError::TransientNetwork(format!("{} {}: {}", url, kind, e))
}

/// Map a non-success answer from a peer.
pub fn map_status_error(status: StatusCode, code: Option<&str>, message: &str) -> AppError {
    let message = match code {
        Some(code) => format!("{} ({})", message, code),
        None => message.to_string(),
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            AppError::RateLimited(format!("Peer returned {}: {}", status, message))
        }
        StatusCode::UNPROCESSABLE_ENTITY => AppError::Corruption(message),
        s if s.is_server_error() => {
            AppError::TransientNetwork(format!("Peer returned {}: {}", s, message))
        }
        s => AppError::PeerRejected {
            status: s.as_u16(),
            message,
        },
    }
}

async fn error_from_response(response: reqwest::Response) -> AppError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => map_status_error(
            status,
            body.code.as_deref(),
            body.message.as_deref().unwrap_or("no message"),
        ),
        Err(_) => map_status_error(status, None, text.trim()),
    }
}

impl PeerClient {
    pub fn new(
        identity: Arc<InstanceIdentity>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, identity })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response.json::<T>().await.map_err(|e| {
            AppError::TransientNetwork(format!("Unreadable response from {}: {}", url, e))
        })
    }

    pub async fn fetch_identity(&self, base_url: &str) -> Result<IdentityDocument> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), PATH_IDENTITY);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;
        Self::decode(&url, response).await
    }

    pub async fn handshake(&self, base_url: &str, req: &HandshakeRequest) -> Result<HandshakeResponse> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), PATH_HANDSHAKE);
        let response = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;
        Self::decode(&url, response).await
    }

    pub async fn challenge(&self, base_url: &str, req: &ChallengeRequest) -> Result<ChallengeResponse> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), PATH_CHALLENGE);
        let response = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;
        Self::decode(&url, response).await
    }

    /// Build, sign and send a request to a paired peer.
    async fn send_signed<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        peer: &PeerConnection,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Bytes,
        extra: Vec<(HeaderName, HeaderValue)>,
    ) -> Result<T> {
        let url = peer.endpoint(path);
        let mut builder = self.http.request(method.clone(), &url);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        let mut request = builder
            .body(body.clone())
            .build()
            .map_err(|e| map_send_error(&url, e))?;

        let path_and_query = match request.url().query() {
            Some(q) => format!("{}?{}", request.url().path(), q),
            None => request.url().path().to_string(),
        };
        for (name, value) in extra {
            request.headers_mut().insert(name, value);
        }
        let signed = request_signing::sign_for_peer(
            &self.identity,
            peer,
            method.as_str(),
            &path_and_query,
            request.headers(),
            &body,
            Utc::now().timestamp(),
        )?;

        let headers = request.headers_mut();
        for (name, value) in signed.pairs() {
            let (name, value) = header(name, &value)?;
            headers.insert(name, value);
        }
        if !body.is_empty() && !headers.contains_key(reqwest::header::CONTENT_TYPE) {
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| map_send_error(&url, e))?;
        Self::decode(&url, response).await
    }

    pub async fn transfer_status(
        &self,
        peer: &PeerConnection,
        query: &TransferStatusQuery,
    ) -> Result<TransferStatusResponse> {
        self.send_signed(
            peer,
            Method::GET,
            PATH_TRANSFER_STATUS,
            Some(query),
            Bytes::new(),
            Vec::new(),
        )
        .await
    }

    pub async fn send_chunk(
        &self,
        peer: &PeerConnection,
        meta: &ChunkMeta,
        payload: Vec<u8>,
    ) -> Result<ReceiveResponse> {
        let mut extra = vec![
            header(HEADER_JOB_ID, &meta.job_id.to_string())?,
            header(HEADER_CHUNK_INDEX, &meta.chunk_index.to_string())?,
            header(HEADER_FINAL, if meta.is_final { "1" } else { "0" })?,
            header(
                HEADER_RELATIVE_PATH,
                &URL_SAFE_NO_PAD.encode(meta.relative_path.as_bytes()),
            )?,
            header(HEADER_PATH_ID, &meta.path_id.to_string())?,
            header(HEADER_STORAGE_TIER, meta.storage_tier.as_str())?,
            (
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
        ];
        if meta.stream_start {
            extra.push(header(HEADER_STREAM_START, "1")?);
        }
        if let Some(nonce) = meta.nonce {
            extra.push(header(HEADER_NONCE, &STANDARD.encode(nonce))?);
        }
        if let Some(key) = meta.session_key {
            extra.push(header(HEADER_SESSION_KEY, &STANDARD.encode(key))?);
        }

        self.send_signed::<ReceiveResponse, ()>(
            peer,
            Method::POST,
            PATH_RECEIVE,
            None,
            Bytes::from(payload),
            extra,
        )
        .await
    }

    pub async fn verify_transfer(
        &self,
        peer: &PeerConnection,
        req: &VerifyTransferRequest,
    ) -> Result<VerifyTransferResponse> {
        let body = serde_json::to_vec(req)?;
        self.send_signed::<_, ()>(
            peer,
            Method::POST,
            PATH_VERIFY_TRANSFER,
            None,
            Bytes::from(body),
            Vec::new(),
        )
        .await
    }

    pub async fn terminate(&self, peer: &PeerConnection) -> Result<StatusResponse> {
        self.send_signed::<_, ()>(
            peer,
            Method::POST,
            PATH_TERMINATE,
            None,
            Bytes::from_static(b"{}"),
            Vec::new(),
        )
        .await
    }

    pub async fn pull_request(&self, peer: &PeerConnection, req: &PullRequest) -> Result<PullResponse> {
        let body = serde_json::to_vec(req)?;
        self.send_signed::<_, ()>(
            peer,
            Method::POST,
            PATH_PULL_REQUEST,
            None,
            Bytes::from(body),
            Vec::new(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status_error(StatusCode::TOO_MANY_REQUESTS, None, "slow"),
            AppError::RateLimited(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::SERVICE_UNAVAILABLE, None, "busy"),
            AppError::RateLimited(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::BAD_GATEWAY, None, "upstream"),
            AppError::TransientNetwork(_)
        ));
        assert!(matches!(
            map_status_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                Some("CHECKSUM_MISMATCH"),
                "bad sum"
            ),
            AppError::Corruption(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::NOT_FOUND, None, "gone"),
            AppError::PeerRejected { status: 404, .. }
        ));
        assert!(matches!(
            map_status_error(StatusCode::FORBIDDEN, Some("SECURITY_ERROR"), "traversal"),
            AppError::PeerRejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_message_keeps_peer_code() {
        let err = map_status_error(StatusCode::FORBIDDEN, Some("SECURITY_ERROR"), "nope");
        assert!(err.to_string().contains("SECURITY_ERROR"));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transient() {
        let identity = Arc::new(InstanceIdentity::generate("a", "http://a"));
        let client = PeerClient::new(
            identity,
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap();
        // Port 9 on localhost: nothing listens, connection is refused.
        let err = client.fetch_identity("http://127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
    }
}
