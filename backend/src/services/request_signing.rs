//! Peer request signing.
//!
//! Every authenticated peer request carries the caller's fingerprint, a unix
//! timestamp and a signature over
//! `METHOD \n PATH_AND_QUERY \n TIMESTAMP \n hex(SHA-256(metadata)) \n hex(SHA-256(body))`,
//! where `metadata` is every `x-fridge-*` header other than the
//! authentication headers, sorted by name, one `name:value` per line.
//! Ed25519 is used when the receiver knows the caller's signing key; a
//! relationship configured with a pre-shared secret signs with HMAC-SHA256.

use std::time::Duration;

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::peer_connection::PeerConnection;
use crate::protocol::{
    HEADER_AUTH, HEADER_INSTANCE, HEADER_PREFIX, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use crate::services::identity::InstanceIdentity;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Ed25519,
    HmacSha256,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Ed25519 => "ed25519",
            AuthScheme::HmacSha256 => "hmac-sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ed25519" => Some(AuthScheme::Ed25519),
            "hmac-sha256" => Some(AuthScheme::HmacSha256),
            _ => None,
        }
    }
}

/// Authentication headers of one request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub instance: String,
    pub timestamp: i64,
    pub signature: String,
    pub scheme: AuthScheme,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_INSTANCE, self.instance.clone()),
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_SIGNATURE, self.signature.clone()),
            (HEADER_AUTH, self.scheme.as_str().to_string()),
        ]
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let get = |name: &str| -> Result<&str> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AppError::Authentication(format!("Missing {} header", name)))
        };
        let scheme = AuthScheme::parse(get(HEADER_AUTH)?)
            .ok_or_else(|| AppError::Authentication("Unknown auth scheme".into()))?;
        let timestamp = get(HEADER_TIMESTAMP)?
            .parse()
            .map_err(|_| AppError::Authentication("Malformed timestamp".into()))?;
        Ok(Self {
            instance: get(HEADER_INSTANCE)?.to_string(),
            timestamp,
            signature: get(HEADER_SIGNATURE)?.to_string(),
            scheme,
        })
    }
}

const AUTH_HEADERS: [&str; 4] = [HEADER_INSTANCE, HEADER_TIMESTAMP, HEADER_SIGNATURE, HEADER_AUTH];

/// Canonical form of the protocol metadata headers covered by the signature.
pub fn metadata_block(headers: &HeaderMap) -> String {
    let mut lines: Vec<String> = headers
        .keys()
        .map(|name| name.as_str())
        .filter(|name| name.starts_with(HEADER_PREFIX) && !AUTH_HEADERS.contains(name))
        .map(|name| {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            format!("{}:{}", name, values.join(","))
        })
        .collect();
    lines.sort();
    lines.dedup();
    lines.join("\n")
}

pub fn canonical_request(
    method: &str,
    path_and_query: &str,
    timestamp: i64,
    metadata: &HeaderMap,
    body: &[u8],
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path_and_query,
        timestamp,
        hex::encode(Sha256::digest(metadata_block(metadata).as_bytes())),
        hex::encode(Sha256::digest(body))
    )
}

pub fn sign_ed25519(
    identity: &InstanceIdentity,
    method: &str,
    path_and_query: &str,
    metadata: &HeaderMap,
    body: &[u8],
    timestamp: i64,
) -> SignedHeaders {
    let message = canonical_request(method, path_and_query, timestamp, metadata, body);
    SignedHeaders {
        instance: identity.fingerprint.clone(),
        timestamp,
        signature: STANDARD.encode(identity.sign(message.as_bytes())),
        scheme: AuthScheme::Ed25519,
    }
}

fn hmac_for(secret: &str, message: &str) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(mac)
}

pub fn sign_hmac(
    secret: &str,
    instance: &str,
    method: &str,
    path_and_query: &str,
    metadata: &HeaderMap,
    body: &[u8],
    timestamp: i64,
) -> Result<SignedHeaders> {
    let message = canonical_request(method, path_and_query, timestamp, metadata, body);
    let tag = hmac_for(secret, &message)?.finalize().into_bytes();
    Ok(SignedHeaders {
        instance: instance.to_string(),
        timestamp,
        signature: STANDARD.encode(tag),
        scheme: AuthScheme::HmacSha256,
    })
}

/// Sign a request to `peer` with whatever the relationship supports.
pub fn sign_for_peer(
    identity: &InstanceIdentity,
    peer: &PeerConnection,
    method: &str,
    path_and_query: &str,
    metadata: &HeaderMap,
    body: &[u8],
    timestamp: i64,
) -> Result<SignedHeaders> {
    match &peer.shared_secret {
        Some(secret) => sign_hmac(
            secret,
            &identity.fingerprint,
            method,
            path_and_query,
            metadata,
            body,
            timestamp,
        ),
        None => Ok(sign_ed25519(
            identity,
            method,
            path_and_query,
            metadata,
            body,
            timestamp,
        )),
    }
}

/// Reject timestamps outside `max_age` in either direction.
pub fn check_timestamp(timestamp: i64, now: i64, max_age: Duration) -> Result<()> {
    let skew = now.saturating_sub(timestamp).unsigned_abs();
    if skew > max_age.as_secs() {
        return Err(AppError::Authentication(format!(
            "Request timestamp outside the {}s window",
            max_age.as_secs()
        )));
    }
    Ok(())
}

/// Verify `headers` were produced by `peer` for this exact request.
pub fn verify(
    peer: &PeerConnection,
    headers: &SignedHeaders,
    method: &str,
    path_and_query: &str,
    metadata: &HeaderMap,
    body: &[u8],
    now: i64,
    max_age: Duration,
) -> Result<()> {
    check_timestamp(headers.timestamp, now, max_age)?;

    let signature = STANDARD
        .decode(&headers.signature)
        .map_err(|_| AppError::Security("Signature is not valid base64".into()))?;
    let message = canonical_request(method, path_and_query, headers.timestamp, metadata, body);

    match headers.scheme {
        AuthScheme::Ed25519 => {
            let key_bytes: [u8; 32] = peer
                .signing_public_key
                .as_deref()
                .and_then(|k| k.try_into().ok())
                .ok_or_else(|| {
                    AppError::Authentication(format!("No signing key on record for {}", peer.name))
                })?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| AppError::Security("Stored signing key is invalid".into()))?;
            let sig = Signature::from_slice(&signature)
                .map_err(|_| AppError::Security("Malformed signature".into()))?;
            key.verify(message.as_bytes(), &sig)
                .map_err(|_| AppError::Security("Bad request signature".into()))
        }
        AuthScheme::HmacSha256 => {
            let secret = peer.shared_secret.as_deref().ok_or_else(|| {
                AppError::Authentication(format!("No shared secret on record for {}", peer.name))
            })?;
            hmac_for(secret, &message)?
                .verify_slice(&signature)
                .map_err(|_| AppError::Security("Bad request signature".into()))
        }
    }
}
