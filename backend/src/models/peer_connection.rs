//! Peer connection model: the trust relationship with another instance.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Trust state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustStatus {
    Pending,
    Trusted,
    Rejected,
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustStatus::Pending => write!(f, "PENDING"),
            TrustStatus::Trusted => write!(f, "TRUSTED"),
            TrustStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Which directions an instance allows transfers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferMode {
    PushOnly,
    Bidirectional,
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PUSH_ONLY" => Ok(TransferMode::PushOnly),
            "BIDIRECTIONAL" => Ok(TransferMode::Bidirectional),
            other => Err(format!("Unknown transfer mode: {}", other)),
        }
    }
}

/// Peer connection entity.
///
/// `fingerprint` is the stable identity of the remote instance and is unique
/// across the table; `base_url` may change over the lifetime of the connection
/// but only after the peer proves possession of its keys again.
#[derive(Clone, FromRow, Serialize)]
pub struct PeerConnection {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub fingerprint: String,
    #[serde(skip)]
    pub signing_public_key: Option<Vec<u8>>,
    #[serde(skip)]
    pub agreement_public_key: Option<Vec<u8>>,
    pub trust_status: TrustStatus,
    pub local_transfer_mode: TransferMode,
    pub remote_transfer_mode: TransferMode,
    #[serde(skip)]
    pub shared_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

redacted_debug!(PeerConnection {
    show id,
    show name,
    show base_url,
    show fingerprint,
    show trust_status,
    show local_transfer_mode,
    show remote_transfer_mode,
    redact_option shared_secret,
});

impl PeerConnection {
    /// Both ends must allow bidirectional transfers for pulls to be possible.
    pub fn effective_bidirectional(&self) -> bool {
        self.local_transfer_mode == TransferMode::Bidirectional
            && self.remote_transfer_mode == TransferMode::Bidirectional
    }

    pub fn is_trusted(&self) -> bool {
        self.trust_status == TrustStatus::Trusted
    }

    /// Peer-facing endpoint URL for `path` (which starts with `/`).
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(local: TransferMode, remote: TransferMode) -> PeerConnection {
        PeerConnection {
            id: Uuid::new_v4(),
            name: "cold-site".into(),
            base_url: "https://cold.example.com/".into(),
            fingerprint: "ab".repeat(32),
            signing_public_key: None,
            agreement_public_key: None,
            trust_status: TrustStatus::Pending,
            local_transfer_mode: local,
            remote_transfer_mode: remote,
            shared_secret: Some("hunter2".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_effective_bidirectional_requires_both_sides() {
        use TransferMode::*;
        assert!(peer(Bidirectional, Bidirectional).effective_bidirectional());
        assert!(!peer(Bidirectional, PushOnly).effective_bidirectional());
        assert!(!peer(PushOnly, Bidirectional).effective_bidirectional());
        assert!(!peer(PushOnly, PushOnly).effective_bidirectional());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let p = peer(TransferMode::PushOnly, TransferMode::PushOnly);
        assert_eq!(
            p.endpoint("/api/v1/remote/receive"),
            "https://cold.example.com/api/v1/remote/receive"
        );
    }

    #[test]
    fn test_debug_redacts_shared_secret() {
        let p = peer(TransferMode::PushOnly, TransferMode::PushOnly);
        let output = format!("{:?}", p);
        assert!(!output.contains("hunter2"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn test_transfer_mode_from_str() {
        assert_eq!(
            "bidirectional".parse::<TransferMode>().unwrap(),
            TransferMode::Bidirectional
        );
        assert_eq!(
            "PUSH_ONLY".parse::<TransferMode>().unwrap(),
            TransferMode::PushOnly
        );
        assert!("sideways".parse::<TransferMode>().is_err());
    }
}
