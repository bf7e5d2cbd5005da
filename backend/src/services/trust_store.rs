//! Trust store: persistence for peer connections.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::peer_connection::{PeerConnection, TransferMode, TrustStatus};
use crate::protocol::IdentityDocument;
use crate::services::identity::PeerKeys;

const PEER_COLUMNS: &str = r#"
    id, name, base_url, fingerprint, signing_public_key, agreement_public_key,
    trust_status, local_transfer_mode, remote_transfer_mode, shared_secret,
    created_at, updated_at
"#;

/// Everything needed to create or refresh a peer record.
#[derive(Debug)]
pub struct PeerRegistration<'a> {
    pub document: &'a IdentityDocument,
    pub keys: &'a PeerKeys,
    pub trust_status: TrustStatus,
    pub local_transfer_mode: TransferMode,
    pub shared_secret: Option<&'a str>,
}

#[derive(Clone)]
pub struct TrustStore {
    db: SqlitePool,
}

impl TrustStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: Uuid) -> Result<PeerConnection> {
        sqlx::query_as::<_, PeerConnection>(&format!(
            "SELECT {} FROM peer_connections WHERE id = ?",
            PEER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Peer connection {} not found", id)))
    }

    pub async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<PeerConnection>> {
        let peer = sqlx::query_as::<_, PeerConnection>(&format!(
            "SELECT {} FROM peer_connections WHERE fingerprint = ?",
            PEER_COLUMNS
        ))
        .bind(fingerprint.to_ascii_lowercase())
        .fetch_optional(&self.db)
        .await?;
        Ok(peer)
    }

    /// Resolve the caller of a data endpoint; only trusted peers qualify.
    pub async fn require_trusted(&self, fingerprint: &str) -> Result<PeerConnection> {
        let peer = self
            .find_by_fingerprint(fingerprint)
            .await?
            .ok_or_else(|| AppError::Authentication(format!("Unknown instance {}", fingerprint)))?;
        if !peer.is_trusted() {
            return Err(AppError::Authentication(format!(
                "Peer {} is {}, not trusted",
                peer.name, peer.trust_status
            )));
        }
        Ok(peer)
    }

    pub async fn list(&self) -> Result<Vec<PeerConnection>> {
        let peers = sqlx::query_as::<_, PeerConnection>(&format!(
            "SELECT {} FROM peer_connections ORDER BY name",
            PEER_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(peers)
    }

    /// Insert a peer, or refresh the record already holding this fingerprint.
    ///
    /// A refresh only promotes the trust status and updates the advertised
    /// transfer mode. The stored URL, name and keys never change here; a move
    /// goes through a challenged URL update. A shared secret can be added to a
    /// record that is not yet trusted but never replaced on a trusted one.
    pub async fn upsert(&self, reg: PeerRegistration<'_>) -> Result<PeerConnection> {
        let now = Utc::now();
        let fingerprint = reg.document.fingerprint.to_ascii_lowercase();
        sqlx::query(
            r#"
            INSERT INTO peer_connections (
                id, name, base_url, fingerprint, signing_public_key, agreement_public_key,
                trust_status, local_transfer_mode, remote_transfer_mode, shared_secret,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint) DO UPDATE SET
                trust_status = CASE
                    WHEN peer_connections.trust_status = 'TRUSTED' THEN 'TRUSTED'
                    ELSE excluded.trust_status
                END,
                remote_transfer_mode = excluded.remote_transfer_mode,
                shared_secret = CASE
                    WHEN peer_connections.trust_status = 'TRUSTED'
                        THEN peer_connections.shared_secret
                    ELSE COALESCE(excluded.shared_secret, peer_connections.shared_secret)
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&reg.document.name)
        .bind(&reg.document.url)
        .bind(&fingerprint)
        .bind(&reg.keys.signing_public_key)
        .bind(&reg.keys.agreement_public_key)
        .bind(reg.trust_status)
        .bind(reg.local_transfer_mode)
        .bind(reg.document.transfer_mode)
        .bind(reg.shared_secret)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        self.find_by_fingerprint(&fingerprint)
            .await?
            .ok_or_else(|| AppError::Internal("Peer vanished after upsert".into()))
    }

    pub async fn set_trust_status(&self, id: Uuid, status: TrustStatus) -> Result<PeerConnection> {
        let result =
            sqlx::query("UPDATE peer_connections SET trust_status = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Peer connection {} not found", id)));
        }
        self.get(id).await
    }

    pub async fn update_url(&self, id: Uuid, base_url: &str) -> Result<PeerConnection> {
        let result =
            sqlx::query("UPDATE peer_connections SET base_url = ?, updated_at = ? WHERE id = ?")
                .bind(base_url)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Peer connection {} not found", id)));
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM peer_connections WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Peer connection {} not found", id)));
        }
        Ok(())
    }
}
