//! Trust establishment between instances.
//!
//! Pairing: the initiator presents the target's current pairing code along
//! with its identity document; the target answers with its own, and both
//! sides store the other as `TRUSTED` from that single exchange.
//!
//! Challenge-response proves the peer still holds the key material we stored
//! for it. It gates promotion of explicitly connected peers and URL changes.
//! The answer is signed over the challenge, the verifier's fingerprint and the
//! answering instance's own public URL, so it cannot be relayed through
//! another address.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::{AppError, Result};
use crate::models::peer_connection::{PeerConnection, TransferMode, TrustStatus};
use crate::protocol::{
    ChallengeKey, ChallengeRequest, ChallengeResponse, HandshakeRequest, HandshakeResponse,
    IdentityDocument,
};
use crate::services::audit_service::{AuditAction, AuditEntry, AuditService, ResourceType};
use crate::services::encryption::{self, SessionCipher};
use crate::services::identity::{
    verify_document, verify_signature, InstanceIdentity, PeerKeys,
};
use crate::services::pairing::{constant_time_eq, PairingCodes};
use crate::services::peer_client::PeerClient;
use crate::services::trust_store::{PeerRegistration, TrustStore};

const CHALLENGE_LEN: usize = 32;

/// A challenge we sent, kept until the answer comes back.
pub struct PendingChallenge {
    pub request: ChallengeRequest,
    expected: [u8; CHALLENGE_LEN],
}

#[derive(Clone)]
pub struct HandshakeService {
    trust_store: TrustStore,
    client: PeerClient,
    pairing: Arc<PairingCodes>,
    audit: AuditService,
    transfer_mode: TransferMode,
}

fn normalize_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    let scheme_ok = reqwest::Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !scheme_ok {
        return Err(AppError::Validation(format!(
            "Peer URL must start with http:// or https://: {}",
            url
        )));
    }
    Ok(url.to_string())
}

/// Bytes the answering instance signs for a challenge.
fn challenge_message(challenge: &[u8], verifier: &str, url: &str) -> Vec<u8> {
    format!(
        "fridge-challenge\n{}\n{}\n{}",
        STANDARD.encode(challenge),
        verifier.to_ascii_lowercase(),
        url
    )
    .into_bytes()
}

fn same_url(a: &str, b: &str) -> bool {
    match (reqwest::Url::parse(a), reqwest::Url::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim_end_matches('/') == b.trim_end_matches('/'),
    }
}

impl HandshakeService {
    pub fn new(
        trust_store: TrustStore,
        client: PeerClient,
        pairing: Arc<PairingCodes>,
        audit: AuditService,
        transfer_mode: TransferMode,
    ) -> Self {
        Self {
            trust_store,
            client,
            pairing,
            audit,
            transfer_mode,
        }
    }

    fn identity(&self) -> &InstanceIdentity {
        self.client.identity()
    }

    /// Check a remote document and refuse to pair an instance with itself.
    fn check_remote(&self, doc: &IdentityDocument) -> Result<PeerKeys> {
        let keys = verify_document(doc)?;
        if doc.fingerprint.eq_ignore_ascii_case(&self.identity().fingerprint) {
            return Err(AppError::Validation(
                "Refusing to pair this instance with itself".into(),
            ));
        }
        Ok(keys)
    }

    async fn register(
        &self,
        doc: &IdentityDocument,
        keys: &PeerKeys,
        status: TrustStatus,
        shared_secret: Option<&str>,
    ) -> Result<PeerConnection> {
        if let Some(existing) = self.trust_store.find_by_fingerprint(&doc.fingerprint).await? {
            if existing.base_url != doc.url {
                tracing::warn!(
                    peer = %existing.name,
                    stored_url = %existing.base_url,
                    offered_url = %doc.url,
                    security = true,
                    "Known peer offered a different URL; keeping the stored one"
                );
            }
        }
        self.trust_store
            .upsert(PeerRegistration {
                document: doc,
                keys,
                trust_status: status,
                local_transfer_mode: self.transfer_mode,
                shared_secret,
            })
            .await
    }

    /// Pair with the instance at `url` using the code its operator gave us.
    pub async fn initiate_handshake(
        &self,
        url: &str,
        pairing_code: &str,
        shared_secret: Option<&str>,
    ) -> Result<PeerConnection> {
        let url = normalize_url(url)?;
        let request = HandshakeRequest {
            identity: self.identity().document(self.transfer_mode),
            pairing_code: pairing_code.to_string(),
            shared_secret: shared_secret.map(str::to_string),
        };
        let response = self.client.handshake(&url, &request).await?;

        let mut doc = response.identity;
        let keys = self.check_remote(&doc)?;
        // The URL we actually reached wins over whatever the peer advertises.
        doc.url = url;
        let peer = self
            .register(&doc, &keys, TrustStatus::Trusted, shared_secret)
            .await?;

        tracing::info!(peer = %peer.name, fingerprint = %peer.fingerprint, "Paired with peer");
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerPaired, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({
                        "url": peer.base_url,
                        "fingerprint": peer.fingerprint,
                        "initiated_by": "local",
                    })),
            )
            .await;
        Ok(peer)
    }

    /// Peer-facing half of pairing.
    pub async fn accept_handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        if !self.pairing.validate(&request.pairing_code) {
            tracing::warn!(
                remote = %request.identity.url,
                security = true,
                "Handshake rejected: invalid or expired pairing code"
            );
            return Err(AppError::Security("Invalid or expired pairing code".into()));
        }

        let keys = self.check_remote(&request.identity)?;
        let peer = self
            .register(
                &request.identity,
                &keys,
                TrustStatus::Trusted,
                request.shared_secret.as_deref(),
            )
            .await?;

        tracing::info!(peer = %peer.name, fingerprint = %peer.fingerprint, "Accepted pairing");
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerPaired, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({
                        "url": peer.base_url,
                        "fingerprint": peer.fingerprint,
                        "initiated_by": "remote",
                    })),
            )
            .await;

        Ok(HandshakeResponse {
            status: TrustStatus::Trusted,
            identity: self.identity().document(self.transfer_mode),
        })
    }

    /// Register a peer from its published identity, pending verification.
    pub async fn connect(
        &self,
        name: Option<&str>,
        url: &str,
        shared_secret: Option<&str>,
    ) -> Result<PeerConnection> {
        let url = normalize_url(url)?;
        let mut doc = self.client.fetch_identity(&url).await?;
        let keys = self.check_remote(&doc)?;
        doc.url = url;
        if let Some(name) = name {
            doc.name = name.to_string();
        }

        let peer = self
            .register(&doc, &keys, TrustStatus::Pending, shared_secret)
            .await?;
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerConnected, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({
                        "url": peer.base_url,
                        "fingerprint": peer.fingerprint,
                    })),
            )
            .await;
        Ok(peer)
    }

    fn challenge_cipher(&self, peer: &PeerConnection) -> Result<(ChallengeKey, SessionCipher)> {
        if let Some(key) = &peer.agreement_public_key {
            let cipher =
                encryption::challenge_cipher_from_agreement(self.identity().agreement_secret(), key)?;
            return Ok((ChallengeKey::Agreement, cipher));
        }
        if let Some(secret) = &peer.shared_secret {
            let cipher = encryption::challenge_cipher_from_secret(secret)?;
            return Ok((ChallengeKey::SharedSecret, cipher));
        }
        Err(AppError::Validation(format!(
            "Peer {} has no key material to challenge",
            peer.name
        )))
    }

    /// Seal a fresh random nonce for `peer`.
    pub fn build_challenge(&self, peer: &PeerConnection) -> Result<PendingChallenge> {
        let (key, cipher) = self.challenge_cipher(peer)?;
        let mut expected = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut expected);
        let sealed = cipher.seal(&expected)?;
        Ok(PendingChallenge {
            request: ChallengeRequest {
                initiator_fingerprint: self.identity().fingerprint.clone(),
                key,
                encrypted_nonce: STANDARD.encode(sealed),
            },
            expected,
        })
    }

    pub fn check_answer(
        &self,
        peer: &PeerConnection,
        pending: &PendingChallenge,
        answer: &ChallengeResponse,
    ) -> Result<()> {
        let decrypted = STANDARD.decode(&answer.decrypted).unwrap_or_default();
        if !constant_time_eq(&decrypted, &pending.expected) {
            tracing::warn!(
                peer = %peer.name,
                url = %peer.base_url,
                security = true,
                "Challenge answer does not match"
            );
            return Err(AppError::Security(format!(
                "Peer at {} failed the challenge",
                peer.base_url
            )));
        }

        if !same_url(&answer.url, &peer.base_url) {
            tracing::warn!(
                peer = %peer.name,
                url = %peer.base_url,
                answered_for = %answer.url,
                security = true,
                "Challenge answered by an instance published elsewhere"
            );
            return Err(AppError::Security(format!(
                "Challenge sent to {} was answered for {}",
                peer.base_url, answer.url
            )));
        }

        let key = peer.signing_public_key.as_deref().ok_or_else(|| {
            AppError::Validation(format!("No signing key on record for {}", peer.name))
        })?;
        let signature = STANDARD
            .decode(&answer.signature)
            .map_err(|_| AppError::Security("Challenge signature is not valid base64".into()))?;
        let message = challenge_message(&pending.expected, &self.identity().fingerprint, &answer.url);
        verify_signature(key, &message, &signature).map_err(|_| {
            tracing::warn!(peer = %peer.name, security = true, "Challenge signature rejected");
            AppError::Security(format!("Peer at {} failed the challenge", peer.base_url))
        })
    }

    async fn run_challenge(&self, peer: &PeerConnection) -> Result<()> {
        let pending = self.build_challenge(peer)?;
        let answer = self.client.challenge(&peer.base_url, &pending.request).await?;
        self.check_answer(peer, &pending, &answer)
    }

    /// Peer-facing half of the challenge: prove we hold our keys.
    pub async fn answer_challenge(&self, request: ChallengeRequest) -> Result<ChallengeResponse> {
        let peer = self
            .trust_store
            .find_by_fingerprint(&request.initiator_fingerprint)
            .await?
            .ok_or_else(|| {
                AppError::Authentication(format!(
                    "Unknown instance {}",
                    request.initiator_fingerprint
                ))
            })?;

        let cipher = match request.key {
            ChallengeKey::Agreement => {
                let key = peer.agreement_public_key.as_deref().ok_or_else(|| {
                    AppError::Validation("No agreement key stored for initiator".into())
                })?;
                encryption::challenge_cipher_from_agreement(self.identity().agreement_secret(), key)?
            }
            ChallengeKey::SharedSecret => {
                let secret = peer.shared_secret.as_deref().ok_or_else(|| {
                    AppError::Validation("No shared secret stored for initiator".into())
                })?;
                encryption::challenge_cipher_from_secret(secret)?
            }
        };

        let sealed = STANDARD
            .decode(&request.encrypted_nonce)
            .map_err(|_| AppError::Validation("encrypted_nonce is not valid base64".into()))?;
        let plain = cipher.open(&sealed)?;
        let url = self.identity().public_url.trim_end_matches('/').to_string();
        let signature = self
            .identity()
            .sign(&challenge_message(&plain, &request.initiator_fingerprint, &url));
        Ok(ChallengeResponse {
            decrypted: STANDARD.encode(plain),
            url,
            signature: STANDARD.encode(signature),
        })
    }

    /// Challenge a stored peer and promote it to `TRUSTED` on success.
    pub async fn verify_peer(&self, peer_id: uuid::Uuid) -> Result<PeerConnection> {
        let peer = self.trust_store.get(peer_id).await?;
        self.run_challenge(&peer).await?;
        let peer = self
            .trust_store
            .set_trust_status(peer.id, TrustStatus::Trusted)
            .await?;
        tracing::info!(peer = %peer.name, "Peer verified");
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerVerified, ResourceType::PeerConnection)
                    .resource(peer.id),
            )
            .await;
        Ok(peer)
    }

    /// Move a peer to a new URL. Nothing changes unless the instance answering
    /// there is the same one (fingerprint) and passes a fresh challenge.
    pub async fn update_peer_url(&self, peer_id: uuid::Uuid, new_url: &str) -> Result<PeerConnection> {
        let peer = self.trust_store.get(peer_id).await?;
        let new_url = normalize_url(new_url)?;

        let doc = self.client.fetch_identity(&new_url).await?;
        verify_document(&doc)?;
        if !doc.fingerprint.eq_ignore_ascii_case(&peer.fingerprint) {
            tracing::warn!(
                peer = %peer.name,
                url = %new_url,
                security = true,
                "Instance at new URL has a different fingerprint"
            );
            return Err(AppError::Security(format!(
                "Instance at {} is not {}",
                new_url, peer.name
            )));
        }

        let mut candidate = peer.clone();
        candidate.base_url = new_url.clone();
        self.run_challenge(&candidate).await?;

        let updated = self.trust_store.update_url(peer.id, &new_url).await?;
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerUrlChanged, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({
                        "old_url": peer.base_url,
                        "new_url": new_url,
                    })),
            )
            .await;
        Ok(updated)
    }

    /// Tear down a connection from this side, telling the peer if it listens.
    pub async fn terminate(&self, peer_id: uuid::Uuid) -> Result<()> {
        let peer = self.trust_store.get(peer_id).await?;
        if peer.is_trusted() {
            if let Err(e) = self.client.terminate(&peer).await {
                tracing::warn!(peer = %peer.name, "Could not notify peer of termination: {}", e);
            }
        }
        self.trust_store.delete(peer.id).await?;
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerTerminated, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({ "initiated_by": "local" })),
            )
            .await;
        Ok(())
    }

    /// The peer tore the connection down on its side.
    pub async fn handle_remote_terminate(&self, peer: &PeerConnection) -> Result<()> {
        self.trust_store.delete(peer.id).await?;
        tracing::info!(peer = %peer.name, "Peer terminated the connection");
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerTerminated, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({ "initiated_by": "remote" })),
            )
            .await;
        Ok(())
    }

    /// Drop a pending (or any) peer without contacting it.
    pub async fn reject(&self, peer_id: uuid::Uuid) -> Result<()> {
        let peer = self.trust_store.get(peer_id).await?;
        self.trust_store.delete(peer.id).await?;
        self.audit
            .record(
                AuditEntry::new(AuditAction::PeerRejected, ResourceType::PeerConnection)
                    .resource(peer.id)
                    .details(serde_json::json!({
                        "fingerprint": peer.fingerprint,
                        "previous_status": peer.trust_status.to_string(),
                    })),
            )
            .await;
        Ok(())
    }
}
