//! Long-term identity of this instance.
//!
//! An Ed25519 key signs peer requests and an X25519 key anchors key agreement.
//! Both are generated on first boot and persisted, so the fingerprint peers
//! pinned at pairing time survives restarts.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{AppError, Result};
use crate::models::peer_connection::TransferMode;
use crate::protocol::IdentityDocument;

pub struct InstanceIdentity {
    pub name: String,
    pub public_url: String,
    pub fingerprint: String,
    signing_key: SigningKey,
    agreement_key: StaticSecret,
}

redacted_debug!(InstanceIdentity {
    show name,
    show public_url,
    show fingerprint,
    redact signing_key,
    redact agreement_key,
});

/// Lowercase hex SHA-256 over `signing_pub || agreement_pub`.
pub fn compute_fingerprint(signing_public: &[u8], agreement_public: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signing_public);
    hasher.update(agreement_public);
    hex::encode(hasher.finalize())
}

fn key_array(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| {
        AppError::Validation(format!(
            "{} must be 32 bytes, got {}",
            what,
            bytes.len()
        ))
    })
}

impl InstanceIdentity {
    pub fn generate(name: &str, public_url: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement_key = StaticSecret::random_from_rng(OsRng);
        Self::assemble(name, public_url, signing_key, agreement_key)
    }

    pub fn from_secret_bytes(
        name: &str,
        public_url: &str,
        signing_secret: &[u8],
        agreement_secret: &[u8],
    ) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(&key_array(signing_secret, "signing key")?);
        let agreement_key = StaticSecret::from(key_array(agreement_secret, "agreement key")?);
        Ok(Self::assemble(name, public_url, signing_key, agreement_key))
    }

    fn assemble(
        name: &str,
        public_url: &str,
        signing_key: SigningKey,
        agreement_key: StaticSecret,
    ) -> Self {
        let fingerprint = compute_fingerprint(
            signing_key.verifying_key().as_bytes(),
            PublicKey::from(&agreement_key).as_bytes(),
        );
        Self {
            name: name.to_string(),
            public_url: public_url.to_string(),
            fingerprint,
            signing_key,
            agreement_key,
        }
    }

    /// Load the persisted identity, creating it on first boot.
    ///
    /// Name and URL follow the current configuration; keys never change.
    pub async fn load_or_create(db: &SqlitePool, name: &str, public_url: &str) -> Result<Self> {
        let row: Option<(Vec<u8>, Vec<u8>)> =
            sqlx::query_as("SELECT signing_key, agreement_key FROM instance_identity WHERE id = 1")
                .fetch_optional(db)
                .await?;

        let now = Utc::now();
        match row {
            Some((signing, agreement)) => {
                let identity = Self::from_secret_bytes(name, public_url, &signing, &agreement)?;
                sqlx::query(
                    "UPDATE instance_identity SET name = ?, public_url = ?, updated_at = ? WHERE id = 1",
                )
                .bind(name)
                .bind(public_url)
                .bind(now)
                .execute(db)
                .await?;
                tracing::info!(fingerprint = %identity.fingerprint, "Loaded instance identity");
                Ok(identity)
            }
            None => {
                let identity = Self::generate(name, public_url);
                sqlx::query(
                    r#"
                    INSERT INTO instance_identity
                        (id, name, public_url, signing_key, agreement_key, created_at, updated_at)
                    VALUES (1, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(name)
                .bind(public_url)
                .bind(identity.signing_key.to_bytes().to_vec())
                .bind(identity.agreement_key.to_bytes().to_vec())
                .bind(now)
                .bind(now)
                .execute(db)
                .await?;
                tracing::info!(fingerprint = %identity.fingerprint, "Generated new instance identity");
                Ok(identity)
            }
        }
    }

    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn agreement_public_key(&self) -> [u8; 32] {
        *PublicKey::from(&self.agreement_key).as_bytes()
    }

    pub fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement_key
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn document(&self, transfer_mode: TransferMode) -> IdentityDocument {
        IdentityDocument {
            name: self.name.clone(),
            url: self.public_url.clone(),
            fingerprint: self.fingerprint.clone(),
            signing_public_key: STANDARD.encode(self.signing_public_key()),
            agreement_public_key: STANDARD.encode(self.agreement_public_key()),
            transfer_mode,
        }
    }
}

/// Public keys decoded from a peer's identity document.
#[derive(Debug, Clone)]
pub struct PeerKeys {
    pub signing_public_key: Vec<u8>,
    pub agreement_public_key: Vec<u8>,
}

/// Check a detached Ed25519 signature against a stored verifying key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(&key_array(public_key, "signing_public_key")?)
        .map_err(|_| AppError::Security("Stored signing key is invalid".into()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| AppError::Security("Malformed signature".into()))?;
    key.verify(message, &signature)
        .map_err(|_| AppError::Security("Bad signature".into()))
}

/// Decode the keys in `doc` and check they hash to the advertised fingerprint.
pub fn verify_document(doc: &IdentityDocument) -> Result<PeerKeys> {
    let signing = STANDARD
        .decode(&doc.signing_public_key)
        .map_err(|_| AppError::Validation("signing_public_key is not valid base64".into()))?;
    let agreement = STANDARD
        .decode(&doc.agreement_public_key)
        .map_err(|_| AppError::Validation("agreement_public_key is not valid base64".into()))?;
    key_array(&signing, "signing_public_key")?;
    key_array(&agreement, "agreement_public_key")?;

    let expected = compute_fingerprint(&signing, &agreement);
    if !expected.eq_ignore_ascii_case(&doc.fingerprint) {
        return Err(AppError::Security(format!(
            "Fingerprint mismatch for {}: advertised {}, keys hash to {}",
            doc.url, doc.fingerprint, expected
        )));
    }

    Ok(PeerKeys {
        signing_public_key: signing,
        agreement_public_key: agreement,
    })
}
