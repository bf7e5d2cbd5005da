//! Transfer encryption primitives.
//!
//! AES-256-GCM authenticated encryption keyed either by an ephemeral X25519
//! agreement (one key per transfer attempt) or, for challenges, by static
//! key material shared between two paired instances.
//!
//! Key derivation is HMAC-SHA256 with the agreement output (or legacy shared
//! secret) as the HMAC key and a domain label plus context as the message.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const SESSION_LABEL: &[u8] = b"file-fridge/transfer-session/aes-256-gcm/v1";
const CHALLENGE_LABEL: &[u8] = b"file-fridge/challenge/x25519/v1";
const CHALLENGE_SECRET_LABEL: &[u8] = b"file-fridge/challenge/shared-secret/v1";

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid nonce length: expected 12 bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key agreement produced a non-contributory shared secret")]
    WeakKeyAgreement,
}

impl From<EncryptionError> for AppError {
    fn from(e: EncryptionError) -> Self {
        AppError::Security(e.to_string())
    }
}

fn derive_key(ikm: &[u8], label: &[u8], context: &[&[u8]]) -> Result<[u8; 32], EncryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(ikm)
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
    mac.update(label);
    for part in context {
        mac.update(&(part.len() as u32).to_be_bytes());
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn public_key(bytes: &[u8]) -> Result<PublicKey, EncryptionError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EncryptionError::InvalidKeyLength(bytes.len()))?;
    Ok(PublicKey::from(arr))
}

fn contributory(shared: SharedSecret) -> Result<SharedSecret, EncryptionError> {
    if shared.was_contributory() {
        Ok(shared)
    } else {
        Err(EncryptionError::WeakKeyAgreement)
    }
}

/// AES-256-GCM cipher bound to one derived key.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Encrypt one chunk under a fresh random nonce. Returns `(nonce, ciphertext+tag)`.
    pub fn encrypt_chunk(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<([u8; NONCE_LEN], Vec<u8>), EncryptionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        Ok((nonce_bytes, ciphertext))
    }

    pub fn decrypt_chunk(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        if nonce.len() != NONCE_LEN {
            return Err(EncryptionError::InvalidNonceLength(nonce.len()));
        }
        if ciphertext.len() < TAG_LEN {
            return Err(EncryptionError::CiphertextTooShort);
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::DecryptionFailed)
    }

    /// Encrypt into the self-contained `nonce || ciphertext+tag` layout.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let (nonce, ciphertext) = self.encrypt_chunk(plaintext, &[])?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::CiphertextTooShort);
        }
        self.decrypt_chunk(&data[..NONCE_LEN], &data[NONCE_LEN..], &[])
    }
}

/// Associated data binding a chunk to its job and position.
pub fn chunk_aad(job_id: Uuid, chunk_index: u64) -> Vec<u8> {
    format!("{}:{}", job_id, chunk_index).into_bytes()
}

/// Sender side: draw an ephemeral key against the peer's static agreement key.
///
/// Returns the ephemeral public key to announce and the cipher for this attempt.
pub fn initiate_session(
    peer_agreement_key: &[u8],
    job_id: Uuid,
) -> Result<([u8; 32], SessionCipher), EncryptionError> {
    let peer = public_key(peer_agreement_key)?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = contributory(ephemeral.diffie_hellman(&peer))?;
    let key = derive_key(
        shared.as_bytes(),
        SESSION_LABEL,
        &[ephemeral_public.as_bytes(), peer.as_bytes(), job_id.as_bytes()],
    )?;
    Ok((*ephemeral_public.as_bytes(), SessionCipher::new(&key)?))
}

/// Receiver side: re-derive the session key from the announced ephemeral key.
pub fn accept_session(
    local_agreement: &StaticSecret,
    ephemeral_public: &[u8],
    job_id: Uuid,
) -> Result<SessionCipher, EncryptionError> {
    let ephemeral = public_key(ephemeral_public)?;
    let local_public = PublicKey::from(local_agreement);
    let shared = contributory(local_agreement.diffie_hellman(&ephemeral))?;
    let key = derive_key(
        shared.as_bytes(),
        SESSION_LABEL,
        &[ephemeral.as_bytes(), local_public.as_bytes(), job_id.as_bytes()],
    )?;
    SessionCipher::new(&key)
}

/// Challenge key from the two instances' static agreement keys.
///
/// Both sides compute the same key; public keys are ordered so the context
/// does not depend on who is verifying whom.
pub fn challenge_cipher_from_agreement(
    local_agreement: &StaticSecret,
    peer_agreement_key: &[u8],
) -> Result<SessionCipher, EncryptionError> {
    let peer = public_key(peer_agreement_key)?;
    let local_public = PublicKey::from(local_agreement);
    let shared = contributory(local_agreement.diffie_hellman(&peer))?;
    let (a, b) = if local_public.as_bytes() <= peer.as_bytes() {
        (local_public.as_bytes(), peer.as_bytes())
    } else {
        (peer.as_bytes(), local_public.as_bytes())
    };
    let key = derive_key(shared.as_bytes(), CHALLENGE_LABEL, &[a, b])?;
    SessionCipher::new(&key)
}

/// Challenge key for peers that only share a legacy secret.
pub fn challenge_cipher_from_secret(shared_secret: &str) -> Result<SessionCipher, EncryptionError> {
    let key = derive_key(shared_secret.as_bytes(), CHALLENGE_SECRET_LABEL, &[])?;
    SessionCipher::new(&key)
}
