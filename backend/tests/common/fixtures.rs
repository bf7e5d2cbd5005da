//! Test fixtures: file contents and peer identities.

#![allow(dead_code)]

use fridge_backend::models::peer_connection::{PeerConnection, TransferMode, TrustStatus};
use fridge_backend::services::identity::{verify_document, InstanceIdentity};
use fridge_backend::services::trust_store::{PeerRegistration, TrustStore};

pub const MIB: usize = 1024 * 1024;

/// Deterministic bytes that deflate poorly, so chunk counts stay meaningful.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Register a trusted peer at `url` backed by a freshly generated identity.
///
/// Used for scripted peers that never check signatures.
pub async fn trusted_peer_at(trust_store: &TrustStore, name: &str, url: &str) -> PeerConnection {
    let remote = InstanceIdentity::generate(name, url);
    trusted_peer_for(trust_store, &remote).await
}

/// Register `remote` as a trusted peer, for scripted peers that need its keys.
pub async fn trusted_peer_for(trust_store: &TrustStore, remote: &InstanceIdentity) -> PeerConnection {
    let doc = remote.document(TransferMode::PushOnly);
    let keys = verify_document(&doc).expect("generated identity must verify");
    trust_store
        .upsert(PeerRegistration {
            document: &doc,
            keys: &keys,
            trust_status: TrustStatus::Trusted,
            local_transfer_mode: TransferMode::PushOnly,
            shared_secret: None,
        })
        .await
        .expect("Failed to register peer")
}
