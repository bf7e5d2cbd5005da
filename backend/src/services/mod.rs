//! Business logic services.

pub mod audit_service;
pub mod chunk_codec;
pub mod circuit_breaker;
pub mod encryption;
pub mod file_record_service;
pub mod handshake_service;
pub mod identity;
pub mod pairing;
pub mod peer_client;
pub mod receiver_service;
pub mod request_signing;
pub mod retry_policy;
pub mod transfer_engine;
pub mod transfer_ledger;
pub mod transfer_worker;
pub mod trust_store;
