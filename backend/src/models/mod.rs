//! Database models (SQLx).

pub mod file_record;
pub mod peer_connection;
pub mod transfer_job;
