//! HTTP request handlers.

pub mod health;
pub mod peers;
pub mod remote;
pub mod transfers;
