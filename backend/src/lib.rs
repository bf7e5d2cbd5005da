//! File-Fridge Backend Library
//!
//! Moves files between File-Fridge instances that have paired with each
//! other: chunked, resumable, signed and integrity-checked.

#[macro_use]
mod macros;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
