//! Retry policy: error classification and backoff computation.
//!
//! Independent of the circuit breaker. The policy answers "what kind of
//! failure was this and how long should the job wait"; the breaker answers
//! "is this peer healthy enough to try at all".

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Multiplier applied to the base delay when the peer asked us to slow down.
const RATE_LIMIT_MULTIPLIER: u32 = 3;

/// Maximum jitter as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transient,
    Permanent,
    RateLimited,
    /// Attempt never started because the peer's breaker was open.
    CircuitOpen,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::Permanent => "PERMANENT",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error raised anywhere in a transfer attempt.
pub fn classify(err: &AppError) -> ErrorClass {
    match err {
        AppError::TransientNetwork(_) => ErrorClass::Transient,
        AppError::RateLimited(_) => ErrorClass::RateLimited,
        AppError::CircuitOpen(_) => ErrorClass::CircuitOpen,
        AppError::PeerRejected { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(ErrorClass::Permanent),
        // Local disk or database hiccups are worth another go.
        AppError::Io(_) | AppError::Database(_) => ErrorClass::Transient,
        AppError::Validation(_)
        | AppError::NotFound(_)
        | AppError::Conflict(_)
        | AppError::Authentication(_)
        | AppError::Security(_)
        | AppError::Corruption(_)
        | AppError::Config(_)
        | AppError::Migration(_)
        | AppError::AddrParse(_)
        | AppError::Json(_)
        | AppError::Internal(_) => ErrorClass::Permanent,
    }
}

/// Classify a non-success HTTP status returned by a peer.
pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        ErrorClass::RateLimited
    } else if status.is_server_error() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts a job may consume before it stays failed.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has failed `attempts` times with `class` gets another run.
    ///
    /// Circuit-open fast fails never consumed an attempt, so they are always
    /// eligible once the breaker lets traffic through again.
    pub fn should_retry(&self, class: ErrorClass, attempts: u32) -> bool {
        match class {
            ErrorClass::Permanent => false,
            ErrorClass::CircuitOpen => true,
            ErrorClass::Transient | ErrorClass::RateLimited => attempts < self.max_retries,
        }
    }

    /// Backoff without jitter for the `attempt`-th failure (0-based).
    pub fn base_delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        let (base, cap) = match class {
            ErrorClass::RateLimited => (
                self.base_delay.saturating_mul(RATE_LIMIT_MULTIPLIER),
                self.max_delay.saturating_mul(RATE_LIMIT_MULTIPLIER),
            ),
            _ => (self.base_delay, self.max_delay),
        };
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(cap)
    }

    /// Backoff for the `attempt`-th failure plus up to 10% random jitter.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        let delay = self.base_delay_for(class, attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        delay + delay.mul_f64(jitter)
    }
}
