//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Caller supplied something unusable (bad path, unknown mode, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict error (e.g. job already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request could not be attributed to a trusted peer or operator
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Path traversal, bad signature, bad pairing code
    #[error("Security violation: {0}")]
    Security(String),

    /// Timeouts, connection resets and 5xx answers from a peer
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Peer asked us to slow down (429 / 503)
    #[error("Rate limited by peer: {0}")]
    RateLimited(String),

    /// Checksum mismatch or impossible resume offset
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Peer answered with a non-retryable 4xx
    #[error("Peer rejected request ({status}): {message}")]
    PeerRejected { status: u16, message: String },

    /// Peer circuit breaker is open
    #[error("Circuit open for peer: {0}")]
    CircuitOpen(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address parse error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, shared by both ends of the peer protocol.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "MIGRATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Authentication(_) => "AUTH_ERROR",
            AppError::Security(_) => "SECURITY_ERROR",
            AppError::TransientNetwork(_) => "TRANSIENT_NETWORK",
            AppError::RateLimited(_) => "RATE_LIMITED",
            AppError::Corruption(_) => "CHECKSUM_MISMATCH",
            AppError::PeerRejected { .. } => "PEER_REJECTED",
            AppError::CircuitOpen(_) => "CIRCUIT_OPEN",
            AppError::Io(_) => "IO_ERROR",
            AppError::AddrParse(_) => "ADDR_PARSE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Security(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Corruption(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::TransientNetwork(_) | AppError::PeerRejected { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_)
            | AppError::Database(_)
            | AppError::Migration(_)
            | AppError::Io(_)
            | AppError::AddrParse(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Security-relevant failures are logged with elevated severity.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            AppError::Security(_) | AppError::Authentication(_) | AppError::Corruption(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = match &self {
            AppError::Database(_) => "Database operation failed".to_string(),
            AppError::Migration(_) => "Database migration failed".to_string(),
            AppError::Io(_) => "IO operation failed".to_string(),
            AppError::Json(_) => "Invalid JSON".to_string(),
            AppError::AddrParse(_) => "Invalid address".to_string(),
            AppError::Config(msg)
            | AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Authentication(msg)
            | AppError::Security(msg)
            | AppError::TransientNetwork(msg)
            | AppError::RateLimited(msg)
            | AppError::Corruption(msg)
            | AppError::CircuitOpen(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::PeerRejected { message, .. } => message.clone(),
        };

        if self.is_security() {
            tracing::warn!(error = %self, code = code, security = true, "Request rejected");
        } else if status.is_server_error() {
            tracing::error!(error = %self, code = code, "Request error");
        } else {
            tracing::debug!(error = %self, code = code, "Request error");
        }

        let body = Json(json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
