//! Authentication middleware for the operator API.
//!
//! Supported authentication methods:
//! - `Authorization: Bearer <admin_token>`
//! - `X-API-Key: <admin_token>`
//!
//! Peer-facing endpoints do not use this; they verify request signatures.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::SharedState;
use crate::error::AppError;
use crate::services::pairing::constant_time_eq;

/// Custom header name for API key
static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Token extraction result
#[derive(Debug, PartialEq, Eq)]
enum ExtractedToken<'a> {
    Token(&'a str),
    /// No token found
    None,
    /// Invalid header format
    Invalid,
}

fn extract_token_from_auth_header(auth_header: &str) -> ExtractedToken<'_> {
    match auth_header.strip_prefix("Bearer ") {
        Some(token) => ExtractedToken::Token(token.trim()),
        None => ExtractedToken::Invalid,
    }
}

/// Checks: Authorization (Bearer), X-API-Key
fn extract_token(request: &Request) -> ExtractedToken<'_> {
    if let Some(auth_header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        return extract_token_from_auth_header(auth_header);
    }

    if let Some(api_key) = request
        .headers()
        .get(&X_API_KEY)
        .and_then(|h| h.to_str().ok())
    {
        return ExtractedToken::Token(api_key.trim());
    }

    ExtractedToken::None
}

/// Admin middleware - requires the configured admin token
pub async fn admin_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    match extract_token(&request) {
        ExtractedToken::Token(token)
            if !state.config.admin_token.is_empty()
                && constant_time_eq(token.as_bytes(), state.config.admin_token.as_bytes()) =>
        {
            next.run(request).await
        }
        ExtractedToken::Token(_) => {
            AppError::Authentication("Invalid admin token".into()).into_response()
        }
        ExtractedToken::Invalid => {
            AppError::Authentication("Invalid authorization header format".into()).into_response()
        }
        ExtractedToken::None => {
            AppError::Authentication("Missing authorization token".into()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(
            extract_token_from_auth_header("Bearer abc123"),
            ExtractedToken::Token("abc123")
        );
    }

    #[test]
    fn test_extract_other_scheme_is_invalid() {
        assert_eq!(
            extract_token_from_auth_header("Basic dXNlcjpwYXNz"),
            ExtractedToken::Invalid
        );
        assert_eq!(
            extract_token_from_auth_header("bearer abc"),
            ExtractedToken::Invalid
        );
    }

    #[test]
    fn test_extract_from_api_key_header() {
        let request = Request::builder()
            .header("x-api-key", "k3y")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request), ExtractedToken::Token("k3y"));
    }

    #[test]
    fn test_extract_none() {
        let request = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&request), ExtractedToken::None);
    }
}
