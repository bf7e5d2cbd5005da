//! Route definitions for the API.

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};

use super::handlers;
use super::middleware::auth::admin_middleware;
use super::SharedState;

/// Slack on top of one chunk for compression overhead and the GCM tag.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    let body_limit = state.config.chunk_size.saturating_mul(2) + BODY_LIMIT_SLACK;

    // Operator surface, bearer-token protected
    let operator = Router::new()
        .route(
            "/api/v1/pairing-code",
            get(handlers::peers::get_pairing_code),
        )
        .nest("/api/v1/peers", handlers::peers::router())
        .nest("/api/v1/files", handlers::transfers::file_router())
        .nest("/api/v1/transfers", handlers::transfers::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ));

    Router::new()
        // Health endpoint (no auth required)
        .route("/health", get(handlers::health::health_check))
        // Peer-facing protocol; authenticates per request
        .merge(handlers::remote::router())
        .merge(operator)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
