//! Health check endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::SharedState;
use crate::services::circuit_breaker::BreakerSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance: String,
    pub fingerprint: String,
    pub checks: HealthChecks,
    /// Breakers that have seen failures since startup.
    pub circuits: Vec<BreakerSnapshot>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckStatus,
    pub storage: CheckStatus,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckStatus {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            message: None,
        }
    }

    fn unhealthy(message: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message),
        }
    }
}

/// Health check endpoint - basic liveness check
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let db_check = match sqlx::query("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => CheckStatus::healthy(),
        Err(e) => CheckStatus::unhealthy(format!("Database connection failed: {}", e)),
    };

    // Every configured tier directory must exist (or be creatable).
    let mut storage_check = CheckStatus::healthy();
    for dir in state.receiver.layout().tier_dirs() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            storage_check =
                CheckStatus::unhealthy(format!("Storage path {} unavailable: {}", dir.display(), e));
            break;
        }
    }

    let healthy = db_check.status == "healthy" && storage_check.status == "healthy";
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance: state.identity.name.clone(),
        fingerprint: state.identity.fingerprint.clone(),
        checks: HealthChecks {
            database: db_check,
            storage: storage_check,
        },
        circuits: state.breakers.snapshot(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
