//! Telemetry initialization: stdout tracing subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "fridge_backend=debug,tower_http=debug,sqlx::query=info";

/// Initialize the tracing subscriber.
///
/// Security events are logged with a `security = true` field so they can be
/// filtered downstream.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
