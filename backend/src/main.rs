//! File-Fridge Backend - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::trace::TraceLayer;

use fridge_backend::{
    api,
    config::Config,
    db,
    error::Result,
    services::{identity::InstanceIdentity, transfer_worker},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    telemetry::init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting File-Fridge transfer core");

    // Connect to database
    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    db::migrate(&db_pool).await?;
    tracing::info!("Database migrations complete");

    let identity = Arc::new(
        InstanceIdentity::load_or_create(&db_pool, &config.instance_name, &config.public_url)
            .await?,
    );
    tracing::info!(
        "Instance identity: {} ({})",
        identity.name,
        identity.fingerprint
    );

    let state = api::AppState::new(config.clone(), db_pool, identity)?;

    // Jobs left IN_PROGRESS by a crash go back to the queue.
    let recovered = state.ledger().recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!("Requeued {} interrupted transfer jobs", recovered);
    }

    let pairing = state.pairing.current();
    tracing::info!(
        "Pairing code: {} (valid for {}s)",
        pairing.code,
        pairing.expires_in_secs
    );

    let state = Arc::new(state);
    transfer_worker::spawn_background(
        state.worker.clone(),
        state.receiver.clone(),
        config.transfer_poll_interval,
    );

    let app = api::routes::create_router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
