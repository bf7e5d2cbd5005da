//! Common test utilities for backend integration tests
//!
//! This module provides shared infrastructure for testing:
//! - Full instances served on an ephemeral local port
//! - Scripted peers built from plain axum routers
//! - Pairing and file helpers

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use fridge_backend::api::{routes, AppState, SharedState};
use fridge_backend::config::{Config, StoragePathConfig};
use fridge_backend::db;
use fridge_backend::models::file_record::{FileRecord, StorageTier};
use fridge_backend::models::peer_connection::{PeerConnection, TransferMode};
use fridge_backend::services::identity::InstanceIdentity;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Storage location id every test instance exposes.
pub const PATH_ID: i64 = 1;

/// Configuration with fast retries and small timeouts.
pub fn test_config(name: &str, url: &str, root: &Path) -> Config {
    Config {
        database_url: "sqlite::memory:".into(),
        bind_address: "127.0.0.1:0".into(),
        instance_name: name.into(),
        public_url: url.into(),
        admin_token: ADMIN_TOKEN.into(),
        transfer_mode: TransferMode::PushOnly,
        storage_paths: vec![StoragePathConfig {
            id: PATH_ID,
            hot_path: root.join("hot"),
            cold_path: root.join("cold"),
        }],
        chunk_size: fixtures::MIB,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(20),
        retry_max_delay: Duration::from_millis(100),
        circuit_failure_threshold: 10,
        circuit_timeout: Duration::from_secs(60),
        peer_connect_timeout: Duration::from_secs(2),
        peer_read_timeout: Duration::from_secs(10),
        pairing_code_ttl: Duration::from_secs(600),
        request_max_age: Duration::from_secs(300),
        part_file_ttl: Duration::from_secs(3600),
        transfer_poll_interval: Duration::from_secs(60),
    }
}

/// A complete instance listening on 127.0.0.1 with its own database and
/// storage directories. The background poller is not started; tests drive
/// jobs explicitly.
pub struct TestInstance {
    pub state: SharedState,
    pub url: String,
    root: TempDir,
    server: JoinHandle<()>,
}

impl TestInstance {
    pub async fn start(name: &str) -> Self {
        Self::start_with(name, |_| {}).await
    }

    pub async fn start_with(name: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let url = format!("http://{}", listener.local_addr().unwrap());

        let mut config = test_config(name, &url, root.path());
        tweak(&mut config);
        for cfg in &config.storage_paths {
            tokio::fs::create_dir_all(&cfg.hot_path).await.unwrap();
            tokio::fs::create_dir_all(&cfg.cold_path).await.unwrap();
        }

        let pool = db::create_memory_pool().await.unwrap();
        db::migrate(&pool).await.unwrap();
        let identity = Arc::new(InstanceIdentity::generate(name, &url));
        let state = Arc::new(AppState::new(config, pool, identity).unwrap());

        let app = routes::create_router(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            url,
            root,
            server,
        }
    }

    pub fn tier_dir(&self, tier: StorageTier) -> PathBuf {
        match tier {
            StorageTier::Hot => self.root.path().join("hot"),
            StorageTier::Cold => self.root.path().join("cold"),
        }
    }

    /// Where a file sent to this instance under `relative` ends up.
    pub fn stored(&self, tier: StorageTier, relative: &str) -> PathBuf {
        self.tier_dir(tier).join(relative)
    }

    /// Write `data` into this instance's hot tier and register it.
    pub async fn add_file(&self, relative: &str, data: &[u8]) -> FileRecord {
        let path = self.stored(StorageTier::Hot, relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, data).await.unwrap();
        self.state
            .files
            .register(&path, StorageTier::Hot)
            .await
            .expect("Failed to register file")
    }

    pub fn admin(&self, client: &reqwest::Client, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        client
            .request(method, format!("{}{}", self.url, path))
            .bearer_auth(ADMIN_TOKEN)
    }
}

impl Drop for TestInstance {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Pair `a` with `b` using `b`'s current pairing code. Returns the record
/// each side holds for the other.
pub async fn pair(a: &TestInstance, b: &TestInstance) -> (PeerConnection, PeerConnection) {
    let code = b.state.pairing.current().code;
    let on_a = a
        .state
        .handshake
        .initiate_handshake(&b.url, &code, None)
        .await
        .expect("Handshake failed");
    let on_b = b
        .state
        .trust_store
        .find_by_fingerprint(&a.state.identity.fingerprint)
        .await
        .unwrap()
        .expect("Responder did not record the initiator");
    (on_a, on_b)
}

/// Serve a scripted peer. Returns its base URL.
pub async fn serve_mock(router: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (url, handle)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
