//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::peer_connection::TransferMode;

/// Default transfer chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// One storage location and its per-tier base directories.
///
/// Remote peers address a location by `id`; every incoming write must resolve
/// inside the directory of the declared tier.
#[derive(Debug, Clone, Deserialize)]
pub struct StoragePathConfig {
    pub id: i64,
    pub hot_path: PathBuf,
    pub cold_path: PathBuf,
}

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Display name announced to peers
    pub instance_name: String,

    /// URL peers use to reach this instance
    pub public_url: String,

    /// Bearer token guarding the operator API
    pub admin_token: String,

    /// Whether this instance accepts pull requests from peers
    pub transfer_mode: TransferMode,

    /// Storage locations exposed to peers
    pub storage_paths: Vec<StoragePathConfig>,

    /// Plaintext bytes per transfer chunk
    pub chunk_size: usize,

    /// Attempts allowed per job before it stays failed
    pub max_retries: u32,

    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub circuit_failure_threshold: u32,
    pub circuit_timeout: Duration,

    pub peer_connect_timeout: Duration,
    pub peer_read_timeout: Duration,

    /// Lifetime of a pairing code before it rotates
    pub pairing_code_ttl: Duration,

    /// Maximum clock skew accepted on signed peer requests
    pub request_max_age: Duration,

    /// Age after which orphaned `.part` files are swept
    pub part_file_ttl: Duration,

    /// How often the transfer worker polls the ledger
    pub transfer_poll_interval: Duration,
}

redacted_debug!(Config {
    show database_url,
    show bind_address,
    show instance_name,
    show public_url,
    redact admin_token,
    show transfer_mode,
    show storage_paths,
    show chunk_size,
    show max_retries,
    show retry_base_delay,
    show retry_max_delay,
    show circuit_failure_threshold,
    show circuit_timeout,
    show peer_connect_timeout,
    show peer_read_timeout,
    show pairing_code_ttl,
    show request_max_age,
    show part_file_ttl,
    show transfer_poll_interval,
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let storage_paths = match env::var("STORAGE_PATHS") {
            Ok(raw) => parse_storage_paths(&raw)?,
            Err(_) => Vec::new(),
        };

        let transfer_mode = match env::var("TRANSFER_MODE") {
            Ok(raw) => TransferMode::from_str(&raw).map_err(AppError::Config)?,
            Err(_) => TransferMode::PushOnly,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://fridge.db?mode=rwc".into()),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            instance_name: env::var("INSTANCE_NAME").unwrap_or_else(|_| "file-fridge".into()),
            public_url: env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:8080".into()),
            admin_token: env::var("ADMIN_TOKEN")
                .map_err(|_| AppError::Config("ADMIN_TOKEN not set".into()))?,
            transfer_mode,
            storage_paths,
            chunk_size: env_parse("TRANSFER_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            max_retries: env_parse("TRANSFER_MAX_RETRIES", 3),
            retry_base_delay: env_secs("RETRY_BASE_DELAY_SECS", 10),
            retry_max_delay: env_secs("RETRY_MAX_DELAY_SECS", 300),
            circuit_failure_threshold: env_parse("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_timeout: env_secs("CIRCUIT_TIMEOUT_SECS", 300),
            peer_connect_timeout: env_secs("PEER_CONNECT_TIMEOUT_SECS", 10),
            peer_read_timeout: env_secs("PEER_READ_TIMEOUT_SECS", 120),
            pairing_code_ttl: env_secs("PAIRING_CODE_TTL_SECS", 3600),
            request_max_age: env_secs("REQUEST_MAX_AGE_SECS", 300),
            part_file_ttl: env_secs("PART_FILE_TTL_SECS", 86_400),
            transfer_poll_interval: env_secs("TRANSFER_POLL_INTERVAL_SECS", 10),
        })
    }

    /// Look up a storage location by the id peers use.
    pub fn storage_path(&self, id: i64) -> Option<&StoragePathConfig> {
        self.storage_paths.iter().find(|p| p.id == id)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

/// Parse the `STORAGE_PATHS` JSON array.
pub fn parse_storage_paths(raw: &str) -> Result<Vec<StoragePathConfig>> {
    let paths: Vec<StoragePathConfig> = serde_json::from_str(raw)
        .map_err(|e| AppError::Config(format!("STORAGE_PATHS is not valid JSON: {}", e)))?;

    for (i, path) in paths.iter().enumerate() {
        if paths[..i].iter().any(|p| p.id == path.id) {
            return Err(AppError::Config(format!(
                "STORAGE_PATHS contains duplicate id {}",
                path.id
            )));
        }
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_paths() {
        let paths = parse_storage_paths(
            r#"[{"id": 1, "hot_path": "/srv/hot", "cold_path": "/srv/cold"}]"#,
        )
        .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].id, 1);
        assert_eq!(paths[0].cold_path, PathBuf::from("/srv/cold"));
    }

    #[test]
    fn test_parse_storage_paths_rejects_duplicates() {
        let raw = r#"[
            {"id": 1, "hot_path": "/a", "cold_path": "/b"},
            {"id": 1, "hot_path": "/c", "cold_path": "/d"}
        ]"#;
        assert!(matches!(parse_storage_paths(raw), Err(AppError::Config(_))));
    }

    #[test]
    fn test_parse_storage_paths_invalid_json() {
        assert!(parse_storage_paths("not json").is_err());
    }
}
