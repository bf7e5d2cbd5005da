//! API module - HTTP handlers and middleware.

pub mod handlers;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::Result;
use crate::services::audit_service::AuditService;
use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::services::file_record_service::FileRecordService;
use crate::services::handshake_service::HandshakeService;
use crate::services::identity::InstanceIdentity;
use crate::services::pairing::PairingCodes;
use crate::services::peer_client::PeerClient;
use crate::services::receiver_service::ReceiverService;
use crate::services::retry_policy::RetryPolicy;
use crate::services::transfer_engine::{EngineSettings, TransferEngine};
use crate::services::transfer_ledger::TransferLedger;
use crate::services::transfer_worker::TransferWorker;
use crate::services::trust_store::TrustStore;
use crate::storage::StorageLayout;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: SqlitePool,
    pub identity: Arc<InstanceIdentity>,
    /// Process-wide rotating pairing code.
    pub pairing: Arc<PairingCodes>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub trust_store: TrustStore,
    pub files: FileRecordService,
    pub audit: AuditService,
    pub handshake: HandshakeService,
    pub receiver: Arc<ReceiverService>,
    pub worker: Arc<TransferWorker>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, identity: Arc<InstanceIdentity>) -> Result<Self> {
        let client = PeerClient::new(
            identity.clone(),
            config.peer_connect_timeout,
            config.peer_read_timeout,
        )?;
        let pairing = Arc::new(PairingCodes::new(config.pairing_code_ttl));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            timeout: config.circuit_timeout,
        }));
        let layout = StorageLayout::new(config.storage_paths.clone());

        let trust_store = TrustStore::new(db.clone());
        let audit = AuditService::new(db.clone());
        let handshake = HandshakeService::new(
            trust_store.clone(),
            client.clone(),
            pairing.clone(),
            audit.clone(),
            config.transfer_mode,
        );
        let receiver = Arc::new(ReceiverService::new(
            layout.clone(),
            identity.clone(),
            config.part_file_ttl,
        ));
        let engine = TransferEngine::new(
            db.clone(),
            client,
            breakers.clone(),
            layout,
            EngineSettings {
                chunk_size: config.chunk_size,
                retry: RetryPolicy {
                    max_retries: config.max_retries,
                    base_delay: config.retry_base_delay,
                    max_delay: config.retry_max_delay,
                },
            },
        );

        Ok(Self {
            files: FileRecordService::new(db.clone()),
            worker: TransferWorker::new(engine),
            config,
            db,
            identity,
            pairing,
            breakers,
            trust_store,
            audit,
            handshake,
            receiver,
        })
    }

    pub fn engine(&self) -> &TransferEngine {
        self.worker.engine()
    }

    pub fn ledger(&self) -> &TransferLedger {
        self.worker.engine().ledger()
    }
}

pub type SharedState = Arc<AppState>;
