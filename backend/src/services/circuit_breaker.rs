//! Per-peer circuit breaker.
//!
//! Gates transfer attempts against a peer that keeps failing, so a dead or
//! flapping instance cannot serialize the job queue behind repeated timeouts.
//! State is process-local and rebuilt empty on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_started: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn can_attempt(&self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    /// Whether an attempt may start at `now`.
    ///
    /// An open breaker lets exactly one probe through once `timeout` has passed
    /// since the last failure, moving to half-open. Further callers are refused
    /// until the probe reports back (or itself exceeds `timeout`).
    pub fn can_attempt_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .map(|t| now.saturating_duration_since(t) >= self.config.timeout)
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(now);
                }
                stale
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);
        inner.probe_started = None;
        match inner.state {
            CircuitState::HalfOpen => inner.state = CircuitState::Open,
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Time left before an open breaker admits a probe.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(t)) => {
                Some(self.config.timeout.saturating_sub(t.elapsed()))
            }
            _ => None,
        }
    }
}

/// Snapshot of one breaker for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub peer_id: Uuid,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Process-wide registry of breakers keyed by peer id, created lazily.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<Uuid, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, peer_id: Uuid) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer_id)
        {
            return b.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }

    pub fn reset(&self, peer_id: Uuid) {
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_id);
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(peer_id, b)| BreakerSnapshot {
                peer_id: *peer_id,
                state: b.state(),
                failure_count: b.failure_count(),
            })
            .collect()
    }
}
