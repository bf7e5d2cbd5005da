//! Rotating pairing code.
//!
//! One code per process, shown to the operator and exchanged out-of-band.
//! Codes expire after a fixed window; an expired code is replaced on the next
//! access and every handshake still presenting it is refused.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

/// No 0/O, 1/I/L: codes are read aloud and typed by hand.
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

#[derive(Debug)]
struct CodeState {
    code: String,
    issued_at: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingCodeView {
    /// Display form, `XXXX-XXXX`.
    pub code: String,
    pub expires_in_secs: u64,
    pub generation: u64,
}

#[derive(Debug)]
pub struct PairingCodes {
    ttl: Duration,
    state: RwLock<CodeState>,
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn format_code(code: &str) -> String {
    if code.len() == CODE_LEN {
        format!("{}-{}", &code[..CODE_LEN / 2], &code[CODE_LEN / 2..])
    } else {
        code.to_string()
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl PairingCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CodeState {
                code: generate_code(),
                issued_at: Instant::now(),
                generation: 1,
            }),
        }
    }

    fn rotate_locked(state: &mut CodeState, now: Instant) {
        let mut next = generate_code();
        while next == state.code {
            next = generate_code();
        }
        state.code = next;
        state.issued_at = now;
        state.generation += 1;
    }

    /// Force a new code, invalidating the current one.
    pub fn rotate(&self) -> PairingCodeView {
        self.rotate_at(Instant::now())
    }

    pub fn rotate_at(&self, now: Instant) -> PairingCodeView {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Self::rotate_locked(&mut state, now);
        tracing::info!(generation = state.generation, "Pairing code rotated");
        self.view(&state, now)
    }

    pub fn current(&self) -> PairingCodeView {
        self.current_at(Instant::now())
    }

    pub fn current_at(&self, now: Instant) -> PairingCodeView {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !self.expired(&state, now) {
                return self.view(&state, now);
            }
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if self.expired(&state, now) {
            Self::rotate_locked(&mut state, now);
            tracing::info!(generation = state.generation, "Pairing code expired and rotated");
        }
        self.view(&state, now)
    }

    pub fn validate(&self, presented: &str) -> bool {
        self.validate_at(presented, Instant::now())
    }

    /// Check `presented` against the live code. Case and dashes are ignored.
    pub fn validate_at(&self, presented: &str, now: Instant) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if self.expired(&state, now) {
            Self::rotate_locked(&mut state, now);
            tracing::info!(generation = state.generation, "Pairing code expired and rotated");
            return false;
        }
        constant_time_eq(normalize(presented).as_bytes(), state.code.as_bytes())
    }

    fn expired(&self, state: &CodeState, now: Instant) -> bool {
        now.saturating_duration_since(state.issued_at) >= self.ttl
    }

    fn view(&self, state: &CodeState, now: Instant) -> PairingCodeView {
        PairingCodeView {
            code: format_code(&state.code),
            expires_in_secs: self
                .ttl
                .saturating_sub(now.saturating_duration_since(state.issued_at))
                .as_secs(),
            generation: state.generation,
        }
    }
}
