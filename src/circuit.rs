//! Per-text retry budget: Fresh → Failing(n) → Open.
//! Keyed by `(text_hash, target_lang)`. Hard failures advance the counter;
//! rate-limit signals are a self-loop that never spend budget. `Open` only
//! returns to `Fresh` on success, an explicit reset, or when the text is seen
//! under a different page fingerprint than the one it failed under.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::model::now_unix;

/// Default retry budget per text.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    Fresh,
    Failing(u32),
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Fresh => write!(f, "Fresh"),
            CircuitState::Failing(n) => write!(f, "Failing({n})"),
            CircuitState::Open => write!(f, "Open"),
        }
    }
}

/// How a provider failure counts against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// Provider-wide throttling; transient, never counted.
    RateLimited,
    /// Anything text-specific or systemic: bad request, provider or network error.
    Hard,
}

impl CircuitState {
    fn from_count(failure_count: u32, max_retries: u32) -> Self {
        match failure_count {
            0 => CircuitState::Fresh,
            n if n >= max_retries => CircuitState::Open,
            n => CircuitState::Failing(n),
        }
    }

    /// Next state after a failure of the given kind.
    pub fn on_failure(self, kind: FailureKind, max_retries: u32) -> CircuitState {
        match (self, kind) {
            (state, FailureKind::RateLimited) => state,
            (CircuitState::Open, FailureKind::Hard) => CircuitState::Open,
            (CircuitState::Fresh, FailureKind::Hard) => Self::from_count(1, max_retries),
            (CircuitState::Failing(n), FailureKind::Hard) => Self::from_count(n + 1, max_retries),
        }
    }

    pub fn allows_attempt(self) -> bool {
        !matches!(self, CircuitState::Open)
    }
}

/// Failure bookkeeping for one `(text_hash, target_lang)`.
#[derive(Debug, Clone, Serialize)]
pub struct RetryState {
    pub text_hash: String,
    pub target_lang: String,
    pub failure_count: u32,
    /// Unix seconds of the last counted failure.
    pub last_failure_at: Option<i64>,
    /// Unix seconds of the last rate-limit signal (not counted).
    pub last_rate_limited_at: Option<i64>,
    /// Page fingerprint the failures were recorded under.
    pub fingerprint: String,
}

impl RetryState {
    fn new(text_hash: &str, target_lang: &str, fingerprint: &str) -> Self {
        Self {
            text_hash: text_hash.to_string(),
            target_lang: target_lang.to_string(),
            failure_count: 0,
            last_failure_at: None,
            last_rate_limited_at: None,
            fingerprint: fingerprint.to_string(),
        }
    }
}

type RetryKey = (String, String);

/// Thread-safe tracker shared by all page passes.
pub struct CircuitTracker {
    states: RwLock<HashMap<RetryKey, RetryState>>,
    max_retries: u32,
}

impl CircuitTracker {
    /// `max_retries` below one is raised to one.
    pub fn new(max_retries: u32) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn key(text_hash: &str, target_lang: &str) -> RetryKey {
        (text_hash.to_string(), target_lang.to_string())
    }

    /// Current state as seen under `fingerprint`. Failures recorded under a
    /// different fingerprint do not count.
    pub fn state(&self, text_hash: &str, target_lang: &str, fingerprint: &str) -> CircuitState {
        let states = self.states.read();
        match states.get(&Self::key(text_hash, target_lang)) {
            Some(s) if s.fingerprint == fingerprint => {
                CircuitState::from_count(s.failure_count, self.max_retries)
            }
            _ => CircuitState::Fresh,
        }
    }

    /// False iff the text's circuit is open under `fingerprint`.
    pub fn should_attempt(&self, text_hash: &str, target_lang: &str, fingerprint: &str) -> bool {
        self.state(text_hash, target_lang, fingerprint).allows_attempt()
    }

    /// Record a failure and return the resulting state.
    pub fn record_failure(
        &self,
        text_hash: &str,
        target_lang: &str,
        fingerprint: &str,
        kind: FailureKind,
    ) -> CircuitState {
        let mut states = self.states.write();
        let entry = states
            .entry(Self::key(text_hash, target_lang))
            .or_insert_with(|| RetryState::new(text_hash, target_lang, fingerprint));

        // Content changed since these failures: start over
        if entry.fingerprint != fingerprint {
            debug!(text_hash, target_lang, "fingerprint changed, retry state reset");
            *entry = RetryState::new(text_hash, target_lang, fingerprint);
        }

        let prev = CircuitState::from_count(entry.failure_count, self.max_retries);
        let next = prev.on_failure(kind, self.max_retries);
        let now = now_unix();

        match kind {
            FailureKind::RateLimited => {
                entry.last_rate_limited_at = Some(now);
                debug!(text_hash, target_lang, state = %next, "rate limit recorded, budget untouched");
            }
            FailureKind::Hard => {
                if prev != CircuitState::Open {
                    entry.failure_count += 1;
                }
                entry.last_failure_at = Some(now);
                if next == CircuitState::Open && prev != CircuitState::Open {
                    warn!(
                        text_hash,
                        target_lang,
                        failures = entry.failure_count,
                        "circuit opened, text will not be sent again under this fingerprint"
                    );
                } else {
                    debug!(text_hash, target_lang, from = %prev, to = %next, "circuit transition");
                }
            }
        }
        next
    }

    /// Clear all failure state for the text.
    pub fn record_success(&self, text_hash: &str, target_lang: &str) {
        if self.states.write().remove(&Self::key(text_hash, target_lang)).is_some() {
            debug!(text_hash, target_lang, "retry state cleared");
        }
    }

    /// External reset, e.g. after an operator fixed a provider issue.
    pub fn reset_all(&self) {
        let mut states = self.states.write();
        let n = states.len();
        states.clear();
        info!(cleared = n, "circuit tracker reset");
    }

    /// Snapshot of a text's bookkeeping, if any.
    pub fn retry_state(&self, text_hash: &str, target_lang: &str) -> Option<RetryState> {
        self.states.read().get(&Self::key(text_hash, target_lang)).cloned()
    }

    /// Number of circuits currently open under their recorded fingerprint.
    pub fn open_count(&self) -> usize {
        self.states
            .read()
            .values()
            .filter(|s| s.failure_count >= self.max_retries)
            .count()
    }
}

impl Default for CircuitTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
