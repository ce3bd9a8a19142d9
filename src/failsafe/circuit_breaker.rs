//! Circuit breaker implementation
//!
//! State is kept per [`CallKey`] in the shared [`Store`]. There is no
//! background timer: the Open → Half-Open transition is evaluated lazily by
//! [`CircuitBreaker::can_proceed`], and each evaluation is a single atomic
//! store update.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::key::CallKey;
use crate::store::{Store, get_document, update_document};

const NAMESPACE: &str = "circuit";

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    #[default]
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Persisted per-key circuit record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    /// Millis since epoch, set on entering Open
    opened_at: Option<u64>,
    half_open_probe_count: u32,
}

impl CircuitRecord {
    fn open_elapsed(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.opened_at.unwrap_or(now)))
    }

    /// Decision without side effects
    fn would_admit(&self, config: &CircuitBreakerConfig, now: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_elapsed(now) >= config.open_timeout,
            CircuitState::HalfOpen => self.half_open_probe_count < config.half_open_max_probe_calls,
        }
    }
}

/// Snapshot of a key's circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    /// Key the snapshot describes
    pub key: CallKey,
    /// Current state
    pub state: CircuitState,
    /// Failures counted so far
    pub failure_count: u32,
    /// When the circuit last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    /// Probes granted in the current half-open period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_probe_count: Option<u32>,
    /// Remaining time until an open circuit admits a probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<Duration>,
    /// Whether a call would be admitted now
    pub can_proceed: bool,
}

/// Per-key circuit breaker over a shared store
pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    /// How long an untouched record is kept
    state_ttl: Duration,
}

impl CircuitBreaker {
    /// Create a circuit breaker
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, state_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            state_ttl,
        }
    }

    fn with_record<R>(
        &self,
        key: &CallKey,
        f: impl FnOnce(&mut CircuitRecord, u64) -> R,
    ) -> Result<R> {
        update_document(
            self.store.as_ref(),
            &key.storage_key(NAMESPACE),
            self.state_ttl,
            |current: Option<CircuitRecord>| {
                let now = self.clock.now_millis();
                let mut record = current.unwrap_or_default();
                let out = f(&mut record, now);
                (Some(record), out)
            },
        )
    }

    fn load(&self, key: &CallKey) -> Result<CircuitRecord> {
        Ok(get_document(self.store.as_ref(), &key.storage_key(NAMESPACE))?.unwrap_or_default())
    }

    /// Check if a call may proceed.
    ///
    /// Moves an Open circuit whose timeout has elapsed to Half-Open and
    /// counts every probe granted while Half-Open.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub fn can_proceed(&self, key: &CallKey, config: &CircuitBreakerConfig) -> Result<bool> {
        if !config.enabled {
            return Ok(true);
        }

        self.with_record(key, |record, now| match record.state {
            CircuitState::Closed => {
                tracing::trace!("Circuit closed, allowing request");
                true
            }
            CircuitState::Open => {
                if record.open_elapsed(now) >= config.open_timeout {
                    record.state = CircuitState::HalfOpen;
                    record.half_open_probe_count = 1;
                    debug!(key = %key, "Open timeout elapsed, circuit half-open");
                    true
                } else {
                    tracing::debug!("Circuit open, rejecting request");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if record.half_open_probe_count < config.half_open_max_probe_calls {
                    record.half_open_probe_count += 1;
                    tracing::debug!(
                        probes = record.half_open_probe_count,
                        max = config.half_open_max_probe_calls,
                        "Circuit half-open, allowing probe request"
                    );
                    true
                } else {
                    tracing::debug!("Half-open probe budget spent, rejecting request");
                    false
                }
            }
        })
    }

    /// Record a successful call
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub fn record_success(&self, key: &CallKey) -> Result<()> {
        self.with_record(key, |record, _| match record.state {
            CircuitState::Closed => {
                record.failure_count = 0;
                tracing::trace!("Success in closed state, reset failure count");
            }
            CircuitState::HalfOpen => {
                *record = CircuitRecord::default();
                info!(key = %key, "Circuit breaker closed");
            }
            CircuitState::Open => {
                tracing::trace!("Success recorded in open state (ignored)");
            }
        })
    }

    /// Record a failed call.
    ///
    /// Once the failure count reaches the threshold the circuit opens,
    /// whatever state it was in. Failures while already open do not extend
    /// the open period.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub fn record_failure(&self, key: &CallKey, config: &CircuitBreakerConfig) -> Result<()> {
        if !config.enabled {
            return Ok(());
        }

        self.with_record(key, |record, now| {
            record.failure_count = record.failure_count.saturating_add(1);
            if record.failure_count < config.failure_threshold {
                tracing::debug!(
                    failures = record.failure_count,
                    threshold = config.failure_threshold,
                    state = %record.state,
                    "Failure recorded"
                );
                return;
            }
            if record.state != CircuitState::Open {
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                record.half_open_probe_count = 0;
                warn!(
                    key = %key,
                    failures = record.failure_count,
                    open_for_s = config.open_timeout.as_secs(),
                    "Circuit breaker opened"
                );
            }
        })
    }

    /// Current state of `key` without touching it
    pub fn state(&self, key: &CallKey) -> Result<CircuitState> {
        Ok(self.load(key)?.state)
    }

    /// Snapshot of `key`'s circuit. Does not perform any transition.
    pub fn stats(&self, key: &CallKey, config: &CircuitBreakerConfig) -> Result<CircuitStats> {
        let record = self.load(key)?;
        let now = self.clock.now_millis();
        let retry_in = (record.state == CircuitState::Open)
            .then(|| config.open_timeout.saturating_sub(record.open_elapsed(now)));

        Ok(CircuitStats {
            key: key.clone(),
            state: record.state,
            failure_count: record.failure_count,
            opened_at: record
                .opened_at
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(i64::try_from(ms).ok()?)),
            half_open_probe_count: (record.state == CircuitState::HalfOpen)
                .then_some(record.half_open_probe_count),
            retry_in,
            can_proceed: !config.enabled || record.would_admit(config, now),
        })
    }

    /// Human-readable status line for operators
    pub fn status_message(&self, key: &CallKey, config: &CircuitBreakerConfig) -> Result<String> {
        if !config.enabled {
            return Ok(format!("Platform '{key}' circuit breaker is closed (disabled)"));
        }
        let stats = self.stats(key, config)?;
        Ok(match stats.state {
            CircuitState::Closed => format!(
                "Platform '{key}' circuit breaker is closed ({} recent failures)",
                stats.failure_count
            ),
            CircuitState::Open => format!(
                "Platform '{key}' circuit breaker is open after {} failures, retry in {} seconds",
                stats.failure_count,
                stats.retry_in.unwrap_or_default().as_secs()
            ),
            CircuitState::HalfOpen => format!(
                "Platform '{key}' circuit breaker is half-open, testing recovery ({}/{} probes)",
                stats.half_open_probe_count.unwrap_or_default(),
                config.half_open_max_probe_calls
            ),
        })
    }

    /// Force `key` into `state` (operational control)
    pub fn force_state(&self, key: &CallKey, state: CircuitState) -> Result<()> {
        self.with_record(key, |record, now| {
            match state {
                CircuitState::Closed => *record = CircuitRecord::default(),
                CircuitState::Open => {
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.half_open_probe_count = 0;
                }
                CircuitState::HalfOpen => {
                    record.state = CircuitState::HalfOpen;
                    record.half_open_probe_count = 0;
                }
            }
            warn!(key = %key, state = %state, "Circuit state forced");
        })
    }

    /// Reset `key` to a fresh closed circuit
    pub fn reset(&self, key: &CallKey) -> Result<()> {
        self.store.delete(&key.storage_key(NAMESPACE))?;
        info!(key = %key, "Circuit breaker reset");
        Ok(())
    }
}
