//! Failsafe mechanisms: rate limiting, circuit breaking, retry
//!
//! [`Failsafe`] composes the three around every outbound call:
//!
//! 1. the circuit breaker for the call's key must admit the call,
//! 2. rate budget is reserved, waiting for capacity if needed,
//! 3. the transport runs; a failed attempt gives its budget back,
//! 4. transient failures are retried with exponential backoff.
//!
//! When every attempt has failed, the call counts as one circuit failure
//! (see [`Config::record_transport_failures`]).

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStats};
pub use rate_limiter::{Permit, RateLimiter, UsageStats, WindowUsage, weight_for_tokens};
pub use retry::{RetryAttempt, RetryOutcome, RetryPolicy, execute_with_retry, is_retryable};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{Config, PlatformProfile, WaitConfig};
use crate::key::CallKey;
use crate::profiles::ProfileRegistry;
use crate::store::{MemoryStore, Store};
use crate::transport::{HttpTransport, Transport, TransportRequest, TransportResponse};
use crate::{Error, Result};

/// A value together with the rate budget it consumed
#[derive(Debug, Clone, PartialEq)]
pub struct Weighted<T> {
    /// Operation result
    pub value: T,
    /// Budget units consumed (at least 1)
    pub weight: u32,
}

impl<T> Weighted<T> {
    /// `value` consuming `weight` units
    pub fn new(value: T, weight: u32) -> Self {
        Self {
            value,
            weight: weight.max(1),
        }
    }

    /// `value` consuming a single unit
    pub fn one(value: T) -> Self {
        Self::new(value, 1)
    }
}

/// One call to an external platform
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// Platform name (selects the profile)
    pub platform: String,
    /// Logical endpoint (shards state, selects endpoint overrides)
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// JSON body
    pub payload: Option<Value>,
    /// Extra headers; win over profile headers
    pub headers: HashMap<String, String>,
    /// Per-user sharding
    pub user_id: Option<String>,
    /// Budget units the call consumes
    pub weight: u32,
}

impl CallRequest {
    /// Create a call without body, headers or user
    pub fn new(
        platform: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            url: url.into(),
            payload: None,
            headers: HashMap::new(),
            user_id: None,
            weight: 1,
        }
    }

    /// Set the JSON body
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Track state per user
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Budget units the call consumes
    #[must_use]
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Key the call's state is tracked under
    pub fn key(&self) -> CallKey {
        let key = CallKey::new(&self.platform, &self.endpoint);
        match &self.user_id {
            Some(user) => key.with_user(user),
            None => key,
        }
    }
}

/// Rate and circuit snapshot of one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    /// Rate budget usage
    pub rate: UsageStats,
    /// Circuit state
    pub circuit: CircuitStats,
}

/// Per-call bookkeeping shared by its attempts
#[derive(Default)]
struct Progress {
    /// The circuit breaker admitted this call
    admitted: AtomicBool,
    /// At least one attempt ran the operation
    reached_transport: AtomicBool,
}

/// Resilient call orchestrator
pub struct Failsafe {
    profiles: Arc<ProfileRegistry>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    transport: Arc<dyn Transport>,
    wait: WaitConfig,
    record_transport_failures: bool,
}

impl Failsafe {
    /// Create a failsafe over explicit collaborators
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` holds an invalid profile.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let profiles = Arc::new(ProfileRegistry::from_config(config)?);
        Ok(Self {
            rate_limiter: RateLimiter::new(store.clone(), clock.clone(), profiles.clone()),
            circuit_breaker: CircuitBreaker::new(store, clock, config.state_ttl),
            profiles,
            transport,
            wait: config.wait,
            record_transport_failures: config.record_transport_failures,
        })
    }

    /// In-process store, monotonic clock and HTTP transport
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let transport = Arc::new(HttpTransport::new(config.request_timeout)?);
        Self::new(config, store, clock, transport)
    }

    /// Perform one resilient call through the transport
    pub async fn call(&self, request: CallRequest) -> Result<TransportResponse> {
        let key = request.key();
        let profile = self.profiles.resolve(&key);

        let mut headers = profile.headers.clone();
        headers.extend(request.headers);
        let outbound = TransportRequest {
            method: request.method,
            url: request.url,
            headers,
            payload: request.payload,
        };
        let operation = format!("{} {}", outbound.method, key.endpoint);
        let weight = request.weight;

        self.execute(&key, &operation, || async {
            self.transport
                .send(&outbound)
                .await
                .map(|response| Weighted::new(response, weight))
        })
        .await
    }

    /// Run an arbitrary operation under the key's rate limit, circuit
    /// breaker and retry policy.
    ///
    /// `f` is invoked once per attempt. Each attempt reserves one budget
    /// unit up front; a successful result's extra weight is recorded after
    /// the fact. Once the circuit admits a call, its retries run without
    /// taking further half-open admissions and are refused only if the circuit
    /// has opened in the meantime.
    pub async fn execute<F, Fut, T>(&self, key: &CallKey, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Weighted<T>>>,
    {
        let profile = self.profiles.resolve(key);
        let policy = RetryPolicy::new(&profile.retry);
        let progress = Progress::default();

        let outcome = policy
            .run(&key.platform, operation, || {
                let call = f();
                self.attempt(key, &profile, &progress, call)
            })
            .await;

        if let Err(e) = &outcome.result {
            if self.record_transport_failures && progress.reached_transport.load(Ordering::Acquire) {
                if let Err(store_err) = self
                    .circuit_breaker
                    .record_failure(key, &profile.circuit_breaker)
                {
                    warn!(key = %key, error = %store_err, "Failed to record circuit failure");
                }
            }
            warn!(
                key = %key,
                operation,
                attempts = outcome.attempt_count(),
                error = %e,
                "Outbound call failed"
            );
        }
        outcome.result
    }

    async fn attempt<T>(
        &self,
        key: &CallKey,
        profile: &PlatformProfile,
        progress: &Progress,
        call: impl Future<Output = Result<Weighted<T>>>,
    ) -> Result<T> {
        let breaker = &profile.circuit_breaker;
        let admitted = if progress.admitted.load(Ordering::Acquire) {
            !breaker.enabled || self.circuit_breaker.state(key)? != CircuitState::Open
        } else {
            self.circuit_breaker.can_proceed(key, breaker)?
        };
        if !admitted {
            return Err(Error::CircuitOpen {
                key: key.to_string(),
            });
        }
        progress.admitted.store(true, Ordering::Release);

        let limits = &profile.rate_limits;
        let permit = match self.rate_limiter.try_acquire(key, limits, 1)? {
            Some(permit) => permit,
            None => {
                self.rate_limiter
                    .acquire(key, limits, 1, self.wait.max_wait, self.wait.poll_interval)
                    .await?
            }
        };

        let result = call.await;
        progress.reached_transport.store(true, Ordering::Release);
        match result {
            Ok(Weighted { value, weight }) => {
                self.circuit_breaker.record_success(key)?;
                if weight > 1 {
                    self.rate_limiter.record_call(key, limits, weight - 1)?;
                }
                drop(permit);
                Ok(value)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Attempt failed, releasing budget");
                self.rate_limiter.release(permit, limits)?;
                Err(e)
            }
        }
    }

    /// Effective profile of `platform`
    pub fn profile(&self, platform: &str) -> Arc<PlatformProfile> {
        self.profiles.get(platform)
    }

    /// Replace the profile of `platform` for future calls
    pub fn update_profile(&self, platform: &str, profile: PlatformProfile) -> Result<()> {
        self.profiles.update_profile(platform, profile)
    }

    /// Registered platforms
    pub fn platforms(&self) -> Vec<String> {
        self.profiles.platforms()
    }

    /// Rate and circuit snapshot of `key`
    pub fn stats(&self, key: &CallKey) -> Result<CallStats> {
        let profile = self.profiles.resolve(key);
        Ok(CallStats {
            rate: self.rate_limiter.usage_stats(key, &profile.rate_limits)?,
            circuit: self.circuit_breaker.stats(key, &profile.circuit_breaker)?,
        })
    }

    /// Operator-facing circuit summary of `key`
    pub fn status_message(&self, key: &CallKey) -> Result<String> {
        let profile = self.profiles.resolve(key);
        self.circuit_breaker
            .status_message(key, &profile.circuit_breaker)
    }

    /// Clear rate and circuit state of `key`
    pub fn reset(&self, key: &CallKey) -> Result<()> {
        self.rate_limiter.reset(key)?;
        self.circuit_breaker.reset(key)
    }

    /// Force the circuit of `key` into `state`
    pub fn force_circuit_state(&self, key: &CallKey, state: CircuitState) -> Result<()> {
        self.circuit_breaker.force_state(key, state)
    }

    /// Underlying rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Underlying circuit breaker
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn failsafe() -> Failsafe {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap());
        Failsafe::new(&Config::default(), store, clock, transport).unwrap()
    }

    #[test]
    fn test_call_request_key() {
        let request = CallRequest::new("linkedin", "share", "POST", "https://api.linkedin.com")
            .user("42")
            .weight(0);
        assert_eq!(request.key(), CallKey::new("linkedin", "share").with_user("42"));
        assert_eq!(request.weight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_success_records_full_weight() {
        let fs = failsafe();
        let key = CallKey::new("openai", "chat");

        let value = fs
            .execute(&key, "chat", || async { Ok(Weighted::new("reply", 7)) })
            .await
            .unwrap();

        assert_eq!(value, "reply");
        let stats = fs.stats(&key).unwrap();
        assert!(stats.rate.windows.iter().all(|w| w.count == 7));
        assert_eq!(stats.circuit.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_release_budget() {
        let fs = failsafe();
        let key = CallKey::new("openai", "chat");
        let calls = AtomicU32::new(0);

        let result = fs
            .execute(&key, "chat", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Weighted<()>, _>(Error::transport_status(503, "Service Unavailable"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let stats = fs.stats(&key).unwrap();
        assert!(stats.rate.windows.iter().all(|w| w.count == 0));
        assert_eq!(stats.circuit.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusal_is_not_counted_as_failure() {
        let fs = failsafe();
        let key = CallKey::new("twitter", "post");
        fs.force_circuit_state(&key, CircuitState::Open).unwrap();

        let err = fs
            .execute(&key, "post", || async { Ok(Weighted::one(())) })
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(fs.stats(&key).unwrap().circuit.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_both() {
        let fs = failsafe();
        let key = CallKey::new("tiktok", "upload");
        fs.execute(&key, "upload", || async { Ok(Weighted::one(())) })
            .await
            .unwrap();
        fs.force_circuit_state(&key, CircuitState::Open).unwrap();

        fs.reset(&key).unwrap();
        let stats = fs.stats(&key).unwrap();
        assert_eq!(stats.circuit.state, CircuitState::Closed);
        assert!(stats.rate.windows.iter().all(|w| w.count == 0));
    }

    /// Store whose circuit writes can be switched off
    struct FlakyCircuitStore {
        inner: MemoryStore,
        fail_circuit: AtomicBool,
    }

    impl Store for FlakyCircuitStore {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
            self.inner.put(key, value, ttl)
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn update(
            &self,
            key: &str,
            ttl: Duration,
            f: &mut dyn FnMut(Option<Value>) -> Option<Value>,
        ) -> Result<Option<Value>> {
            if key.starts_with("circuit:") && self.fail_circuit.load(Ordering::SeqCst) {
                return Err(Error::Store("circuit backend unavailable".to_string()));
            }
            self.inner.update(key, ttl, f)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_store_failure_keeps_call_error() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(FlakyCircuitStore {
            inner: MemoryStore::new(clock.clone()),
            fail_circuit: AtomicBool::new(false),
        });
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap());
        let fs = Failsafe::new(&Config::default(), store.clone(), clock, transport).unwrap();
        let key = CallKey::new("facebook", "feed");

        let err = fs
            .execute(&key, "feed", || async {
                store.fail_circuit.store(true, Ordering::SeqCst);
                Err::<Weighted<()>, _>(Error::transport_status(400, "Invalid parameter"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(400));
    }
}
