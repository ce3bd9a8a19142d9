//! Resilient call integration tests - circuit, rate limit and retry composed

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use outbound_guard::clock::ManualClock;
use outbound_guard::config::{
    CircuitBreakerConfig, Config, PlatformProfile, RateLimitProfile, RateWindow, RetryConfig,
};
use outbound_guard::store::MemoryStore;
use outbound_guard::transport::{Transport, TransportRequest, TransportResponse};
use outbound_guard::{CallKey, CallRequest, CircuitState, Error, Failsafe, Result, Weighted};

/// Transport that replays scripted answers and counts calls
#[derive(Default)]
struct ScriptedTransport {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<TransportResponse>>>,
    seen: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn failing() -> Self {
        Self::default()
    }

    fn push_ok(&self, body: &str) {
        self.script.lock().push_back(Ok(TransportResponse {
            status: 200,
            headers: HashMap::new(),
            body: body.to_string(),
        }));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::transport_status(503, "Service Unavailable")))
    }
}

fn scenario_profile() -> PlatformProfile {
    PlatformProfile {
        rate_limits: RateLimitProfile {
            enabled: true,
            burst: RateWindow::new(60, 2),
            windows: BTreeMap::from([("per_minute".to_string(), RateWindow::new(60, 10))]),
        },
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
            half_open_max_probe_calls: 1,
        },
        retry: RetryConfig {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..PlatformProfile::default()
    }
}

fn failsafe(
    profile: PlatformProfile,
    transport: Arc<ScriptedTransport>,
) -> (Arc<ManualClock>, Failsafe) {
    let mut config = Config::default();
    config.platforms.insert("acme".to_string(), profile);
    config.wait.max_wait = Duration::from_secs(10);
    config.wait.poll_interval = Duration::from_secs(1);

    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let fs = Failsafe::new(&config, store, clock.clone(), transport).unwrap();
    (clock, fs)
}

fn request() -> CallRequest {
    CallRequest::new("acme", "publish", "POST", "https://api.acme.test/publish")
}

#[tokio::test(start_paused = true)]
async fn test_failing_platform_opens_circuit_after_three_invocations() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    for invocation in 1..=3 {
        let err = fs.call(request()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(transport.calls(), invocation * 3);
    }

    let key = request().key();
    assert_eq!(fs.stats(&key).unwrap().circuit.state, CircuitState::Open);

    let err = fs.call(request()).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(transport.calls(), 9, "no transport call once open");
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempts_do_not_consume_burst_budget() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    // Nine failed attempts against a burst ceiling of 2 never wait on the limiter
    for _ in 0..3 {
        let _ = fs.call(request()).await;
    }
    let stats = fs.stats(&request().key()).unwrap();
    assert!(stats.rate.windows.iter().all(|w| w.count == 0));
}

#[tokio::test(start_paused = true)]
async fn test_success_consumes_budget_and_burst_forces_wait() {
    let transport = Arc::new(ScriptedTransport::failing());
    for _ in 0..3 {
        transport.push_ok("{\"id\":1}");
    }
    let (clock, fs) = failsafe(scenario_profile(), transport.clone());

    fs.call(request()).await.unwrap();
    let response = fs.call(request()).await.unwrap();
    assert_eq!(response.json::<serde_json::Value>().unwrap()["id"], 1);

    let key = request().key();
    let burst = &fs.stats(&key).unwrap().rate.windows[0];
    assert_eq!((burst.name.as_str(), burst.count), ("burst", 2));

    // Third call waits for the burst window; the manual clock never moves,
    // so the wait runs into the hard budget
    let err = fs.call(request()).await.unwrap_err();
    assert!(err.is_rate_limit_timeout());
    assert_eq!(transport.calls(), 2);

    clock.advance(Duration::from_secs(60));
    fs.call(request()).await.unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_timeout_is_not_retried_or_counted() {
    let transport = Arc::new(ScriptedTransport::failing());
    let mut profile = scenario_profile();
    profile.rate_limits.burst = RateWindow::new(60, 1);
    transport.push_ok("ok");
    let (_, fs) = failsafe(profile, transport.clone());

    fs.call(request()).await.unwrap();
    let start = tokio::time::Instant::now();
    let err = fs.call(request()).await.unwrap_err();

    assert!(err.is_rate_limit_timeout());
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(fs.stats(&request().key()).unwrap().circuit.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_success_closes_circuit() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (clock, fs) = failsafe(scenario_profile(), transport.clone());
    let key = request().key();

    fs.force_circuit_state(&key, CircuitState::Open).unwrap();
    assert!(fs.call(request()).await.unwrap_err().is_circuit_open());

    clock.advance(Duration::from_secs(60));
    transport.push_ok("recovered");
    let response = fs.call(request()).await.unwrap();

    assert_eq!(response.body, "recovered");
    assert_eq!(fs.stats(&key).unwrap().circuit.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_half_open_call_reopens_circuit() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (clock, fs) = failsafe(scenario_profile(), transport.clone());
    let key = request().key();

    for _ in 0..3 {
        let _ = fs.call(request()).await;
    }
    assert_eq!(fs.stats(&key).unwrap().circuit.state, CircuitState::Open);

    // The admitted call keeps its retries and surfaces the remote error
    clock.advance(Duration::from_secs(60));
    let err = fs.call(request()).await.unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert_eq!(transport.calls(), 12);

    let circuit = fs.stats(&key).unwrap().circuit;
    assert_eq!(circuit.state, CircuitState::Open);
    assert_eq!(circuit.failure_count, 4);
    assert!(fs.call(request()).await.unwrap_err().is_circuit_open());

    clock.advance(Duration::from_secs(60));
    transport.push_ok("back");
    assert_eq!(fs.call(request()).await.unwrap().body, "back");
    assert_eq!(fs.stats(&key).unwrap().circuit.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_fails_fast() {
    let transport = Arc::new(ScriptedTransport::failing());
    transport
        .script
        .lock()
        .push_back(Err(Error::transport_status(400, "Invalid parameter")));
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    let err = fs.call(request()).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_profile_and_request_headers_are_merged() {
    let transport = Arc::new(ScriptedTransport::failing());
    transport.push_ok("ok");
    let mut profile = scenario_profile();
    profile
        .headers
        .insert("Authorization".to_string(), "Bearer profile".to_string());
    profile
        .headers
        .insert("X-Client".to_string(), "guard".to_string());
    let (_, fs) = failsafe(profile, transport.clone());

    fs.call(request().header("Authorization", "Bearer call"))
        .await
        .unwrap();

    let seen = transport.seen.lock();
    assert_eq!(seen[0].headers["Authorization"], "Bearer call");
    assert_eq!(seen[0].headers["X-Client"], "guard");
}

#[tokio::test(start_paused = true)]
async fn test_users_and_endpoints_are_isolated() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    let open = CallKey::new("acme", "publish").with_user("alice");
    fs.force_circuit_state(&open, CircuitState::Open).unwrap();

    transport.push_ok("bob ok");
    transport.push_ok("stats ok");
    fs.call(request().user("bob")).await.unwrap();
    fs.call(CallRequest::new("acme", "stats", "GET", "https://api.acme.test/stats").user("alice"))
        .await
        .unwrap();
    assert!(
        fs.call(request().user("alice"))
            .await
            .unwrap_err()
            .is_circuit_open()
    );
}

#[tokio::test(start_paused = true)]
async fn test_execute_records_token_weight() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (_, fs) = failsafe(scenario_profile(), transport);
    let key = CallKey::new("acme", "completions");

    let tokens = fs
        .execute(&key, "completions", || async {
            Ok(Weighted::new(1_234_u64, outbound_guard::failsafe::weight_for_tokens(1_234)))
        })
        .await
        .unwrap();

    assert_eq!(tokens, 1_234);
    let per_minute = fs
        .stats(&key)
        .unwrap()
        .rate
        .windows
        .into_iter()
        .find(|w| w.name == "per_minute")
        .unwrap();
    assert_eq!(per_minute.count, 12);
}

#[tokio::test(start_paused = true)]
async fn test_update_profile_applies_to_future_calls() {
    let transport = Arc::new(ScriptedTransport::failing());
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    let mut relaxed = scenario_profile();
    relaxed.retry.max_attempts = 1;
    fs.update_profile("acme", relaxed).unwrap();

    let _ = fs.call(request()).await;
    assert_eq!(transport.calls(), 1);
    assert_eq!(fs.profile("acme").retry.max_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_respect_burst_ceiling() {
    let transport = Arc::new(ScriptedTransport::failing());
    for _ in 0..5 {
        transport.push_ok("ok");
    }
    let (_, fs) = failsafe(scenario_profile(), transport.clone());

    let results = futures::future::join_all((0..5).map(|_| fs.call(request()))).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let timed_out = results
        .iter()
        .filter(|r| r.as_ref().is_err_and(Error::is_rate_limit_timeout))
        .count();
    assert_eq!((admitted, timed_out), (2, 3));
    assert_eq!(transport.calls(), 2);
}
