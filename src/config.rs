//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Rate-limit wait behaviour
    pub wait: WaitConfig,
    /// How long circuit records survive without being touched
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Per-request timeout of the HTTP transport
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Feed failed calls into the circuit breaker
    pub record_transport_failures: bool,
    /// Profile used for platforms without an explicit or built-in profile
    pub default_profile: PlatformProfile,
    /// Per-platform profiles, overriding the built-in ones
    pub platforms: HashMap<String, PlatformProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            wait: WaitConfig::default(),
            state_ttl: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(30),
            record_transport_failures: true,
            default_profile: PlatformProfile::default(),
            platforms: HashMap::new(),
        }
    }
}

/// Rate-limit wait configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Hard budget for waiting on rate-limit capacity
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// How often capacity is re-checked while waiting
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Per-platform tunables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformProfile {
    /// Rate windows
    pub rate_limits: RateLimitProfile,
    /// Circuit breaker parameters
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry parameters
    pub retry: RetryConfig,
    /// Default headers sent with every call (supports `${VAR}` expansion)
    pub headers: HashMap<String, String>,
    /// Per-endpoint overrides
    pub endpoints: HashMap<String, EndpointOverride>,
}

/// Per-endpoint replacement of individual profile sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverride {
    /// Replacement rate windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitProfile>,
    /// Replacement circuit breaker parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Replacement retry parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl PlatformProfile {
    /// Profile with the override for `endpoint` applied, if one exists
    #[must_use]
    pub fn for_endpoint(&self, endpoint: &str) -> Option<Self> {
        let over = self.endpoints.get(endpoint)?;
        Some(Self {
            rate_limits: over
                .rate_limits
                .clone()
                .unwrap_or_else(|| self.rate_limits.clone()),
            circuit_breaker: over
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| self.circuit_breaker.clone()),
            retry: over.retry.clone().unwrap_or_else(|| self.retry.clone()),
            headers: self.headers.clone(),
            endpoints: HashMap::new(),
        })
    }

    /// Check the profile's numeric bounds
    pub fn validate(&self, platform: &str) -> Result<()> {
        self.rate_limits.validate(platform)?;
        self.circuit_breaker.validate(platform)?;
        self.retry.validate(platform)?;
        for (endpoint, over) in &self.endpoints {
            let scope = format!("{platform}.{endpoint}");
            if let Some(rate_limits) = &over.rate_limits {
                rate_limits.validate(&scope)?;
            }
            if let Some(circuit_breaker) = &over.circuit_breaker {
                circuit_breaker.validate(&scope)?;
            }
            if let Some(retry) = &over.retry {
                retry.validate(&scope)?;
            }
        }
        Ok(())
    }
}

/// A sliding rate window: at most `max_calls` calls in any `window_seconds`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Window length in seconds
    pub window_seconds: u64,
    /// Calls admitted per window
    pub max_calls: u32,
}

impl RateWindow {
    /// Create a window
    #[must_use]
    pub const fn new(window_seconds: u64, max_calls: u32) -> Self {
        Self {
            window_seconds,
            max_calls,
        }
    }

    /// Window length in milliseconds
    #[must_use]
    pub const fn window_millis(&self) -> u64 {
        self.window_seconds.saturating_mul(1000)
    }

    fn validate(&self, scope: &str, name: &str) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(Error::Config(format!(
                "{scope}: rate window '{name}' must be at least 1 second"
            )));
        }
        if self.max_calls == 0 {
            return Err(Error::Config(format!(
                "{scope}: rate window '{name}' must admit at least 1 call"
            )));
        }
        Ok(())
    }
}

/// Name under which the burst window is reported
pub const BURST_WINDOW: &str = "burst";

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitProfile {
    /// Enable rate limiting
    pub enabled: bool,
    /// Short, low-ceiling window applied in addition to the named windows
    pub burst: RateWindow,
    /// Named sustained-rate windows (e.g. `per_minute`, `per_day`)
    pub windows: BTreeMap<String, RateWindow>,
}

impl Default for RateLimitProfile {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: RateWindow::new(10, 10),
            windows: BTreeMap::from([
                ("per_minute".to_string(), RateWindow::new(60, 60)),
                ("per_hour".to_string(), RateWindow::new(3600, 1000)),
            ]),
        }
    }
}

impl RateLimitProfile {
    /// Iterate over every window, burst first
    pub fn all_windows(&self) -> impl Iterator<Item = (&str, &RateWindow)> {
        std::iter::once((BURST_WINDOW, &self.burst))
            .chain(self.windows.iter().map(|(name, w)| (name.as_str(), w)))
    }

    /// Longest configured window
    #[must_use]
    pub fn longest_window(&self) -> Duration {
        let secs = self
            .all_windows()
            .map(|(_, w)| w.window_seconds)
            .max()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    fn validate(&self, scope: &str) -> Result<()> {
        for (name, window) in self.all_windows() {
            window.validate(scope, name)?;
        }
        if self.windows.contains_key(BURST_WINDOW) {
            return Err(Error::Config(format!(
                "{scope}: '{BURST_WINDOW}' is reserved for the burst window"
            )));
        }
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failure count that opens the circuit
    pub failure_threshold: u32,
    /// Time to wait before half-open
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Probe calls admitted while half-open
    pub half_open_max_probe_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_probe_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self, scope: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config(format!(
                "{scope}: circuit_breaker.failure_threshold must be at least 1"
            )));
        }
        if self.half_open_max_probe_calls == 0 {
            return Err(Error::Config(format!(
                "{scope}: circuit_breaker.half_open_max_probe_calls must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Perturb delays by up to ±10%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn validate(&self, scope: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(format!(
                "{scope}: retry.max_attempts must be at least 1"
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return Err(Error::Config(format!(
                "{scope}: retry.backoff_multiplier must be greater than 1"
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "{scope}: retry.base_delay must not exceed retry.max_delay"
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or contains an invalid profile.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // OUTBOUND_GUARD_WAIT__MAX_WAIT=10s style overrides
        figment = figment.merge(Env::prefixed("OUTBOUND_GUARD_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate the default profile and every configured platform
    pub fn validate(&self) -> Result<()> {
        self.default_profile.validate("default_profile")?;
        for (platform, profile) in &self.platforms {
            profile.validate(platform)?;
        }
        if self.wait.poll_interval.is_zero() {
            return Err(Error::Config(
                "wait.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in platform headers
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let profiles = self
            .platforms
            .values_mut()
            .chain(std::iter::once(&mut self.default_profile));
        for profile in profiles {
            for value in profile.headers.values_mut() {
                *value = expand_string(&re, value);
            }
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Human-readable serde module for Duration ("30s", "5m", "2h", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "2h" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m.saturating_mul(60)))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
