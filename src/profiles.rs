//! Platform profiles: built-in defaults and the runtime registry.
//!
//! Every platform the marketing backend talks to ships with a built-in
//! profile. Profiles from `config.yaml` replace the built-in entry for the
//! same platform, and platforms nobody configured fall back to
//! `default_profile`.
//!
//! Profiles are immutable once loaded. The registry hands out
//! `Arc<PlatformProfile>` snapshots; [`ProfileRegistry::update_profile`]
//! swaps in a new snapshot for future checks only, so state already stored
//! under the old profile is never reinterpreted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::Result;
use crate::config::{
    CircuitBreakerConfig, Config, PlatformProfile, RateLimitProfile, RateWindow, RetryConfig,
};
use crate::key::CallKey;

// ============================================================================
// Built-in profiles
// ============================================================================

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

struct Builtin {
    burst: RateWindow,
    windows: &'static [(&'static str, u64, u32)],
    failure_threshold: u32,
    open_timeout_secs: u64,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl Builtin {
    fn profile(&self) -> PlatformProfile {
        PlatformProfile {
            rate_limits: RateLimitProfile {
                enabled: true,
                burst: self.burst,
                windows: self
                    .windows
                    .iter()
                    .map(|(name, secs, max)| ((*name).to_string(), RateWindow::new(*secs, *max)))
                    .collect::<BTreeMap<_, _>>(),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                open_timeout: Duration::from_secs(self.open_timeout_secs),
                ..CircuitBreakerConfig::default()
            },
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                ..RetryConfig::default()
            },
            ..PlatformProfile::default()
        }
    }
}

const SOCIAL: Builtin = Builtin {
    burst: RateWindow::new(10, 5),
    windows: &[("per_hour", HOUR, 200)],
    failure_threshold: 5,
    open_timeout_secs: 60,
    max_attempts: 3,
    base_delay_ms: 1_000,
    max_delay_ms: 30_000,
};

fn builtin(platform: &str) -> Option<Builtin> {
    let spec = match platform {
        "twitter" => Builtin {
            burst: RateWindow::new(60, 5),
            windows: &[
                ("per_15_minutes", 15 * MINUTE, 50),
                ("per_3_hours", 3 * HOUR, 300),
                ("per_day", DAY, 2_400),
            ],
            open_timeout_secs: 120,
            ..SOCIAL
        },
        "facebook" | "instagram" | "facebook_ads" => SOCIAL,
        "linkedin" => Builtin {
            windows: &[("per_minute", MINUTE, 60), ("per_day", DAY, 500)],
            ..SOCIAL
        },
        "tiktok" => Builtin {
            windows: &[("per_minute", MINUTE, 100)],
            ..SOCIAL
        },
        "youtube" => Builtin {
            windows: &[("per_minute", MINUTE, 100), ("per_day", DAY, 10_000)],
            ..SOCIAL
        },
        "pinterest" => Builtin {
            windows: &[("per_hour", HOUR, 1_000)],
            ..SOCIAL
        },
        "google_ads" => Builtin {
            windows: &[("per_minute", MINUTE, 100), ("per_day", DAY, 15_000)],
            open_timeout_secs: 120,
            ..SOCIAL
        },
        "whatsapp" => Builtin {
            burst: RateWindow::new(1, 20),
            windows: &[("per_second", 1, 80), ("per_day", DAY, 100_000)],
            base_delay_ms: 500,
            ..SOCIAL
        },
        "telegram" => Builtin {
            burst: RateWindow::new(1, 30),
            windows: &[("per_minute", MINUTE, 1_200)],
            base_delay_ms: 500,
            ..SOCIAL
        },
        "openai" | "anthropic" | "gemini" => Builtin {
            burst: RateWindow::new(10, 20),
            windows: &[("per_minute", MINUTE, 500), ("per_day", DAY, 10_000)],
            failure_threshold: 3,
            open_timeout_secs: 30,
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        },
        _ => return None,
    };
    Some(spec)
}

/// Names of the platforms with a built-in profile
pub const BUILTIN_PLATFORMS: &[&str] = &[
    "anthropic",
    "facebook",
    "facebook_ads",
    "gemini",
    "google_ads",
    "instagram",
    "linkedin",
    "openai",
    "pinterest",
    "telegram",
    "tiktok",
    "twitter",
    "whatsapp",
    "youtube",
];

/// Built-in profile for `platform`, if one exists
#[must_use]
pub fn builtin_profile(platform: &str) -> Option<PlatformProfile> {
    builtin(platform).map(|b| b.profile())
}

// ============================================================================
// Registry
// ============================================================================

/// Thread-safe registry of platform profiles
#[derive(Debug)]
pub struct ProfileRegistry {
    default_profile: Arc<PlatformProfile>,
    profiles: RwLock<HashMap<String, Arc<PlatformProfile>>>,
}

impl ProfileRegistry {
    /// Registry holding only `default_profile`
    #[must_use]
    pub fn new(default_profile: PlatformProfile) -> Self {
        Self {
            default_profile: Arc::new(default_profile),
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with every built-in profile
    #[must_use]
    pub fn with_builtins(default_profile: PlatformProfile) -> Self {
        let profiles = BUILTIN_PLATFORMS
            .iter()
            .filter_map(|name| builtin_profile(name).map(|p| ((*name).to_string(), Arc::new(p))))
            .collect();
        Self {
            default_profile: Arc::new(default_profile),
            profiles: RwLock::new(profiles),
        }
    }

    /// Built-in profiles overlaid with the configured ones
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any configured profile is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let registry = Self::with_builtins(config.default_profile.clone());
        {
            let mut profiles = registry.profiles.write();
            for (platform, profile) in &config.platforms {
                profiles.insert(platform.clone(), Arc::new(profile.clone()));
            }
        }
        Ok(registry)
    }

    /// Profile for `platform`, falling back to the default profile
    #[must_use]
    pub fn get(&self, platform: &str) -> Arc<PlatformProfile> {
        self.profiles
            .read()
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.default_profile.clone())
    }

    /// Profile for a call, with the endpoint override applied
    #[must_use]
    pub fn resolve(&self, key: &CallKey) -> Arc<PlatformProfile> {
        let profile = self.get(&key.platform);
        match profile.for_endpoint(&key.endpoint) {
            Some(resolved) => Arc::new(resolved),
            None => profile,
        }
    }

    /// Whether `platform` has its own profile
    #[must_use]
    pub fn contains(&self, platform: &str) -> bool {
        self.profiles.read().contains_key(platform)
    }

    /// Registered platform names, sorted
    #[must_use]
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace the profile for `platform`. Affects future checks only.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `profile` is invalid; the previous
    /// profile stays in place.
    pub fn update_profile(&self, platform: &str, profile: PlatformProfile) -> Result<()> {
        profile.validate(platform)?;
        self.profiles
            .write()
            .insert(platform.to_string(), Arc::new(profile));
        info!(platform = platform, "Platform profile updated");
        Ok(())
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::with_builtins(PlatformProfile::default())
    }
}
