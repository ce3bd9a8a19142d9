//! Sliding-window rate limiting
//!
//! Each [`CallKey`] owns one log document in the [`Store`]. The log keeps, per
//! configured window, the timestamps of admitted calls that are still inside
//! that window. A call is allowed only if every window (the burst window and
//! all named windows) has fewer live entries than its ceiling.
//!
//! Every operation prunes, checks and appends inside a single
//! [`Store::update`], so two concurrent callers can never both take the last
//! unit of budget.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{PlatformProfile, RateLimitProfile, RateWindow};
use crate::key::CallKey;
use crate::profiles::ProfileRegistry;
use crate::store::{Store, update_document};
use crate::{Error, Result};

const NAMESPACE: &str = "rate";

/// One admitted budget unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    /// Admission time, millis since epoch
    at: u64,
    /// Unique id so a reservation can be withdrawn
    id: u64,
}

/// Persisted per-key log: window name → entries in admission order
#[derive(Debug, Default, Serialize, Deserialize)]
struct WindowLog {
    windows: BTreeMap<String, VecDeque<Entry>>,
}

impl WindowLog {
    /// Drop expired entries and windows the profile no longer defines
    fn prune(&mut self, profile: &RateLimitProfile, now: u64) {
        self.windows
            .retain(|name, _| profile.all_windows().any(|(n, _)| n == name.as_str()));
        for (name, window) in profile.all_windows() {
            if let Some(entries) = self.windows.get_mut(name) {
                let span = window.window_millis();
                while let Some(front) = entries.front() {
                    if now.saturating_sub(front.at) >= span {
                        entries.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
        self.windows.retain(|_, entries| !entries.is_empty());
    }

    fn count(&self, name: &str) -> usize {
        self.windows.get(name).map_or(0, VecDeque::len)
    }

    fn allows(&self, profile: &RateLimitProfile) -> bool {
        profile
            .all_windows()
            .all(|(name, window)| self.count(name) < window.max_calls as usize)
    }

    fn append(&mut self, profile: &RateLimitProfile, entries: &[Entry]) {
        for (name, _) in profile.all_windows() {
            self.windows
                .entry(name.to_string())
                .or_default()
                .extend(entries.iter().copied());
        }
    }

    fn remove(&mut self, ids: &[u64]) {
        for entries in self.windows.values_mut() {
            entries.retain(|e| !ids.contains(&e.id));
        }
        self.windows.retain(|_, entries| !entries.is_empty());
    }

    /// Time until every window has room for one more call
    fn time_until_allowed(&self, profile: &RateLimitProfile, now: u64) -> Duration {
        let mut wait_ms = 0u64;
        for (name, window) in profile.all_windows() {
            let count = self.count(name);
            let max = window.max_calls as usize;
            if count < max {
                continue;
            }
            // The (count - max + 1)-th oldest entry must age out
            if let Some(entry) = self.windows.get(name).and_then(|e| e.get(count - max)) {
                let frees_at = entry.at.saturating_add(window.window_millis());
                wait_ms = wait_ms.max(frees_at.saturating_sub(now));
            }
        }
        Duration::from_millis(wait_ms)
    }
}

/// Budget reserved by [`RateLimiter::try_acquire`].
///
/// Dropping the permit keeps the reservation. Hand it to
/// [`RateLimiter::release`] to give the budget back.
#[derive(Debug)]
#[must_use = "dropping a permit keeps the reserved budget; release it if the call did not happen"]
pub struct Permit {
    key: CallKey,
    ids: Vec<u64>,
}

impl Permit {
    /// Key the budget was reserved for
    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Number of reserved budget units
    pub fn units(&self) -> usize {
        self.ids.len()
    }
}

/// Usage of one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    /// Window name (`burst` for the burst window)
    pub name: String,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Live entries
    pub count: usize,
    /// Ceiling
    pub limit: u32,
    /// When the oldest live entry leaves the window
    pub resets_at: Option<DateTime<Utc>>,
}

/// Snapshot of a key's rate budget
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    /// Key the snapshot describes
    pub key: CallKey,
    /// Whether rate limiting is enabled for the key
    pub enabled: bool,
    /// Per-window usage, burst first
    pub windows: Vec<WindowUsage>,
    /// Whether a call would be admitted now
    pub allowed: bool,
}

/// Budget units a call consuming `tokens` LLM tokens should record
#[must_use]
pub fn weight_for_tokens(tokens: u64) -> u32 {
    u32::try_from((tokens / 100).max(1)).unwrap_or(u32::MAX)
}

/// Sliding-window rate limiter over a shared store
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    profiles: Arc<ProfileRegistry>,
}

impl RateLimiter {
    /// Create a rate limiter
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, profiles: Arc<ProfileRegistry>) -> Self {
        Self {
            store,
            clock,
            profiles,
        }
    }

    /// Run `f` against the pruned log of `key` inside one atomic store update
    fn with_log<R>(
        &self,
        key: &CallKey,
        profile: &RateLimitProfile,
        f: impl FnOnce(&mut WindowLog, u64) -> R,
    ) -> Result<R> {
        let storage_key = key.storage_key(NAMESPACE);
        update_document(
            self.store.as_ref(),
            &storage_key,
            profile.longest_window(),
            |current: Option<WindowLog>| {
                let now = self.clock.now_millis();
                let mut log = current.unwrap_or_default();
                log.prune(profile, now);
                let out = f(&mut log, now);
                let keep = (!log.windows.is_empty()).then_some(log);
                (keep, out)
            },
        )
    }

    /// Whether a call for `key` may proceed now
    pub fn can_proceed(&self, key: &CallKey, profile: &RateLimitProfile) -> Result<bool> {
        if !profile.enabled {
            return Ok(true);
        }
        self.with_log(key, profile, |log, _| log.allows(profile))
    }

    /// Record an admitted call consuming `weight` budget units
    pub fn record_call(&self, key: &CallKey, profile: &RateLimitProfile, weight: u32) -> Result<()> {
        if !profile.enabled {
            return Ok(());
        }
        let weight = weight.max(1);
        self.with_log(key, profile, |log, now| {
            let entries = new_entries(now, weight);
            log.append(profile, &entries);
        })?;
        debug!(key = %key, weight, "Recorded call");
        Ok(())
    }

    /// Check and reserve `weight` units in one step.
    ///
    /// Returns `None` without recording anything when any window is full.
    pub fn try_acquire(
        &self,
        key: &CallKey,
        profile: &RateLimitProfile,
        weight: u32,
    ) -> Result<Option<Permit>> {
        if !profile.enabled {
            return Ok(Some(Permit {
                key: key.clone(),
                ids: Vec::new(),
            }));
        }
        let weight = weight.max(1);
        let ids = self.with_log(key, profile, |log, now| {
            if !log.allows(profile) {
                return None;
            }
            let entries = new_entries(now, weight);
            log.append(profile, &entries);
            Some(entries.iter().map(|e| e.id).collect::<Vec<_>>())
        })?;
        Ok(ids.map(|ids| Permit {
            key: key.clone(),
            ids,
        }))
    }

    /// Give back the budget reserved by `permit`
    pub fn release(&self, permit: Permit, profile: &RateLimitProfile) -> Result<()> {
        if permit.ids.is_empty() {
            return Ok(());
        }
        self.with_log(&permit.key, profile, |log, _| log.remove(&permit.ids))?;
        debug!(key = %permit.key, units = permit.ids.len(), "Released reserved budget");
        Ok(())
    }

    /// Fail fast with [`Error::RateLimited`] when a call may not proceed
    pub fn check_limit(&self, key: &CallKey, profile: &RateLimitProfile) -> Result<()> {
        let retry_after = self.time_until_allowed(key, profile)?;
        if retry_after.is_zero() {
            Ok(())
        } else {
            Err(Error::RateLimited {
                key: key.to_string(),
                retry_after,
            })
        }
    }

    /// How long until a call for `key` would be admitted (zero if now)
    pub fn time_until_allowed(&self, key: &CallKey, profile: &RateLimitProfile) -> Result<Duration> {
        if !profile.enabled {
            return Ok(Duration::ZERO);
        }
        self.with_log(key, profile, |log, now| log.time_until_allowed(profile, now))
    }

    /// Block until a call may proceed, polling every `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimitTimeout`] once `max_wait` has elapsed.
    pub async fn wait_until_allowed(
        &self,
        key: &CallKey,
        profile: &RateLimitProfile,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.poll(key, max_wait, poll_interval, || {
            self.can_proceed(key, profile).map(|ok| ok.then_some(()))
        })
        .await
    }

    /// Like [`Self::wait_until_allowed`], but reserves the budget atomically
    /// once it becomes available.
    pub async fn acquire(
        &self,
        key: &CallKey,
        profile: &RateLimitProfile,
        weight: u32,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<Permit> {
        self.poll(key, max_wait, poll_interval, || {
            self.try_acquire(key, profile, weight)
        })
        .await
    }

    async fn poll<T>(
        &self,
        key: &CallKey,
        max_wait: Duration,
        poll_interval: Duration,
        mut attempt: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut warned = false;

        loop {
            if let Some(admitted) = attempt()? {
                if warned {
                    debug!(
                        key = %key,
                        waited_ms = started.elapsed().as_millis(),
                        "Rate limit cleared"
                    );
                }
                return Ok(admitted);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(key = %key, max_wait_s = max_wait.as_secs(), "Rate limit wait timed out");
                return Err(Error::RateLimitTimeout {
                    key: key.to_string(),
                    waited: now.duration_since(started),
                });
            }
            if !warned {
                warn!(
                    key = %key,
                    poll_ms = poll_interval.as_millis(),
                    "Rate limit reached, waiting for capacity"
                );
                warned = true;
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Current usage of every window for `key`
    pub fn usage_stats(&self, key: &CallKey, profile: &RateLimitProfile) -> Result<UsageStats> {
        let (windows, allowed) = self.with_log(key, profile, |log, _| {
            let windows = profile
                .all_windows()
                .map(|(name, window)| window_usage(log, name, window))
                .collect::<Vec<_>>();
            (windows, log.allows(profile))
        })?;
        Ok(UsageStats {
            key: key.clone(),
            enabled: profile.enabled,
            windows,
            allowed: allowed || !profile.enabled,
        })
    }

    /// Clear all window state for `key`
    pub fn reset(&self, key: &CallKey) -> Result<()> {
        self.store.delete(&key.storage_key(NAMESPACE))
    }

    /// Replace the profile for `platform`; affects future checks only
    pub fn update_profile(&self, platform: &str, profile: PlatformProfile) -> Result<()> {
        self.profiles.update_profile(platform, profile)
    }

    /// Profiles this limiter resolves keys against
    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }
}

fn new_entries(now: u64, weight: u32) -> Vec<Entry> {
    (0..weight)
        .map(|_| Entry {
            at: now,
            id: rand::random(),
        })
        .collect()
}

fn window_usage(log: &WindowLog, name: &str, window: &RateWindow) -> WindowUsage {
    let resets_at = log
        .windows
        .get(name)
        .and_then(VecDeque::front)
        .and_then(|oldest| {
            let millis = oldest.at.saturating_add(window.window_millis());
            DateTime::<Utc>::from_timestamp_millis(i64::try_from(millis).ok()?)
        });
    WindowUsage {
        name: name.to_string(),
        window_seconds: window.window_seconds,
        count: log.count(name),
        limit: window.max_calls,
        resets_at,
    }
}
