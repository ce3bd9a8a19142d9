//! TTL key-value store for shared call state
//!
//! Rate windows and circuit records live behind the [`Store`] trait so that a
//! deployment can point several processes at one shared backend. Every
//! read-modify-write goes through [`Store::update`], which implementations
//! must apply atomically per key.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::clock::Clock;
use crate::{Error, Result};

/// Key-value store with per-key TTL and atomic read-modify-write
pub trait Store: Send + Sync {
    /// Read a live value
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value that expires after `ttl`
    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Remove a value
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically replace the value stored under `key`.
    ///
    /// `f` receives the current live value (or `None`) and returns the new
    /// value, which is stored with a fresh `ttl`. Returning `None` deletes
    /// the key. No other writer may observe or modify `key` while `f` runs.
    fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>>;
}

/// Typed read-modify-write of a JSON document stored under `key`.
///
/// `f` receives the decoded document (`None` when absent, expired or
/// unreadable) and returns the document to store (`None` deletes it) together
/// with a result handed back to the caller. Runs inside one atomic
/// [`Store::update`].
pub fn update_document<T, R>(
    store: &dyn Store,
    key: &str,
    ttl: Duration,
    f: impl FnOnce(Option<T>) -> (Option<T>, R),
) -> Result<R>
where
    T: Serialize + DeserializeOwned,
{
    let mut f = Some(f);
    let mut out = None;
    let mut failure = None;

    store.update(key, ttl, &mut |current: Option<Value>| {
        let Some(f) = f.take() else {
            return current;
        };
        let decoded = current.clone().and_then(|value| {
            serde_json::from_value::<T>(value)
                .inspect_err(|e| warn!(key = key, error = %e, "Discarding unreadable state document"))
                .ok()
        });
        let (next, result) = f(decoded);
        out = Some(result);
        match next.map(serde_json::to_value).transpose() {
            Ok(next) => next,
            Err(e) => {
                failure = Some(Error::from(e));
                current
            }
        }
    })?;

    if let Some(e) = failure {
        return Err(e);
    }
    out.ok_or_else(|| Error::Store(format!("update of {key} did not run")))
}

/// Read and decode the JSON document stored under `key`
pub fn get_document<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    store
        .get(key)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(Error::from)
}

/// A stored value with its expiry
struct StoredValue {
    value: Value,
    expires_at: u64,
}

impl StoredValue {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// In-process store backed by a sharded concurrent map.
///
/// Per-key atomicity comes from holding the shard's entry lock for the whole
/// `update` closure.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using `clock` for expiry
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    /// Number of stored entries, including expired ones not yet evicted
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evict expired entries (background maintenance).
    ///
    /// Returns the number of evicted entries.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now_millis();
        if let Some(stored) = self.entries.get(key) {
            if stored.is_expired(now) {
                drop(stored);
                self.entries.remove_if(key, |_, s| s.is_expired(now));
                return Ok(None);
            }
            return Ok(Some(stored.value.clone()));
        }
        Ok(None)
    }

    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        ttl: Duration,
        f: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired(now) {
                    None
                } else {
                    Some(occupied.get().value.clone())
                };
                match f(current) {
                    Some(value) => {
                        occupied.insert(StoredValue {
                            value: value.clone(),
                            expires_at,
                        });
                        Ok(Some(value))
                    }
                    None => {
                        occupied.remove();
                        Ok(None)
                    }
                }
            }
            Entry::Vacant(vacant) => match f(None) {
                Some(value) => {
                    vacant.insert(StoredValue {
                        value: value.clone(),
                        expires_at,
                    });
                    Ok(Some(value))
                }
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn test_put_get() {
        let (_, store) = store();
        store
            .put("k", json!({"a": 1}), Duration::from_secs(60))
            .unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_get_missing() {
        let (_, store) = store();
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_expiry() {
        let (clock, store) = store();
        store.put("k", json!(1), Duration::from_millis(10)).unwrap();
        clock.advance(Duration::from_millis(10));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete() {
        let (_, store) = store();
        store.put("k", json!(1), Duration::from_secs(60)).unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_update_creates_and_modifies() {
        let (_, store) = store();
        let ttl = Duration::from_secs(60);
        let mut increment = |current: Option<Value>| {
            let n = current.and_then(|v| v.as_u64()).unwrap_or(0);
            Some(json!(n + 1))
        };
        store.update("counter", ttl, &mut increment).unwrap();
        let result = store.update("counter", ttl, &mut increment).unwrap();
        assert_eq!(result, Some(json!(2)));
    }

    #[test]
    fn test_update_sees_expired_as_missing() {
        let (clock, store) = store();
        store.put("k", json!(41), Duration::from_millis(5)).unwrap();
        clock.advance(Duration::from_millis(5));
        let mut seen = None;
        store
            .update("k", Duration::from_secs(1), &mut |current: Option<Value>| {
                seen = Some(current.is_some());
                Some(json!(0))
            })
            .unwrap();
        assert_eq!(seen, Some(false));
    }

    #[test]
    fn test_update_returning_none_deletes() {
        let (_, store) = store();
        store.put("k", json!(1), Duration::from_secs(60)).unwrap();
        store
            .update("k", Duration::from_secs(60), &mut |_| None)
            .unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_update_document_typed() {
        let (_, store) = store();
        let ttl = Duration::from_secs(60);
        let len = update_document(&store, "doc", ttl, |current: Option<Vec<u32>>| {
            let mut doc = current.unwrap_or_default();
            doc.push(7);
            let len = doc.len();
            (Some(doc), len)
        })
        .unwrap();
        assert_eq!(len, 1);
        let doc: Option<Vec<u32>> = get_document(&store, "doc").unwrap();
        assert_eq!(doc, Some(vec![7]));
    }

    #[test]
    fn test_update_document_discards_unreadable() {
        let (_, store) = store();
        store
            .put("doc", json!("not a list"), Duration::from_secs(60))
            .unwrap();
        let was_present = update_document(
            &store,
            "doc",
            Duration::from_secs(60),
            |current: Option<Vec<u32>>| (None, current.is_some()),
        )
        .unwrap();
        assert!(!was_present);
        assert_eq!(store.get("doc").unwrap(), None);
    }

    #[test]
    fn test_evict_expired() {
        let (clock, store) = store();
        store.put("short", json!(1), Duration::from_millis(1)).unwrap();
        store.put("long", json!(2), Duration::from_secs(60)).unwrap();
        clock.advance(Duration::from_millis(5));

        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update("n", Duration::from_secs(60), &mut |current: Option<Value>| {
                                let n = current.and_then(|v| v.as_u64()).unwrap_or(0);
                                Some(json!(n + 1))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("n").unwrap(), Some(json!(800)));
    }
}
