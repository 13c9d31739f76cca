//! In-memory key-value store with per-entry TTL.
//!
//! Backed by [`moka::sync::Cache`].  Each entry carries its own expiry, and
//! the entry count is bounded by evicting the least recently used keys.  A
//! `null` value deletes the key.

use std::time::{Duration, Instant};

use hookbridge_protocol::schema::MAX_KV_TTL_SECS;
use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    ttl: Option<Duration>,
}

/// Expiry policy reading the TTL stored with each entry.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }

    /// An overwrite restarts the clock with the new entry's TTL.
    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// Shared key-value namespace.
pub struct KvStore {
    cache: Cache<String, Entry>,
    max_entries: u64,
}

impl KvStore {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = u64::try_from(max_entries).unwrap_or(u64::MAX);
        let cache = Cache::builder()
            .name("hookbridge-kv")
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryTtl)
            .build();
        debug!(max_entries, "kv store created");
        Self { cache, max_entries }
    }

    /// Current value of `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|e| e.value)
    }

    /// Store `value` under `key`; `ttl_secs == 0` means no expiry.
    ///
    /// TTLs beyond the protocol maximum are clamped to it.  When the store is
    /// at capacity the least recently used key makes room.
    pub fn set(&self, key: &str, value: Value, ttl_secs: u64) {
        if value.is_null() {
            self.cache.invalidate(key);
            return;
        }
        let entry = Entry {
            value,
            ttl: ttl_duration(ttl_secs),
        };
        self.cache.insert(key.to_owned(), entry);
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Apply pending expirations and evictions now.
    pub fn sweep(&self) {
        self.cache.run_pending_tasks();
    }

    /// Live entries, after pending maintenance has run.
    pub fn len(&self) -> usize {
        self.sweep();
        usize::try_from(self.cache.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }
}

fn ttl_duration(ttl_secs: u64) -> Option<Duration> {
    let cap = u64::try_from(MAX_KV_TTL_SECS).unwrap_or(u64::MAX);
    (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs.min(cap)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = KvStore::new(10);
        assert_eq!(kv.get("a"), None);
        kv.set("a", json!({"n": 1}), 0);
        assert_eq!(kv.get("a"), Some(json!({"n": 1})));
        kv.set("a", Value::Null, 0);
        assert_eq!(kv.get("a"), None);
        assert!(kv.is_empty());
    }

    #[test]
    fn expired_entries_disappear() {
        let kv = KvStore::new(10);
        kv.set("short", json!(1), 1);
        kv.set("forever", json!(2), 0);
        assert_eq!(kv.get("short"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(kv.get("short"), None);
        assert_eq!(kv.get("forever"), Some(json!(2)));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn overwrite_replaces_ttl() {
        let kv = KvStore::new(10);
        kv.set("k", json!("old"), 1);
        kv.set("k", json!("new"), 0);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(kv.get("k"), Some(json!("new")));
    }

    #[test]
    fn oversized_ttl_is_clamped_not_fatal() {
        let kv = KvStore::new(10);
        kv.set("k", json!("v"), u64::MAX);
        assert_eq!(kv.get("k"), Some(json!("v")));
        assert_eq!(
            ttl_duration(u64::MAX),
            Some(Duration::from_secs(MAX_KV_TTL_SECS as u64))
        );
        assert_eq!(ttl_duration(0), None);
    }

    #[test]
    fn capacity_is_bounded_by_eviction() {
        let kv = KvStore::new(2);
        kv.set("a", json!(1), 0);
        kv.set("b", json!(2), 0);
        kv.sweep();
        kv.set("c", json!(3), 0);
        assert_eq!(kv.get("c"), Some(json!(3)));
        assert!(kv.len() <= 2);
        assert_eq!(kv.max_entries(), 2);
    }
}
