//! Typed cache engine.
//!
//! Every operation acquires the key's lock (unless the caller passes
//! `take_lock = false`, asserting the key is already serialized, as on the
//! replication apply path), executes atomically under it, and maintains the
//! hit/miss/expired statistics.
//!
//! Expired entries are reaped lazily: each operation re-checks the TTL
//! after taking the lock, and removal publishes the key-expiration event
//! exactly once per key generation.

use super::entry::{Entry, Value};
use super::lock::KeyedLocks;
use super::stats::CacheStats;
use crate::core::error::{StrataError, StrataResult};
use crate::protocol::TaggedValue;
use crate::pubsub::PubSub;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// One key's worth of state in a full-cache snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: Value,
    /// Remaining TTL in milliseconds, `0` meaning infinite.
    pub ttl_ms: u64,
}

/// Concurrent, typed, TTL-aware key-value store.
pub struct Cache {
    entries: DashMap<String, Entry>,
    locks: KeyedLocks,
    stats: CacheStats,
    pubsub: Arc<PubSub>,
}

impl Cache {
    pub fn new(pubsub: Arc<PubSub>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyedLocks::new(),
            stats: CacheStats::default(),
            pubsub,
        }
    }

    /// Number of present keys, counting expired-but-not-reaped entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Reap the entry if its TTL has elapsed.
    ///
    /// Must be called with the key lock held. Returns true if the key was
    /// removed; the removal publishes the expiration event and counts
    /// toward `expired_keys` exactly once per generation.
    fn reap_if_expired(&self, key: &str) -> bool {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired())
            .unwrap_or(false);
        if !expired {
            return false;
        }
        if self.entries.remove(key).is_some() {
            self.stats.key_expired();
            self.pubsub.publish_key_expiration(key);
        }
        true
    }

    // ------------------------------------------------------------------
    // Strings and bytes
    // ------------------------------------------------------------------

    pub async fn get_string(&self, key: &str, take_lock: bool) -> StrataResult<Option<String>> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::String(text) => {
                    self.stats.hit();
                    Ok(text.clone())
                }
                other => Err(StrataError::shape_mismatch("string", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    pub async fn set_string(
        &self,
        key: &str,
        value: Option<String>,
        ttl_ms: u64,
        take_lock: bool,
    ) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.entries
            .insert(key.to_string(), Entry::new(Value::String(value), ttl_ms));
        Ok(())
    }

    pub async fn get_bytes(&self, key: &str, take_lock: bool) -> StrataResult<Option<Vec<u8>>> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Bytes(bytes) => {
                    self.stats.hit();
                    Ok(bytes.clone())
                }
                other => Err(StrataError::shape_mismatch("bytes", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    pub async fn set_bytes(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        ttl_ms: u64,
        take_lock: bool,
    ) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Bytes(value), ttl_ms));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    pub async fn get_list(&self, key: &str, take_lock: bool) -> StrataResult<Vec<String>> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(items) => {
                    self.stats.hit();
                    Ok(items.clone())
                }
                other => Err(StrataError::shape_mismatch("list", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(Vec::new())
            }
        }
    }

    /// Append to a list, creating it with `ttl_ms` when missing.
    ///
    /// Appending to an existing list mutates in place and does not refresh
    /// the entry's TTL.
    pub async fn add_list(
        &self,
        key: &str,
        value: String,
        ttl_ms: u64,
        take_lock: bool,
    ) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            return match &mut entry.value {
                Value::List(items) => {
                    items.push(value);
                    Ok(())
                }
                other => Err(StrataError::shape_mismatch("list", other.shape())),
            };
        }
        self.entries
            .insert(key.to_string(), Entry::new(Value::List(vec![value]), ttl_ms));
        Ok(())
    }

    /// Remove the first occurrence of `value`; deletes the key when the
    /// list becomes empty. No-op on a missing key.
    pub async fn remove_list(&self, key: &str, value: &str, take_lock: bool) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        let now_empty = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::List(items) => {
                    if let Some(position) = items.iter().position(|item| item == value) {
                        items.remove(position);
                    }
                    items.is_empty()
                }
                other => return Err(StrataError::shape_mismatch("list", other.shape())),
            },
            None => return Ok(()),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(())
    }

    pub async fn contains_list(
        &self,
        key: &str,
        value: &str,
        take_lock: bool,
    ) -> StrataResult<bool> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(items) => {
                    self.stats.hit();
                    Ok(items.iter().any(|item| item == value))
                }
                other => Err(StrataError::shape_mismatch("list", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Replace the key with a counter. Counters always have infinite TTL.
    pub async fn set_counter(&self, key: &str, value: i64, take_lock: bool) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Counter(value), 0));
        Ok(())
    }

    /// Add `delta` to the counter, creating it at `delta` when missing.
    /// Returns the new value.
    pub async fn increment_counter(
        &self,
        key: &str,
        delta: i64,
        take_lock: bool,
    ) -> StrataResult<i64> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.bump_counter(key, delta)? {
            Some(updated) => {
                self.stats.hit();
                Ok(updated)
            }
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(Value::Counter(delta), 0));
                self.stats.miss();
                Ok(delta)
            }
        }
    }

    /// Replicated increment: lock bypassed, no hit/miss accounting.
    pub async fn apply_increment(&self, key: &str, delta: i64) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, false).await;
        self.reap_if_expired(key);
        if self.bump_counter(key, delta)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Counter(delta), 0));
        }
        Ok(())
    }

    fn bump_counter(&self, key: &str, delta: i64) -> StrataResult<Option<i64>> {
        match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Counter(current) => {
                    *current = current.wrapping_add(delta);
                    Ok(Some(*current))
                }
                other => Err(StrataError::shape_mismatch("counter", other.shape())),
            },
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Maps
    // ------------------------------------------------------------------

    pub async fn get_map_value(
        &self,
        key: &str,
        sub_key: &str,
        take_lock: bool,
    ) -> StrataResult<TaggedValue> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Map(entries) => {
                    self.stats.hit();
                    Ok(entries.get(sub_key).cloned().unwrap_or(TaggedValue::Null))
                }
                other => Err(StrataError::shape_mismatch("map", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(TaggedValue::Null)
            }
        }
    }

    /// Set one sub-key. Creates the map with infinite TTL when missing;
    /// sub-key mutation never touches the container's TTL.
    pub async fn set_map_value(
        &self,
        key: &str,
        sub_key: String,
        value: TaggedValue,
        take_lock: bool,
    ) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            return match &mut entry.value {
                Value::Map(entries) => {
                    entries.insert(sub_key, value);
                    Ok(())
                }
                other => Err(StrataError::shape_mismatch("map", other.shape())),
            };
        }
        let mut entries = HashMap::new();
        entries.insert(sub_key, value);
        self.entries
            .insert(key.to_string(), Entry::new(Value::Map(entries), 0));
        Ok(())
    }

    pub async fn get_map(
        &self,
        key: &str,
        take_lock: bool,
    ) -> StrataResult<HashMap<String, TaggedValue>> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.reap_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Map(entries) => {
                    self.stats.hit();
                    Ok(entries.clone())
                }
                other => Err(StrataError::shape_mismatch("map", other.shape())),
            },
            None => {
                self.stats.miss();
                Ok(HashMap::new())
            }
        }
    }

    pub async fn set_map(
        &self,
        key: &str,
        entries: HashMap<String, TaggedValue>,
        ttl_ms: u64,
        take_lock: bool,
    ) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        self.entries
            .insert(key.to_string(), Entry::new(Value::Map(entries), ttl_ms));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Presence check. Never counts toward hits/misses, but an expired
    /// entry discovered here is still reaped and emits its event.
    pub async fn exists(&self, key: &str, take_lock: bool) -> StrataResult<bool> {
        let _guard = self.locks.acquire(key, take_lock).await;
        if self.reap_if_expired(key) {
            return Ok(false);
        }
        Ok(self.entries.contains_key(key))
    }

    /// Remove the key. No-op when missing.
    pub async fn delete(&self, key: &str, take_lock: bool) -> StrataResult<()> {
        let _guard = self.locks.acquire(key, take_lock).await;
        if !self.reap_if_expired(key) {
            self.entries.remove(key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sweep and snapshot
    // ------------------------------------------------------------------

    /// One sweep cycle over a snapshot of current keys.
    ///
    /// Each key is re-checked under its own lock, so the sweeper never
    /// races a writer mid-update. Keys inserted after the snapshot are
    /// picked up on the next cycle. Returns the number of reaped keys.
    pub async fn sweep_expired(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            let _guard = self.locks.acquire(&key, true).await;
            if self.reap_if_expired(&key) {
                removed += 1;
            }
        }
        removed
    }

    /// Full state snapshot for follower resync.
    ///
    /// Already-expired entries are omitted; for live bounded entries the
    /// remaining TTL is clamped to at least 1 ms so `0` keeps meaning
    /// infinite on the wire.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| SnapshotEntry {
                key: entry.key().clone(),
                value: entry.value.clone(),
                ttl_ms: if entry.ttl_ms == 0 {
                    0
                } else {
                    entry.remaining_ttl_ms().max(1)
                },
            })
            .collect()
    }

    /// Replace the whole cache with a snapshot received from the leader.
    pub fn apply_snapshot(&self, snapshot: Vec<SnapshotEntry>) {
        self.entries.clear();
        for item in snapshot {
            self.entries
                .insert(item.key, Entry::new(item.value, item.ttl_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::KEY_EXPIRATION_CHANNEL;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn cache() -> Cache {
        Cache::new(Arc::new(PubSub::new()))
    }

    #[tokio::test]
    async fn test_string_round_trip() {
        let cache = cache();
        cache.set_string("key", Some("value".into()), 0, true).await.unwrap();
        assert_eq!(
            cache.get_string("key", true).await.unwrap(),
            Some("value".to_string())
        );
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_null_string_under_present_key() {
        let cache = cache();
        cache.set_string("key", None, 0, true).await.unwrap();
        assert!(cache.exists("key", true).await.unwrap());
        assert_eq!(cache.get_string("key", true).await.unwrap(), None);
        // Present key with a null value still counts as a hit.
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 0);
    }

    #[tokio::test]
    async fn test_shape_mismatch_leaves_value_intact() {
        let cache = cache();
        cache.set_string("key", Some("text".into()), 0, true).await.unwrap();

        assert!(cache.add_list("key", "item".into(), 0, true).await.is_err());
        assert!(cache.increment_counter("key", 1, true).await.is_err());
        assert!(cache.get_map("key", true).await.is_err());
        assert!(cache.get_bytes("key", true).await.is_err());

        assert_eq!(
            cache.get_string("key", true).await.unwrap(),
            Some("text".to_string())
        );
    }

    #[tokio::test]
    async fn test_set_counter_replaces_shape() {
        let cache = cache();
        cache.set_string("key", Some("text".into()), 5_000, true).await.unwrap();
        cache.set_counter("key", 9, true).await.unwrap();
        assert_eq!(cache.increment_counter("key", 0, true).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_lazy_expiry_emits_event_once() {
        let pubsub = Arc::new(PubSub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        pubsub.subscribe(KEY_EXPIRATION_CHANNEL, 1, tx);

        let cache = Cache::new(Arc::clone(&pubsub));
        cache.set_string("key", Some("v".into()), 30, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get_string("key", true).await.unwrap(), None);
        assert_eq!(cache.get_string("key", true).await.unwrap(), None);

        assert_eq!(cache.stats().expired_keys(), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_empty_on_remove_deletes_key() {
        let cache = cache();
        cache.add_list("key", "a".into(), 0, true).await.unwrap();
        cache.add_list("key", "b".into(), 0, true).await.unwrap();
        cache.add_list("key", "a".into(), 0, true).await.unwrap();

        // Removes only the first occurrence.
        cache.remove_list("key", "a", true).await.unwrap();
        assert_eq!(
            cache.get_list("key", true).await.unwrap(),
            vec!["b".to_string(), "a".to_string()]
        );

        cache.remove_list("key", "b", true).await.unwrap();
        cache.remove_list("key", "a", true).await.unwrap();
        assert!(!cache.exists("key", true).await.unwrap());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_add_list_does_not_refresh_ttl() {
        let cache = cache();
        cache.add_list("key", "a".into(), 80, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.add_list("key", "b".into(), 80, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 100ms since creation: the append must not have reset the clock.
        assert!(cache.get_list("key", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_map_sub_key_write_keeps_container_ttl() {
        let cache = cache();
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), TaggedValue::Int(1));
        cache.set_map("key", entries, 0, true).await.unwrap();

        cache
            .set_map_value("key", "b".into(), TaggedValue::Bool(true), true)
            .await
            .unwrap();
        let map = cache.get_map("key", true).await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("b"), Some(&TaggedValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_get_map_value_missing_sub_key_is_null() {
        let cache = cache();
        cache
            .set_map_value("key", "present".into(), TaggedValue::Int(1), true)
            .await
            .unwrap();
        assert_eq!(
            cache.get_map_value("key", "absent", true).await.unwrap(),
            TaggedValue::Null
        );
        assert_eq!(
            cache.get_map_value("missing", "sub", true).await.unwrap(),
            TaggedValue::Null
        );
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn test_exists_and_delete_do_not_touch_hit_stats() {
        let cache = cache();
        cache.set_string("key", Some("v".into()), 0, true).await.unwrap();
        assert!(cache.exists("key", true).await.unwrap());
        cache.delete("key", true).await.unwrap();
        assert!(!cache.exists("key", true).await.unwrap());
        cache.delete("key", true).await.unwrap();
        assert_eq!(cache.stats().hits(), 0);
        assert_eq!(cache.stats().misses(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_entries() {
        let cache = cache();
        cache.set_string("stale", Some("v".into()), 20, true).await.unwrap();
        cache.set_string("fresh", Some("v".into()), 0, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.stats().expired_keys(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_skips_expired_and_apply_replaces() {
        let cache = cache();
        cache.set_string("keep", Some("v".into()), 0, true).await.unwrap();
        cache.set_counter("count", 5, true).await.unwrap();
        cache.set_string("stale", Some("v".into()), 10, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);

        let follower = Cache::new(Arc::new(PubSub::new()));
        follower.set_string("old", Some("gone".into()), 0, true).await.unwrap();
        follower.apply_snapshot(snapshot);
        assert_eq!(follower.size(), 2);
        assert!(!follower.exists("old", true).await.unwrap());
        assert_eq!(follower.increment_counter("count", 0, true).await.unwrap(), 5);
    }
}
