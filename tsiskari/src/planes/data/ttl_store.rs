use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use shared::config::SyncConfig;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    timestamp: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) >= self.ttl
    }
}

/// Keyed store with per-entry TTL and lazy eviction.
///
/// Moka only provides the concurrent (optionally bounded) map here; it is
/// built without a time-to-live so expiry is decided solely by each entry's
/// own timestamp, read from the tokio clock. An expired entry is dropped by
/// the `get` that observes it, there is no background sweep, and only if
/// no newer write has replaced it in the meantime.
#[derive(Clone)]
pub struct TtlStore<K, V>
where
    K: Debug + Clone + Hash + Eq + Send + Sync + 'static,
    V: Debug + Send + Sync + Clone + 'static,
{
    entries: Cache<K, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<K, V> TtlStore<K, V>
where
    K: Debug + Clone + Hash + Eq + Send + Sync + 'static,
    V: Debug + Send + Sync + Clone + 'static,
{
    /// Unbounded when `max_entries` is `None`.
    pub fn new(default_ttl: Duration, max_entries: Option<u64>) -> Self {
        let mut builder = Cache::builder();

        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }

        Self {
            entries: builder.build(),
            default_ttl,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.cache_ttl, config.cache_max_entries)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `None` means "refetch": either never stored, invalidated, evicted for
    /// capacity, or older than its TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;

        if entry.is_expired(Instant::now()) {
            tracing::trace!(?key, "cache entry expired");
            self.evict_expired(key, entry.timestamp);
            return None;
        }

        Some(entry.value)
    }

    /// Removes `key` only if it still holds the entry written at `stamped`.
    fn evict_expired(&self, key: &K, stamped: Instant) -> bool {
        let result = self.entries.entry(key.clone()).and_compute_with(|current| match current {
            Some(entry) if entry.value().timestamp == stamped => Op::Remove,
            _ => Op::Nop,
        });
        matches!(result, CompResult::Removed(_))
    }

    /// Last writer wins.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                timestamp: Instant::now(),
                ttl,
            },
        );
    }

    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate; includes expired entries nobody has read yet.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Debug for TtlStore<K, V>
where
    K: Debug + Clone + Hash + Eq + Send + Sync + 'static,
    V: Debug + Send + Sync + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore")
            .field("entry_count", &self.entries.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_exactly_at_ttl() {
        let store = TtlStore::new(Duration::from_millis(5000), None);
        store.set_default("a", 1);

        advance(Duration::from_millis(4999)).await;
        assert_eq!(store.get(&"a"), Some(1));

        advance(Duration::from_millis(2)).await;
        assert_eq!(store.get(&"a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_on_read() {
        let store = TtlStore::new(Duration::from_secs(1), None);
        store.set("k", "v", Duration::from_millis(10));
        assert_eq!(store.len(), 1);

        advance(Duration::from_millis(10)).await;
        assert_eq!(store.get(&"k"), None);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes_timestamp() {
        let store = TtlStore::new(Duration::from_millis(100), None);
        store.set_default("key", "value1");

        advance(Duration::from_millis(80)).await;
        store.set_default("key", "value2");

        advance(Duration::from_millis(80)).await;
        assert_eq!(store.get(&"key"), Some("value2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_never_evicts_a_newer_write() {
        let store = TtlStore::new(Duration::from_secs(60), None);
        store.set("k", 1, Duration::from_millis(10));
        let stale = Instant::now();

        advance(Duration::from_millis(10)).await;
        // a reader saw the expired entry, then a writer got in first
        store.set_default("k", 2);
        assert!(!store.evict_expired(&"k", stale));
        assert_eq!(store.get(&"k"), Some(2));

        store.set("k", 3, Duration::ZERO);
        assert_eq!(store.get(&"k"), None);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_invalidate_all() {
        let store = TtlStore::new(Duration::from_secs(60), None);
        store.set_default("a", 1);
        store.set_default("b", 2);

        store.invalidate(&"a");
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.get(&"b"), Some(2));

        store.invalidate_all();
        assert_eq!(store.get(&"b"), None);
    }

    #[tokio::test]
    async fn test_per_entry_ttl_is_independent() {
        let store = TtlStore::new(Duration::from_secs(60), None);
        store.set("short", 1, Duration::ZERO);
        store.set_default("long", 2);

        assert_eq!(store.get(&"short"), None);
        assert_eq!(store.get(&"long"), Some(2));
    }

    #[tokio::test]
    async fn test_bounded_store() {
        let store = TtlStore::new(Duration::from_secs(60), Some(2));
        for i in 0..10 {
            store.set_default(i, i);
        }

        assert!(store.len() <= 2, "store should hold at most 2 entries");
    }
}
