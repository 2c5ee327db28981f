use crate::events::ChangeEvent;
use crate::planes::data::dedup::Deduplicator;
use crate::planes::data::ttl_store::TtlStore;
use crate::ports::ChangeSink;
use shared::Result;
use shared::config::SyncConfig;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Read-through view of remote data: TTL cache in front, request
/// deduplication behind it, invalidated by realtime dirty signals.
#[derive(Clone, Debug)]
pub struct RemoteState<V>
where
    V: Debug + Send + Sync + Clone + 'static,
{
    store: TtlStore<String, V>,
    dedup: Deduplicator<String, V>,
}

impl<V> RemoteState<V>
where
    V: Debug + Send + Sync + Clone + 'static,
{
    /// Combine an existing cache and in-flight table.
    pub fn new(store: TtlStore<String, V>, dedup: Deduplicator<String, V>) -> Self {
        Self { store, dedup }
    }

    /// Cache TTL, capacity and dedupe grace taken from `config`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            TtlStore::from_config(config),
            Deduplicator::new(config.dedupe_grace),
        )
    }

    /// The cache in front of the backend.
    pub fn store(&self) -> &TtlStore<String, V> {
        &self.store
    }

    /// Serve from cache, otherwise fetch once for all concurrent callers
    /// and cache the result for `ttl`. Failures are not cached.
    pub async fn fetch_with_ttl<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.store.get(&key.to_string()) {
            tracing::trace!(key, "cache hit");
            return Ok(value);
        }

        let store = self.store.clone();
        let cache_key = key.to_string();
        self.dedup
            .dedupe(key.to_string(), move || {
                let request = fetch();
                async move {
                    let value = request.await?;
                    store.set(cache_key, value.clone(), ttl);
                    Ok(value)
                }
            })
            .await
    }

    /// `fetch_with_ttl` with the store's default TTL.
    pub async fn fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.fetch_with_ttl(key, self.store.default_ttl(), fetch).await
    }

    /// Mark `key` dirty: the next read goes to the backend.
    pub fn invalidate(&self, key: &str) {
        self.store.invalidate(&key.to_string());
        self.dedup.forget(&key.to_string());
    }

    /// Drop every cached value and forget every in-flight request.
    pub fn clear(&self) {
        self.store.invalidate_all();
        self.dedup.clear();
    }

    /// A sink that invalidates `keys` whenever the subscription fires.
    pub fn invalidation_sink<I, S>(&self, keys: I) -> InvalidateOnChange<V>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InvalidateOnChange {
            state: self.clone(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

pub struct InvalidateOnChange<V>
where
    V: Debug + Send + Sync + Clone + 'static,
{
    state: RemoteState<V>,
    keys: Vec<String>,
}

impl<V> ChangeSink for InvalidateOnChange<V>
where
    V: Debug + Send + Sync + Clone + 'static,
{
    fn on_change(&self, event: ChangeEvent) {
        tracing::debug!(table = event.table(), keys = ?self.keys, "invalidating on change");
        for key in &self.keys {
            self.state.invalidate(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeKind, Row};
    use crate::events::RowChange;
    use shared::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> RemoteState<u32> {
        RemoteState::new(
            TtlStore::new(Duration::from_secs(30), None),
            Deduplicator::new(Duration::from_secs(2)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_caches_and_dedupes() {
        let state = state();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(42)
            }
        };

        let (a, b) = tokio::join!(state.fetch("profile:u1", fetch()), state.fetch("profile:u1", fetch()));
        assert_eq!((a, b), (Ok(42), Ok(42)));

        // long after the dedup grace window, the TTL cache still answers
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(state.fetch("profile:u1", fetch()).await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let state = state();

        let err = state
            .fetch("k", || async { Err(Error::TransientNetwork("offline".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(state.store().get(&"k".to_string()), None);

        state.invalidate("k");
        assert_eq!(state.fetch("k", || async { Ok(1) }).await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_sink_forces_refetch() {
        let state = state();
        assert_eq!(state.fetch("feed", || async { Ok(1) }).await, Ok(1));

        let sink = state.invalidation_sink(["feed"]);
        sink.on_change(crate::events::ChangeEvent::new(
            ChangeKind::Insert,
            RowChange::new("posts", Row::new(), None),
        ));

        assert_eq!(state.fetch("feed", || async { Ok(2) }).await, Ok(2));
    }
}
