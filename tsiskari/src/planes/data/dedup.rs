use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use shared::Result;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlightRequest<T> {
    generation: u64,
    future: SharedResult<T>,
}

/// Collapses concurrent requests for the same key into one shared future.
///
/// A settled request stays in the table for a grace window so a burst of
/// repeated calls is served the same result, then it is dropped and the
/// next call goes to the backend again.
pub struct Deduplicator<K, T>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    in_flight: Arc<DashMap<K, InFlightRequest<T>>>,
    next_generation: Arc<AtomicU64>,
    grace: Duration,
}

impl<K, T> Clone for Deduplicator<K, T>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
            next_generation: Arc::clone(&self.next_generation),
            grace: self.grace,
        }
    }
}

impl<K, T> Deduplicator<K, T>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
            grace,
        }
    }

    /// Join the in-flight request for `key`, or start one with `factory`.
    ///
    /// `factory` runs under the table's shard lock and must only build the
    /// future, not call back into this deduplicator.
    pub fn dedupe<F, Fut>(&self, key: K, factory: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(?key, "joining in-flight request");
                existing.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let table = Arc::clone(&self.in_flight);
                let grace = self.grace;
                let request = factory();

                let future = async move {
                    let result = request.await;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        // a forget() + new request may have replaced us
                        table.remove_if(&key, |_, entry| entry.generation == generation);
                    });
                    result
                }
                .boxed()
                .shared();

                slot.insert(InFlightRequest {
                    generation,
                    future: future.clone(),
                });
                future
            }
        }
    }

    /// Drop the entry for `key` now; current waiters still get their result.
    pub fn forget(&self, key: &K) {
        self.in_flight.remove(key);
    }

    pub fn clear(&self) {
        self.in_flight.clear();
    }

    /// Requests currently tracked, including settled ones inside their grace window.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K, T> Default for Deduplicator<K, T>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl<K, T> Debug for Deduplicator<K, T>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("in_flight", &self.in_flight.len())
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Error;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_factory(
        calls: &Arc<AtomicUsize>,
        result: Result<u32>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_millis(100)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_request() {
        let dedup: Deduplicator<&str, u32> = Deduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = dedup.dedupe("feed", counting_factory(&calls, Ok(7)));
        let b = dedup.dedupe("feed", counting_factory(&calls, Ok(8)));
        let c = dedup.dedupe("feed", counting_factory(&calls, Ok(9)));

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(c, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_are_independent() {
        let dedup: Deduplicator<&str, u32> = Deduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            dedup.dedupe("a", counting_factory(&calls, Ok(1))),
            dedup.dedupe("b", counting_factory(&calls, Ok(2))),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_absorbs_then_expires() {
        let dedup: Deduplicator<&str, u32> = Deduplicator::new(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(1))).await, Ok(1));

        // still inside the grace window: same result, no new call
        sleep(Duration::from_millis(500)).await;
        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(2))).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1600)).await;
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(3))).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_every_waiter_and_retries_later() {
        let dedup: Deduplicator<&str, u32> = Deduplicator::new(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = Error::TransientNetwork("offline".into());

        let (a, b) = tokio::join!(
            dedup.dedupe("k", counting_factory(&calls, Err(failure.clone()))),
            dedup.dedupe("k", counting_factory(&calls, Ok(1))),
        );
        assert_eq!(a, Err(failure.clone()));
        assert_eq!(b, Err(failure));

        sleep(Duration::from_millis(2100)).await;
        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(5))).await, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_does_not_let_old_timer_evict_new_request() {
        let dedup: Deduplicator<&str, u32> = Deduplicator::new(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(1))).await, Ok(1));
        dedup.forget(&"k");

        // The second request settles at ~1200ms. The first request's removal
        // timer fires at ~2100ms and must leave it alone.
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(2))).await, Ok(2));
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(dedup.in_flight(), 1);
        assert_eq!(dedup.dedupe("k", counting_factory(&calls, Ok(3))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
