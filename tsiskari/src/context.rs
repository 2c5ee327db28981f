use crate::domain::{Query, QueryResult, Row};
use crate::planes::control::{
    ApprovalProbe, BanProbe, CheckerConfig, DeferredInitializer, PrivilegedCalls, ReloadGuard,
    StatusChecker, SubscriptionConfig, SubscriptionManager,
};
use crate::planes::data::{RemoteState, WriteOutcome, insert_idempotent};
use crate::ports::{Backend, KeyValueStore, RealtimeTransport, StatusProbe};
use shared::Result;
use shared::config::SyncConfig;
use std::sync::Arc;
use tracing::info;

/// Everything one signed-in client shares: the backend handles, the
/// query cache and its in-flight table.
///
/// Built once at startup and passed around instead of living in globals.
/// `sign_out` drops all cached state.
#[derive(Clone)]
pub struct SyncContext {
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    transport: Arc<dyn RealtimeTransport>,
    remote: RemoteState<QueryResult>,
}

impl SyncContext {
    /// Wire a context over `backend` and `transport` with an empty cache.
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Self {
        let remote = RemoteState::from_config(&config);
        Self {
            config,
            backend,
            transport,
            remote,
        }
    }

    /// Settings the context was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Query, write and function-call port.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Realtime change feed port.
    pub fn transport(&self) -> &Arc<dyn RealtimeTransport> {
        &self.transport
    }

    /// The shared query cache.
    pub fn remote(&self) -> &RemoteState<QueryResult> {
        &self.remote
    }

    /// Run `query` through the cache under `key`. Concurrent callers with
    /// the same key share one backend request.
    pub async fn query_cached(&self, key: &str, table: &str, query: Query) -> Result<QueryResult> {
        let backend = Arc::clone(&self.backend);
        let table = table.to_string();
        self.remote
            .fetch(key, move || async move { backend.query(&table, &query).await })
            .await
    }

    /// Mark the cached result under `key` dirty.
    pub fn invalidate(&self, key: &str) {
        self.remote.invalidate(key);
    }

    /// Insert `row`, treating a unique-key conflict as already done.
    pub async fn insert_idempotent(&self, table: &str, row: Row) -> Result<WriteOutcome> {
        insert_idempotent(self.backend.as_ref(), table, row).await
    }

    /// Status checker over any moderation lookup. Not started.
    pub fn gate(&self, probe: Arc<dyn StatusProbe>) -> StatusChecker {
        StatusChecker::new(probe, CheckerConfig::from_config(&self.config))
    }

    /// Periodic ban check for `user_id`. Not started.
    pub fn ban_gate(&self, user_id: &str) -> StatusChecker {
        self.gate(Arc::new(BanProbe::new(Arc::clone(&self.backend), user_id)))
    }

    /// Periodic approval check for `user_id`. Not started.
    pub fn approval_gate(&self, user_id: &str) -> StatusChecker {
        self.gate(Arc::new(ApprovalProbe::new(Arc::clone(&self.backend), user_id)))
    }

    /// Subscription on this context's transport. Not started.
    pub fn subscription(&self, config: SubscriptionConfig) -> SubscriptionManager {
        SubscriptionManager::new(Arc::clone(&self.transport), config)
    }

    /// Subscription config that marks `keys` dirty on every change to
    /// `table`, debounced by the configured window.
    pub fn invalidate_on_change<I, S>(&self, channel: &str, table: &str, keys: I) -> SubscriptionConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SubscriptionConfig::new(channel, table, self.remote.invalidation_sink(keys))
            .debounce(self.config.debounce_window)
    }

    /// Empty initializer for work that waits until after first paint.
    pub fn deferred(&self) -> DeferredInitializer {
        DeferredInitializer::new()
    }

    /// Server-side functions reached through the backend.
    pub fn privileged(&self) -> PrivilegedCalls {
        PrivilegedCalls::new(Arc::clone(&self.backend))
    }

    /// Reload guard persisting its attempt marker in `store`.
    pub fn reload_guard(&self, store: Arc<dyn KeyValueStore>) -> ReloadGuard {
        ReloadGuard::new(store, self.config.reload_cooldown)
    }

    /// Forget every cached result and in-flight request.
    pub fn sign_out(&self) {
        info!("signing out, clearing cached state");
        self.remote.clear();
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
