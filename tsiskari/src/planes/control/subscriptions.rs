use crate::domain::{ChangeKind, ChannelSpec, Filter};
use crate::events::ChangeEvent;
use crate::ports::{ChangeSink, ChannelId, RealtimeTransport};
use futures::StreamExt;
use futures::stream::BoxStream;
use shared::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventPredicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// What to listen to and who to tell.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub channel: String,
    pub table: String,
    pub kinds: Vec<ChangeKind>,
    pub filters: Vec<Filter>,
    /// Client-side check applied after the transport's own filtering.
    pub predicate: Option<EventPredicate>,
    pub sink: Arc<dyn ChangeSink>,
    pub debounce: Duration,
    pub enabled: bool,
}

impl SubscriptionConfig {
    pub fn new(
        channel: impl Into<String>,
        table: impl Into<String>,
        sink: impl ChangeSink,
    ) -> Self {
        Self::with_sink(channel, table, Arc::new(sink))
    }

    /// Same as `new` for a sink that is shared between subscriptions.
    pub fn with_sink(
        channel: impl Into<String>,
        table: impl Into<String>,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            channel: channel.into(),
            table: table.into(),
            kinds: Vec::new(),
            filters: Vec::new(),
            predicate: None,
            sink,
            debounce: Duration::ZERO,
            enabled: true,
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn predicate(
        mut self,
        predicate: impl Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            name: self.channel.clone(),
            table: self.table.clone(),
            kinds: self.kinds.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("channel", &self.channel)
            .field("table", &self.table)
            .field("kinds", &self.kinds)
            .field("filters", &self.filters)
            .field("debounce", &self.debounce)
            .field("enabled", &self.enabled)
            .finish()
    }
}

struct ActiveChannel {
    id: ChannelId,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Owns at most one realtime channel for one consumer.
///
/// `start()` opens it, `stop()` (or dropping the manager) closes it. Bursts
/// of events are collapsed with a trailing debounce before reaching the
/// sink; the sink only learns that something changed.
pub struct SubscriptionManager {
    transport: Arc<dyn RealtimeTransport>,
    config: SubscriptionConfig,
    enabled: AtomicBool,
    active: Mutex<Option<ActiveChannel>>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: SubscriptionConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            transport,
            config,
            active: Mutex::new(None),
        }
    }

    /// Build and start in one step.
    pub async fn subscribe(
        transport: Arc<dyn RealtimeTransport>,
        config: SubscriptionConfig,
    ) -> Result<Self> {
        let manager = Self::new(transport, config);
        manager.start().await?;
        Ok(manager)
    }

    /// Channel, table and sink this manager was built with.
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Open the channel. No-op when disabled or already open; a channel
    /// whose stream the transport ended is closed and opened again.
    pub async fn start(&self) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            debug!(channel = %self.config.channel, "subscription disabled, not opening");
            return Ok(());
        }

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|c| !c.pump.is_finished()) {
            return Ok(());
        }
        if let Some(ended) = active.take() {
            info!(channel = %self.config.channel, id = %ended.id, "realtime stream had ended, reopening");
            if let Err(e) = self.transport.close(&ended.id).await {
                warn!(channel = %self.config.channel, id = %ended.id, error = %e, "failed to close ended realtime channel");
            }
        }

        let channel = self.transport.open(&self.config.channel_spec()).await?;
        info!(channel = %self.config.channel, id = %channel.id, table = %self.config.table, "realtime channel opened");

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            channel.events,
            cancel.clone(),
            self.config.predicate.clone(),
            Arc::clone(&self.config.sink),
            self.config.debounce,
        ));

        *active = Some(ActiveChannel {
            id: channel.id,
            cancel,
            pump,
        });
        Ok(())
    }

    /// Close the channel. Safe to call any number of times.
    pub async fn stop(&self) {
        let taken = self.active.lock().await.take();
        let Some(channel) = taken else {
            return;
        };

        channel.cancel.cancel();
        if let Err(e) = self.transport.close(&channel.id).await {
            warn!(channel = %self.config.channel, id = %channel.id, error = %e, "failed to close realtime channel");
        } else {
            info!(channel = %self.config.channel, id = %channel.id, "realtime channel closed");
        }
    }

    /// Alias of `stop` for call sites that read better as an unsubscribe.
    pub async fn unsubscribe(&self) {
        self.stop().await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::Release);
        if enabled {
            self.start().await
        } else {
            self.stop().await;
            Ok(())
        }
    }

    /// Open and still receiving; false once the transport ends the stream.
    pub async fn is_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.pump.is_finished())
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let Some(channel) = self.active.get_mut().take() else {
            return;
        };
        channel.cancel.cancel();

        // closing is async; hand it to the runtime if there still is one
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            runtime.spawn(async move {
                if let Err(e) = transport.close(&channel.id).await {
                    warn!(id = %channel.id, error = %e, "failed to close realtime channel on drop");
                }
            });
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config", &self.config)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Forward events to the sink with a trailing debounce: every accepted
/// event restarts the quiet period, and only the last event of a burst is
/// delivered once the period elapses. An event still waiting when the
/// stream ends is delivered right away.
async fn pump_events(
    mut events: BoxStream<'static, ChangeEvent>,
    cancel: CancellationToken,
    predicate: Option<EventPredicate>,
    sink: Arc<dyn ChangeSink>,
    window: Duration,
) {
    let mut pending: Option<ChangeEvent> = None;
    let quiet = sleep(window);
    tokio::pin!(quiet);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(event) => {
                    if predicate.as_ref().is_some_and(|accept| !accept(&event)) {
                        continue;
                    }
                    pending = Some(event);
                    quiet.as_mut().reset(Instant::now() + window);
                }
                None => {
                    debug!(flushing = pending.is_some(), "realtime stream ended");
                    if let Some(event) = pending.take() {
                        sink.on_change(event);
                    }
                    break;
                }
            },
            _ = &mut quiet, if pending.is_some() => {
                if let Some(event) = pending.take() {
                    debug!(table = event.table(), kind = ?event.kind(), "delivering debounced change");
                    sink.on_change(event);
                }
            }
        }
    }
}

/// Several subscriptions that share one teardown path.
///
/// A channel that fails to open is logged and skipped; the rest keep
/// running, and `stop()` closes every channel that did open.
#[derive(Debug)]
pub struct BatchSubscription {
    managers: Vec<SubscriptionManager>,
}

impl BatchSubscription {
    pub async fn start(
        transport: Arc<dyn RealtimeTransport>,
        configs: impl IntoIterator<Item = SubscriptionConfig>,
    ) -> Self {
        let mut managers = Vec::new();
        for config in configs {
            let manager = SubscriptionManager::new(Arc::clone(&transport), config);
            if let Err(e) = manager.start().await {
                warn!(channel = %manager.config().channel, error = %e, "failed to open channel, continuing with the rest");
            }
            managers.push(manager);
        }
        Self { managers }
    }

    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for manager in &self.managers {
            if manager.is_active().await {
                count += 1;
            }
        }
        count
    }

    pub async fn stop(&self) {
        for manager in &self.managers {
            manager.stop().await;
        }
    }
}
