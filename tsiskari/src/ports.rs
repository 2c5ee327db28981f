use crate::domain::{
    ChannelSpec, ConflictTarget, GateStatus, InvokeRequest, InvokeResponse, Query, QueryResult, Row,
};
use crate::events::ChangeEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::Result;

// Ports are the seams to the managed backend and to whatever hosts the UI

/// Row storage and serverless functions of the backend collaborator.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn query(&self, table: &str, query: &Query) -> Result<QueryResult>;

    /// Fails with `Error::Conflict` when the row collides with an existing
    /// unique key.
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Insert, or replace the row that collides on `conflict`.
    async fn upsert(&self, table: &str, row: Row, conflict: &ConflictTarget) -> Result<Row>;

    /// Returns the number of rows removed.
    async fn delete(&self, table: &str, query: &Query) -> Result<usize>;

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse>;
}

pub type ChannelId = String;

/// An opened change feed. The stream ends when the channel is closed.
pub struct RealtimeChannel {
    pub id: ChannelId,
    pub events: BoxStream<'static, ChangeEvent>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("id", &self.id)
            .field("events", &"<stream>")
            .finish()
    }
}

/// Realtime change-feed transport.
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    async fn open(&self, spec: &ChannelSpec) -> Result<RealtimeChannel>;

    /// Closing an unknown or already closed channel is not an error.
    async fn close(&self, id: &ChannelId) -> Result<()>;
}

/// One authoritative moderation query (ban state, approval state, ...).
#[async_trait]
pub trait StatusProbe: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn probe(&self) -> Result<GateStatus>;
}

/// Receives "something changed" signals from a subscription.
pub trait ChangeSink: Send + Sync + 'static {
    fn on_change(&self, event: ChangeEvent);
}

impl<F> ChangeSink for F
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    fn on_change(&self, event: ChangeEvent) {
        self(event)
    }
}

/// Small persisted string store, the client's localStorage.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<bool>;
}
