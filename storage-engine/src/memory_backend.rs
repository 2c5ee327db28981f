use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsiskari::domain::{
    ChangeKind, ChannelSpec, ConflictTarget, InvokeMethod, InvokeRequest, InvokeResponse, Query,
    QueryResult, Row,
};
use tsiskari::events::{ChangeEvent, RowChange};
use tsiskari::ports::{Backend, ChannelId, RealtimeChannel, RealtimeTransport};

const CHANGE_FEED_CAPACITY: usize = 1024;

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    (
        "Access-Control-Allow-Headers",
        "authorization, x-client-info, apikey, content-type",
    ),
];

/// A serverless function body: request payload and the caller's user id
/// (when a valid token was sent) in, response payload out.
pub type FunctionHandler = Arc<dyn Fn(Value, Option<String>) -> Result<Value> + Send + Sync>;

struct RegisteredFunction {
    requires_auth: bool,
    handler: FunctionHandler,
}

#[derive(Default)]
struct Table {
    unique_keys: Vec<ConflictTarget>,
    rows: Vec<Row>,
}

impl Table {
    fn conflicting_key(&self, row: &Row, skip: Option<usize>) -> Option<&ConflictTarget> {
        self.unique_keys.iter().find(|key| {
            self.rows
                .iter()
                .enumerate()
                .any(|(i, existing)| Some(i) != skip && key.collides(existing, row))
        })
    }
}

/// In-process backend: tables of JSON rows with unique keys, a realtime
/// change feed, and a registry of serverless functions.
///
/// Stands in for the managed backend in the client binary and in tests.
/// Per-table latency and an offline switch let callers exercise the
/// timeout and fail-open paths.
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
    changes: broadcast::Sender<ChangeEvent>,
    channels: DashMap<ChannelId, CancellationToken>,
    functions: DashMap<String, RegisteredFunction>,
    tokens: DashMap<String, String>,
    latency: DashMap<String, Duration>,
    offline: AtomicBool,
    queries: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: RwLock::new(HashMap::new()),
            changes,
            channels: DashMap::new(),
            functions: DashMap::new(),
            tokens: DashMap::new(),
            latency: DashMap::new(),
            offline: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    /// Create `name` (or replace its unique keys). Tables are also created
    /// implicitly, without unique keys, on first write.
    pub async fn define_table(&self, name: &str, unique_keys: impl IntoIterator<Item = ConflictTarget>) {
        let mut tables = self.tables.write().await;
        tables.entry(name.to_string()).or_default().unique_keys = unique_keys.into_iter().collect();
    }

    pub fn register_function<F>(&self, name: &str, requires_auth: bool, handler: F)
    where
        F: Fn(Value, Option<String>) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_string(),
            RegisteredFunction {
                requires_auth,
                handler: Arc::new(handler),
            },
        );
    }

    /// Issue a session token for `user_id`.
    pub fn issue_token(&self, user_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens.insert(token.clone(), user_id.to_string());
        token
    }

    pub fn revoke_token(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Delay every call touching `table` (or a function of that name).
    pub fn set_latency(&self, table: &str, latency: Duration) {
        if latency.is_zero() {
            self.latency.remove(table);
        } else {
            self.latency.insert(table.to_string(), latency);
        }
    }

    /// While offline every call fails with `Error::TransientNetwork`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Number of `query` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Acquire)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    async fn round_trip(&self, target: &str) -> Result<()> {
        let latency = self.latency.get(target).map(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::Acquire) {
            return Err(Error::TransientNetwork(format!("{target}: backend offline")));
        }
        Ok(())
    }

    fn publish(&self, kind: ChangeKind, table: &str, record: Row, old_record: Option<Row>) {
        let event = ChangeEvent::new(kind, RowChange::new(table, record, old_record));
        // no open channel is fine
        let _ = self.changes.send(event);
    }
}

fn with_id(mut row: Row) -> Row {
    if !row.contains_key("id") {
        row.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    row
}

fn conflict(table: &str, key: &ConflictTarget) -> Error {
    Error::Conflict(format!("duplicate key ({}) in {table}", key.0.join(", ")))
}

fn status_for(err: &Error) -> u16 {
    match err {
        Error::Auth(_) => 401,
        Error::NotFound => 404,
        Error::InvalidQuery(_) => 400,
        Error::Conflict(_) => 409,
        _ => 500,
    }
}

fn cors(mut response: InvokeResponse) -> InvokeResponse {
    response.headers.extend(
        CORS_HEADERS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string())),
    );
    response
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, table: &str, query: &Query) -> Result<QueryResult> {
        self.queries.fetch_add(1, Ordering::AcqRel);
        self.round_trip(table).await?;

        let tables = self.tables.read().await;
        match tables.get(table) {
            Some(t) => query.apply(&t.rows),
            None => query.apply(std::iter::empty()),
        }
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        self.round_trip(table).await?;
        let row = with_id(row);

        let mut tables = self.tables.write().await;
        let t = tables.entry(table.to_string()).or_default();
        if let Some(key) = t.conflicting_key(&row, None) {
            return Err(conflict(table, key));
        }
        t.rows.push(row.clone());
        drop(tables);

        debug!(table, "row inserted");
        self.publish(ChangeKind::Insert, table, row.clone(), None);
        Ok(row)
    }

    async fn upsert(&self, table: &str, row: Row, target: &ConflictTarget) -> Result<Row> {
        self.round_trip(table).await?;

        let mut tables = self.tables.write().await;
        let t = tables.entry(table.to_string()).or_default();
        let existing = t.rows.iter().position(|r| target.collides(r, &row));

        let row = match existing {
            Some(_) => row,
            None => with_id(row),
        };
        if let Some(key) = t.conflicting_key(&row, existing) {
            return Err(conflict(table, key));
        }

        let old = match existing {
            Some(index) => Some(std::mem::replace(&mut t.rows[index], row.clone())),
            None => {
                t.rows.push(row.clone());
                None
            }
        };
        drop(tables);

        match old {
            Some(old) => self.publish(ChangeKind::Update, table, row.clone(), Some(old)),
            None => self.publish(ChangeKind::Insert, table, row.clone(), None),
        }
        Ok(row)
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<usize> {
        self.round_trip(table).await?;
        query.validate()?;

        let mut tables = self.tables.write().await;
        let Some(t) = tables.get_mut(table) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            std::mem::take(&mut t.rows).into_iter().partition(|r| query.matches(r));
        t.rows = kept;
        drop(tables);

        let count = removed.len();
        for row in removed {
            self.publish(ChangeKind::Delete, table, row, None);
        }
        Ok(count)
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        if request.method == InvokeMethod::Options {
            return Ok(cors(InvokeResponse::new(200, Value::Null)));
        }
        self.round_trip(&request.function).await?;

        let (requires_auth, handler) = match self.functions.get(&request.function) {
            Some(f) => (f.requires_auth, Arc::clone(&f.handler)),
            None => {
                return Ok(cors(InvokeResponse::new(
                    404,
                    Value::String(format!("function {} not found", request.function)),
                )));
            }
        };

        let caller = request
            .auth_token
            .as_deref()
            .and_then(|token| self.tokens.get(token).map(|user| user.value().clone()));

        if requires_auth {
            match (&request.auth_token, &caller) {
                (None, _) => {
                    return Err(Error::Auth(format!("{} requires a session token", request.function)));
                }
                (Some(_), None) => {
                    warn!(function = %request.function, "rejected invalid session token");
                    return Ok(cors(InvokeResponse::new(401, Value::String("invalid token".into()))));
                }
                _ => {}
            }
        }

        let response = match handler(request.body, caller) {
            Ok(body) => InvokeResponse::new(200, body),
            Err(e) => InvokeResponse::new(status_for(&e), Value::String(e.to_string())),
        };
        Ok(cors(response))
    }
}

#[async_trait]
impl RealtimeTransport for MemoryBackend {
    async fn open(&self, spec: &ChannelSpec) -> Result<RealtimeChannel> {
        if self.offline.load(Ordering::Acquire) {
            return Err(Error::TransientNetwork(format!("{}: realtime offline", spec.name)));
        }

        let id = format!("{}:{}", spec.name, uuid::Uuid::new_v4());
        let token = CancellationToken::new();
        self.channels.insert(id.clone(), token.clone());

        let spec = spec.clone();
        let channel = id.clone();
        let events = BroadcastStream::new(self.changes.subscribe())
            .filter_map(move |item| {
                let event = match item {
                    Ok(event) if spec.accepts(event.table(), event.kind(), event.record()) => Some(event),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "realtime channel lagged, events dropped");
                        None
                    }
                };
                futures::future::ready(event)
            })
            .take_until(token.cancelled_owned())
            .boxed();

        info!(channel = %id, "realtime channel opened");
        Ok(RealtimeChannel { id, events })
    }

    async fn close(&self, id: &ChannelId) -> Result<()> {
        if let Some((_, token)) = self.channels.remove(id) {
            token.cancel();
            info!(channel = %id, "realtime channel closed");
        }
        Ok(())
    }
}
