use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{Error, Result};
use std::cmp::Ordering;

/// Rows are opaque JSON objects; the sync layer never interprets payloads
/// beyond the columns a filter names.
pub type Row = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { column: String, value: Value },
    Neq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    Gt { column: String, value: Value },
    Gte { column: String, value: Value },
    Lt { column: String, value: Value },
    Lte { column: String, value: Value },
    IsNull { column: String },
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. }
            | Filter::Neq { column, .. }
            | Filter::In { column, .. }
            | Filter::Gt { column, .. }
            | Filter::Gte { column, .. }
            | Filter::Lt { column, .. }
            | Filter::Lte { column, .. }
            | Filter::IsNull { column } => column,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let cell = row.get(self.column());
        match self {
            Filter::Eq { value, .. } => cell == Some(value),
            Filter::Neq { value, .. } => cell != Some(value),
            Filter::In { values, .. } => cell.is_some_and(|c| values.contains(c)),
            Filter::Gt { value, .. } => ordered(cell, value, |o| o == Ordering::Greater),
            Filter::Gte { value, .. } => ordered(cell, value, |o| o != Ordering::Less),
            Filter::Lt { value, .. } => ordered(cell, value, |o| o == Ordering::Less),
            Filter::Lte { value, .. } => ordered(cell, value, |o| o != Ordering::Greater),
            Filter::IsNull { .. } => cell.is_none_or(Value::is_null),
        }
    }
}

fn ordered(cell: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    cell.and_then(|c| compare_values(c, bound)).is_some_and(accept)
}

/// Numbers compare numerically, RFC 3339 timestamps chronologically, other
/// strings lexicographically. Mixed types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

/// A conjunctive row query with optional projection and count-only mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub columns: Option<Vec<String>>,
    pub count_only: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq { column: column.into(), value: value.into() })
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Neq { column: column.into(), value: value.into() })
    }

    pub fn in_set<V: Into<Value>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Gt { column: column.into(), value: value.into() })
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Gte { column: column.into(), value: value.into() })
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Lt { column: column.into(), value: value.into() })
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Lte { column: column.into(), value: value.into() })
    }

    /// Inclusive lower bound, exclusive upper bound.
    pub fn between(
        self,
        column: impl Into<String>,
        from: impl Into<Value>,
        until: impl Into<Value>,
    ) -> Self {
        let column = column.into();
        self.gte(column.clone(), from).lt(column, until)
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.filter(Filter::IsNull { column: column.into() })
    }

    pub fn select<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(f) = self.filters.iter().find(|f| f.column().is_empty()) {
            return Err(Error::InvalidQuery(format!("filter {f:?} has an empty column")));
        }
        if self.columns.as_ref().is_some_and(|c| c.iter().any(String::is_empty)) {
            return Err(Error::InvalidQuery("projection has an empty column".to_string()));
        }
        Ok(())
    }

    /// Evaluate the query against an in-memory row set.
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Row>) -> Result<QueryResult> {
        self.validate()?;

        let matching: Vec<&Row> = rows.into_iter().filter(|r| self.matches(r)).collect();
        let count = matching.len();
        if self.count_only {
            return Ok(QueryResult { rows: Vec::new(), count });
        }

        let rows = matching
            .into_iter()
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|row| match &self.columns {
                Some(columns) => columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect(),
                None => row.clone(),
            })
            .collect();

        Ok(QueryResult { rows, count })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Number of matching rows before `limit` was applied.
    pub count: usize,
}

/// Columns forming the unique key an upsert resolves conflicts on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictTarget(pub Vec<String>);

impl ConflictTarget {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self(columns.into_iter().map(Into::into).collect())
    }

    /// True when both rows carry equal, non-null values for every column.
    pub fn collides(&self, a: &Row, b: &Row) -> bool {
        !self.0.is_empty()
            && self.0.iter().all(|c| match (a.get(c), b.get(c)) {
                (Some(x), Some(y)) => !x.is_null() && x == y,
                _ => false,
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// What a realtime channel listens to: one table, some change kinds
/// (empty means all), rows matching every filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub table: String,
    pub kinds: Vec<ChangeKind>,
    pub filters: Vec<Filter>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            kinds: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn accepts(&self, table: &str, kind: ChangeKind, row: &Row) -> bool {
        self.table == table
            && (self.kinds.is_empty() || self.kinds.contains(&kind))
            && self.filters.iter().all(|f| f.matches(row))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvokeMethod {
    Post,
    Options,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub function: String,
    pub method: InvokeMethod,
    pub body: Value,
    pub auth_token: Option<String>,
}

impl InvokeRequest {
    pub fn post(function: impl Into<String>, body: Value) -> Self {
        Self {
            function: function.into(),
            method: InvokeMethod::Post,
            body,
            auth_token: None,
        }
    }

    pub fn preflight(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            method: InvokeMethod::Options,
            body: Value::Null,
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl InvokeResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authoritative answer of a moderation probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Banned, or not yet approved.
    Blocked,
    Clear,
}

/// Result of one raced status check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Confirmed(GateStatus),
    TimedOut,
    Failed(String),
}

impl CheckOutcome {
    /// Only a confirmed block gates the user; anything uncertain fails open.
    pub fn is_gated(&self) -> bool {
        matches!(self, CheckOutcome::Confirmed(GateStatus::Blocked))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, CheckOutcome::Confirmed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("test rows must be objects"),
        }
    }

    #[test]
    fn test_filters_on_rows() {
        let r = row(json!({
            "user_id": "u1",
            "likes": 12,
            "created_at": "2024-05-01T10:00:00Z",
            "deleted_at": null
        }));

        assert!(Filter::Eq { column: "user_id".into(), value: json!("u1") }.matches(&r));
        assert!(Filter::Neq { column: "user_id".into(), value: json!("u2") }.matches(&r));
        assert!(Filter::In { column: "likes".into(), values: vec![json!(1), json!(12)] }.matches(&r));
        assert!(Filter::Gt { column: "likes".into(), value: json!(10) }.matches(&r));
        assert!(!Filter::Lt { column: "likes".into(), value: json!(12) }.matches(&r));
        assert!(Filter::Lte { column: "likes".into(), value: json!(12) }.matches(&r));
        assert!(Filter::IsNull { column: "deleted_at".into() }.matches(&r));
        assert!(Filter::IsNull { column: "missing".into() }.matches(&r));
        assert!(!Filter::Gt { column: "user_id".into(), value: json!(3) }.matches(&r));
    }

    #[test]
    fn test_time_range_uses_chronological_order() {
        let r = row(json!({ "created_at": "2024-05-01T12:00:00+02:00" }));
        // 10:00Z once the offset is applied
        let q = Query::new().between("created_at", "2024-05-01T09:30:00Z", "2024-05-01T10:30:00Z");
        assert!(q.matches(&r));
    }

    #[test]
    fn test_apply_projection_count_and_limit() {
        let rows = vec![
            row(json!({ "id": 1, "room": "a", "body": "გამარჯობა" })),
            row(json!({ "id": 2, "room": "a", "body": "hi" })),
            row(json!({ "id": 3, "room": "b", "body": "yo" })),
        ];

        let result = Query::new().eq("room", "a").select(["id"]).limit(1).apply(&rows).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.rows, vec![row(json!({ "id": 1 }))]);

        let counted = Query::new().in_set("id", [1, 3]).count_only().apply(&rows).unwrap();
        assert_eq!(counted.count, 2);
        assert!(counted.rows.is_empty());
    }

    #[test]
    fn test_invalid_query_rejected() {
        let err = Query::new().eq("", 1).apply(std::iter::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_conflict_target_ignores_nulls() {
        let target = ConflictTarget::new(["post_id", "user_id"]);
        let a = row(json!({ "post_id": 1, "user_id": "u1" }));
        let b = row(json!({ "post_id": 1, "user_id": "u1", "at": 5 }));
        let c = row(json!({ "post_id": 1, "user_id": null }));
        assert!(target.collides(&a, &b));
        assert!(!target.collides(&c, &c));
    }

    #[test]
    fn test_channel_spec_accepts() {
        let mut spec = ChannelSpec::new("feed", "posts");
        spec.kinds = vec![ChangeKind::Insert];
        spec.filters = vec![Filter::Eq { column: "room".into(), value: json!("a") }];
        let r = row(json!({ "room": "a" }));
        assert!(spec.accepts("posts", ChangeKind::Insert, &r));
        assert!(!spec.accepts("posts", ChangeKind::Delete, &r));
        assert!(!spec.accepts("messages", ChangeKind::Insert, &r));
    }

    #[test]
    fn test_outcomes_fail_open() {
        assert!(CheckOutcome::Confirmed(GateStatus::Blocked).is_gated());
        assert!(!CheckOutcome::Confirmed(GateStatus::Clear).is_gated());
        assert!(!CheckOutcome::TimedOut.is_gated());
        assert!(!CheckOutcome::TimedOut.is_confirmed());
        assert!(!CheckOutcome::Failed("down".into()).is_gated());
    }
}
