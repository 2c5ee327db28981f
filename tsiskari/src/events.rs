use crate::domain::{ChangeKind, Row};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A row change delivered by the realtime feed. Consumers treat it as a
/// dirty signal and refetch; the payload is informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Inserted(RowChange),
    Updated(RowChange),
    Deleted(RowChange),
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, change: RowChange) -> Self {
        match kind {
            ChangeKind::Insert => ChangeEvent::Inserted(change),
            ChangeKind::Update => ChangeEvent::Updated(change),
            ChangeKind::Delete => ChangeEvent::Deleted(change),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Inserted(_) => ChangeKind::Insert,
            ChangeEvent::Updated(_) => ChangeKind::Update,
            ChangeEvent::Deleted(_) => ChangeKind::Delete,
        }
    }

    pub fn change(&self) -> &RowChange {
        match self {
            ChangeEvent::Inserted(c) | ChangeEvent::Updated(c) | ChangeEvent::Deleted(c) => c,
        }
    }

    pub fn table(&self) -> &str {
        &self.change().table
    }

    /// The new row for inserts and updates, the removed row for deletes.
    pub fn record(&self) -> &Row {
        &self.change().record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub record: Row,
    pub old_record: Option<Row>,
    /// Milliseconds since UNIX epoch
    pub commit_timestamp: u64,
}

impl RowChange {
    pub fn new(table: impl Into<String>, record: Row, old_record: Option<Row>) -> Self {
        Self {
            table: table.into(),
            record,
            old_record,
            commit_timestamp: now_timestamp_ms(),
        }
    }
}

/// Helper to get current timestamp in milliseconds since UNIX epoch
pub fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let mut record = Row::new();
        record.insert("id".into(), json!(7));
        let event = ChangeEvent::new(ChangeKind::Update, RowChange::new("posts", record, None));

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["type"], "updated");
        assert_eq!(encoded["table"], "posts");
        assert_eq!(event.kind(), ChangeKind::Update);
        assert_eq!(event.record()["id"], json!(7));
    }
}
