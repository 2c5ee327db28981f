use crate::domain::Row;
use crate::ports::Backend;
use shared::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    Inserted(Row),
    /// The row collided with an existing unique key; nothing was written.
    AlreadyPresent,
}

/// Insert that treats a unique-key conflict as success.
pub async fn insert_idempotent(backend: &dyn Backend, table: &str, row: Row) -> Result<WriteOutcome> {
    match backend.insert(table, row).await {
        Ok(stored) => Ok(WriteOutcome::Inserted(stored)),
        Err(Error::Conflict(detail)) => {
            tracing::debug!(table, %detail, "duplicate insert treated as success");
            Ok(WriteOutcome::AlreadyPresent)
        }
        Err(e) => {
            tracing::error!(table, error = %e, "insert failed");
            Err(e)
        }
    }
}
