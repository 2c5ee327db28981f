use crate::domain::{GateStatus, Query, compare_values};
use crate::ports::{Backend, StatusProbe};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use shared::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

pub const BANS_TABLE: &str = "user_bans";
pub const PROFILES_TABLE: &str = "profiles";

/// Blocked while the user has an active ban that is permanent (no
/// `expires_at`) or not yet expired.
pub struct BanProbe {
    backend: Arc<dyn Backend>,
    user_id: String,
    name: String,
}

impl BanProbe {
    pub fn new(backend: Arc<dyn Backend>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            name: format!("ban:{user_id}"),
            backend,
            user_id,
        }
    }
}

#[async_trait]
impl StatusProbe for BanProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<GateStatus> {
        let query = Query::new()
            .eq("user_id", self.user_id.as_str())
            .eq("is_active", true)
            .select(["expires_at"]);
        let result = self.backend.query(BANS_TABLE, &query).await?;

        let now = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let banned = result.rows.iter().any(|row| match row.get("expires_at") {
            None | Some(Value::Null) => true,
            Some(expires_at) => compare_values(expires_at, &now) == Some(Ordering::Greater),
        });

        Ok(if banned { GateStatus::Blocked } else { GateStatus::Clear })
    }
}

/// Blocked until the profile's `approval_status` is `approved`.
pub struct ApprovalProbe {
    backend: Arc<dyn Backend>,
    user_id: String,
    name: String,
}

impl ApprovalProbe {
    pub fn new(backend: Arc<dyn Backend>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            name: format!("approval:{user_id}"),
            backend,
            user_id,
        }
    }
}

#[async_trait]
impl StatusProbe for ApprovalProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<GateStatus> {
        let query = Query::new()
            .eq("id", self.user_id.as_str())
            .select(["approval_status"])
            .limit(1);
        let result = self.backend.query(PROFILES_TABLE, &query).await?;

        let row = result.rows.first().ok_or(Error::NotFound)?;
        match row.get("approval_status").and_then(Value::as_str) {
            Some("approved") => Ok(GateStatus::Clear),
            _ => Ok(GateStatus::Blocked),
        }
    }
}
