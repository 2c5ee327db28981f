use crate::ports::KeyValueStore;
use shared::{Error, ErrorPolicy, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub const LAST_AUTO_REFRESH_KEY: &str = "tsiskari.last_auto_refresh";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadDecision {
    /// Reload the page now; the attempt has been recorded.
    Reload,
    /// A reload already happened inside the cooldown, show a retry button.
    ManualRetry,
}

/// Allows at most one automatic reload per cooldown window after a module
/// load failure, so a persistently broken bundle cannot loop forever.
pub struct ReloadGuard {
    store: Arc<dyn KeyValueStore>,
    cooldown: Duration,
}

impl ReloadGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub fn on_load_error(&self, err: &Error) -> Result<ReloadDecision> {
        self.decide_at(err, now_ms())
    }

    pub fn decide_at(&self, err: &Error, now_ms: u64) -> Result<ReloadDecision> {
        if err.policy() != ErrorPolicy::ReloadOnce {
            return Err(Error::Internal(format!("not a module load failure: {err}")));
        }

        let last = match self.store.get(LAST_AUTO_REFRESH_KEY) {
            Ok(raw) => raw.and_then(|v| v.parse::<u64>().ok()),
            Err(e) => {
                // without a record we cannot bound reloads
                error!(error = %e, "cannot read last auto-refresh timestamp");
                return Ok(ReloadDecision::ManualRetry);
            }
        };

        let cooldown_ms = self.cooldown.as_millis() as u64;
        if last.is_some_and(|last| now_ms.saturating_sub(last) < cooldown_ms) {
            warn!(error = %err, "module load failed again within cooldown, asking for manual retry");
            return Ok(ReloadDecision::ManualRetry);
        }

        if let Err(e) = self.store.set(LAST_AUTO_REFRESH_KEY, &now_ms.to_string()) {
            error!(error = %e, "cannot record auto-refresh timestamp");
            return Ok(ReloadDecision::ManualRetry);
        }

        warn!(error = %err, "module load failed, reloading once");
        Ok(ReloadDecision::Reload)
    }

    /// Forget the last attempt, e.g. after a successful manual retry.
    pub fn reset(&self) -> Result<()> {
        self.store.remove(LAST_AUTO_REFRESH_KEY).map(|_| ())
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
