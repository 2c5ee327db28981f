// shared/src/lib.rs
use std::time::Duration;

/// Errors crossing the sync layer. `Clone` so one settled result can be
/// handed to every waiter of a deduplicated request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("backend unreachable: {0}")]
    TransientNetwork(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("module load failed: {0}")]
    ModuleLoad(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a caller is expected to react to an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Assume the permissive outcome and try again on the next cycle.
    FailOpen,
    /// Duplicate write against a unique key; the row is already there.
    TreatAsSuccess,
    /// Show a localized message and abort, no retry.
    Surface,
    /// One automatic reload per cooldown window, then manual retry.
    ReloadOnce,
}

impl Error {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            Error::TransientNetwork(_) | Error::Timeout(_) => ErrorPolicy::FailOpen,
            Error::Conflict(_) => ErrorPolicy::TreatAsSuccess,
            Error::ModuleLoad(_) => ErrorPolicy::ReloadOnce,
            Error::Auth(_) | Error::NotFound | Error::InvalidQuery(_) | Error::Internal(_) => {
                ErrorPolicy::Surface
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Text shown to the user, in Georgian. `None` for errors that never
    /// reach the user.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Error::Conflict(_) => None,
            Error::Auth(_) => Some("ავტორიზაცია ვერ მოხერხდა. გთხოვთ, თავიდან შეხვიდეთ სისტემაში."),
            Error::TransientNetwork(_) | Error::Timeout(_) => {
                Some("კავშირის პრობლემა. სცადეთ მოგვიანებით.")
            }
            Error::ModuleLoad(_) => Some("გვერდის ჩატვირთვა ვერ მოხერხდა. სცადეთ ხელახლა."),
            Error::NotFound => Some("მონაცემები ვერ მოიძებნა."),
            Error::InvalidQuery(_) | Error::Internal(_) => Some("დაფიქსირდა შეცდომა."),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlMs(pub u64);

impl TtlMs {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Duration> for TtlMs {
    fn from(d: Duration) -> Self {
        TtlMs(d.as_millis() as u64)
    }
}

pub mod config;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies() {
        assert_eq!(Error::TransientNetwork("down".into()).policy(), ErrorPolicy::FailOpen);
        assert_eq!(Error::Timeout(Duration::from_secs(5)).policy(), ErrorPolicy::FailOpen);
        assert_eq!(Error::Conflict("dup".into()).policy(), ErrorPolicy::TreatAsSuccess);
        assert_eq!(Error::Auth("no token".into()).policy(), ErrorPolicy::Surface);
        assert_eq!(Error::ModuleLoad("chunk".into()).policy(), ErrorPolicy::ReloadOnce);
    }

    #[test]
    fn test_conflict_has_no_user_message() {
        assert!(Error::Conflict("dup".into()).user_message().is_none());
        assert!(Error::Auth("x".into()).user_message().is_some());
    }

    #[test]
    fn test_ttl_ms_duration() {
        assert_eq!(TtlMs(1500).as_duration(), Duration::from_millis(1500));
        assert_eq!(TtlMs::from(Duration::from_secs(2)), TtlMs(2000));
    }
}
