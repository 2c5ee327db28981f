pub mod deadline;
pub mod deferred;
pub mod privileged;
pub mod probes;
pub mod reload_guard;
pub mod status_checker;
pub mod subscriptions;

pub use deadline::{Raced, race_deadline};
pub use deferred::{DeferredInitializer, DeferredTask, Liveness};
pub use privileged::PrivilegedCalls;
pub use probes::{ApprovalProbe, BanProbe};
pub use reload_guard::{ReloadDecision, ReloadGuard};
pub use status_checker::{CheckerConfig, CheckerState, CheckerStatus, StatusChecker};
pub use subscriptions::{BatchSubscription, SubscriptionConfig, SubscriptionManager};
