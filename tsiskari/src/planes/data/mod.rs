pub mod dedup;
pub mod remote_state;
pub mod ttl_store;
pub mod writes;

pub use dedup::Deduplicator;
pub use remote_state::RemoteState;
pub use ttl_store::TtlStore;
pub use writes::{WriteOutcome, insert_idempotent};
