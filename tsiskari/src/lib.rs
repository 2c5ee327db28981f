pub mod context;
pub mod domain;
pub mod events;
pub mod planes;
pub mod ports;

pub use context::SyncContext;
pub use shared::{Error, ErrorPolicy, Result};
