pub mod memory_backend;
pub mod sled_kv;

pub use memory_backend::MemoryBackend;
pub use sled_kv::SledKeyValueStore;
