// Store module — storage backends for the directory and the ledger

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
