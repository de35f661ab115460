#![warn(rust_2018_idioms)]

//! Persistence for durable broker state.
//!
//! Everything at rest goes through the [`KvStore`] surface: named tables of
//! string keys to opaque values. The broker ships a process-local engine and
//! a JSON-file-backed engine; a production storage engine plugs in behind
//! the same trait.

mod kv;
mod message_store;
mod topology;

pub use kv::{FileKv, KvStore, MemoryKv, StorageError};
pub use message_store::{MessageStore, StoredMessage};
pub use topology::{StoredBinding, StoredExchange, StoredQueue, TopologyStore};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Table names for the persisted state layout.
pub mod tables {
    pub const EXCHANGES: &str = "exchanges";
    pub const QUEUES: &str = "queues";
    pub const BINDINGS: &str = "bindings";
    pub const MESSAGES: &str = "messages";
    pub const QREFS: &str = "qrefs";
}
