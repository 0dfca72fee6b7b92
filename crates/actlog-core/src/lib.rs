//! Storage and ingestion core for actlog.
//!
//! - [`Store`]: the single-writer embedded store with atomic flushes.
//! - [`QueueWriter`] / [`Consumer`]: the cross-process queue producers append
//!   to and the server drains.
//! - [`ConsultationGate`]: the TTL permit checked before protected tools run.

mod cache;
mod consumer;
mod error;
pub mod fsutil;
mod gate;
mod queue;
mod store;

pub use cache::{CacheCounters, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use consumer::{entry_to_hook, entry_to_transaction, fallback_id, Consumer, DrainReport};
pub use error::ActlogError;
pub use gate::{
    ConsultationGate, ConsultationRequired, Decision, GateMarker, RequiredCall, DEFAULT_GATE_TTL,
    DEFAULT_PROTECTED_TOOLS,
};
pub use queue::{
    claim_path, parse_lines, queue_path, ParsedQueue, QueueLine, QueueWriter,
    DEFAULT_MAX_ENTRY_BYTES, DEFAULT_MAX_QUEUE_BYTES,
};
pub use store::{quarantine_corrupt, Store, StoreOptions, StoreStats};

/// Result type for actlog operations.
pub type Result<T> = std::result::Result<T, ActlogError>;
