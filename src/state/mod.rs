//! State management module for the Keel deployment engine.
//!
//! This module provides durable storage for deployed resources: a JSON
//! snapshot, a write-ahead log for the running session, and a lock file that
//! serializes sessions across processes.

mod lock;
mod store;
mod types;
mod wal;

pub use lock::{LOCK_EXPIRY_SECS, LockInfo, StateLock, generate_holder_id};
pub use store::StateStore;
pub use types::{
    CLI_VERSION, Database, DependsOnEntry, ExportedResource, ExportedState, ResourceEntry,
    STATE_VERSION, WalEntry, WalHeader, split_key,
};
pub use wal::{quarantine_path, wal_path};
