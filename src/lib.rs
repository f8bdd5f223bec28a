//! Per-column, per-row CRDT synchronization engine over an ordered
//! key-value store.
//!
//! The engine keeps one hybrid-logical-clock-stamped version per
//! `(schema, table, primary key, column)`, resolves conflicting writes by
//! last-writer-wins, and tracks row deletions with tombstones that block
//! stale resurrections. It never touches user data directly: hosts record
//! local writes through [`manager::SyncManager::record_local_change`] and
//! apply inbound changesets through the [`manager::ApplyToStore`] callback.
//!
//! This crate implements the engine against any [`kv::KvStore`] the host
//! provides.

pub mod change_log;
pub mod config;
pub mod error;
pub mod events;
pub mod hlc;
pub mod keys;
pub mod kv;
pub mod manager;
pub mod protocol;
pub mod site;
pub mod snapshot;
pub mod store;
pub mod value;

pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use events::{EventEmitter, SyncEvent, SyncState};
pub use hlc::{Hlc, HlcClock};
pub use manager::{ApplyCallbackOutcome, ApplyResult, ApplyToStore, SyncManager, SyncManagerStats, TableStats};
pub use protocol::{Change, ChangeSet, DataChange, SchemaChange, SchemaMigration};
pub use site::SiteId;
pub use value::Value;
