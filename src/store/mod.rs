//! Typed wrappers over the raw [`crate::kv::KvStore`], each owning one key
//! prefix and its serialization format.

pub mod column_version;
pub mod peer_state;
pub mod schema_version;
pub mod tombstone;

pub use column_version::{ColumnVersion, ColumnVersionStore};
pub use peer_state::{PeerState, PeerStateStore};
pub use schema_version::{SchemaVersion, SchemaVersionKind, SchemaVersionStore};
pub use tombstone::{Tombstone, TombstoneStore};
