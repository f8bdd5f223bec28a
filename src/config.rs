//! Engine-wide configuration.

/// Configuration for a single [`crate::manager::SyncManager`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a tombstone is retained before [`crate::manager::SyncManager::prune_tombstones`]
    /// deletes it, in milliseconds of wall-clock age.
    pub tombstone_ttl_millis: u64,
    /// Whether a column write with an HLC older than a tombstone's HLC is
    /// still blocked (`false`, the default) or allowed to resurrect the row
    /// (`true`).
    pub allow_resurrection: bool,
    /// Maximum number of data changes per changeset emitted by
    /// [`crate::manager::SyncManager::get_changes_since`].
    pub batch_size: usize,
    /// Maximum allowed forward clock skew (in milliseconds) tolerated when
    /// receiving a remote HLC before [`crate::error::SyncError::ClockSkew`] is raised.
    pub max_clock_drift_millis: u64,
    /// Maximum column-version entries per `columnVersions` chunk during
    /// snapshot emission.
    pub snapshot_chunk_size: usize,
    /// How many accumulated rows ingestion flushes to the host's
    /// `applyToStore` at once, and how often it writes a resume checkpoint.
    pub snapshot_flush_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            // 24 hours: long enough that a replica offline for a day can still
            // delta-sync instead of falling back to a full snapshot.
            tombstone_ttl_millis: 24 * 60 * 60 * 1000,
            allow_resurrection: false,
            batch_size: 500,
            // A fixed one-minute bound on tolerated forward clock skew.
            max_clock_drift_millis: 60_000,
            snapshot_chunk_size: 1000,
            snapshot_flush_size: 500,
        }
    }
}
