//! Typed error surface for the sync engine.
//!
//! Internal plumbing threads `anyhow::Result` through fallible steps (matching
//! how the rest of this crate's call chains are built), but every operation
//! the engine exposes publicly returns a [`SyncError`] so callers can match on
//! failure kind without downcasting.

use thiserror::Error;

use crate::hlc::Hlc;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote HLC's wall time exceeded local physical time by more than the
    /// configured max skew. No state was mutated.
    #[error("clock skew: remote wall time {remote_wall_time} exceeds local time by more than {max_drift_millis}ms")]
    ClockSkew {
        remote_wall_time: u64,
        max_drift_millis: u64,
    },

    /// The HLC counter would overflow `u16::MAX` within the current
    /// millisecond.
    #[error("HLC counter overflow at wall time {wall_time}")]
    CounterOverflow { wall_time: u64 },

    /// A stored metadata value failed length or structure validation.
    #[error("corrupt metadata at key {key_hex}: {reason}")]
    CorruptMetadata { key_hex: String, reason: String },

    /// A required lookup (e.g. a persisted site identity) found nothing.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The host's `applyToStore` callback returned an error. Phase 1 (resolve)
    /// already ran with no metadata writes, so local metadata is unchanged and
    /// a retry with the same changesets is safe.
    #[error("apply callback failed: {0}")]
    ApplyCallbackFailed(#[source] anyhow::Error),

    /// Passthrough from the host-provided `KvStore` implementation.
    #[error("store error: {0}")]
    StoreError(#[source] anyhow::Error),

    /// A PK-missing or otherwise malformed data-change event from the host.
    #[error("invalid change event: {0}")]
    InvalidEvent(String),
}

impl SyncError {
    pub fn clock_skew(remote: &Hlc, max_drift_millis: u64) -> Self {
        SyncError::ClockSkew {
            remote_wall_time: remote.wall_time,
            max_drift_millis,
        }
    }

    pub fn corrupt(key: &[u8], reason: impl Into<String>) -> Self {
        SyncError::CorruptMetadata {
            key_hex: hex::encode(key),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
