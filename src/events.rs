//! Event fan-out: `localChange`, `remoteChange`, `conflictResolved`, and
//! `syncStateChange` notifications, broadcast to any number of subscribers.
//!
//! Notifications go out over a `tokio::sync::broadcast` channel rather than
//! a callback list, since the manager has no opinion on how many listeners
//! exist or whether they keep up.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::hlc::Hlc;
use crate::protocol::{Change, SchemaMigration};
use crate::site::SiteId;

/// Sync-state lifecycle: transitions are driven by host operations except
/// `Syncing -> Synced`, which the engine itself emits on snapshot-stream
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Disconnected,
    Connecting,
    /// `progress` is a fraction in `[0.0, 1.0]`.
    Syncing { progress: f32 },
    Synced,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalChangeEvent {
    pub schema: String,
    pub table: String,
    pub changes: Vec<Change>,
    pub schema_migrations: Vec<SchemaMigration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChangeEvent {
    pub origin_site_id: SiteId,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolvedEvent {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub winner_hlc: Hlc,
    /// Always `true` today: the resolve phase only detects conflicts the
    /// local version wins — a losing local write never reaches resolution
    /// at all, since it would not have been staged locally.
    pub local_won: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    LocalChange(LocalChangeEvent),
    RemoteChange(RemoteChangeEvent),
    ConflictResolved(ConflictResolvedEvent),
    SyncStateChange(SyncState),
}

/// Fan-out point for [`SyncEvent`]s. Cloning an `EventEmitter` shares the
/// same underlying channel, mirroring `broadcast::Sender`'s own `Clone`
/// semantics: every clone is just another handle to publish on.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventEmitter {
    /// `capacity` bounds how many not-yet-received events a lagging
    /// subscriber may fall behind by before it starts missing events (see
    /// `broadcast::Receiver::recv`'s `Lagged` error).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventEmitter { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Returns the number of subscribers it reached; a
    /// send with zero subscribers is not an error (nobody is listening yet).
    pub fn emit(&self, event: SyncEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        // 128 gives a lagging subscriber room before it starts missing events.
        EventEmitter::new(128)
    }
}
