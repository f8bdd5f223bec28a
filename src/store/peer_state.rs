//! Peer-state store: per-peer sync watermark, keyed under `ps:`, read by
//! `canDeltaSync` and advanced after every successful delta pull.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;
use crate::keys;
use crate::kv::{KvBatch, KvStore};
use crate::site::SiteId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub last_sync_hlc: Hlc,
    /// Wall-clock time of the last successful sync with this peer, in
    /// milliseconds since the Unix epoch; advisory only, never compared
    /// against an HLC.
    pub last_sync_time_millis: u64,
}

impl PeerState {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::corrupt(b"", e.to_string()))
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }
}

pub struct PeerStateStore {
    kv: Arc<dyn KvStore>,
}

impl PeerStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        PeerStateStore { kv }
    }

    /// Returns `None` for a peer this replica has never completed a sync
    /// with, which `canDeltaSync` treats as "must snapshot".
    pub async fn get(&self, peer_site_id: SiteId) -> Result<Option<PeerState>> {
        let key = keys::peer_state_key(peer_site_id);
        match self.kv.get(&key).await? {
            Some(bytes) => Ok(Some(PeerState::from_bytes(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, peer_site_id: SiteId, state: &PeerState) -> Result<()> {
        let key = keys::peer_state_key(peer_site_id);
        self.kv.put(&key, &state.to_bytes()?).await
    }

    pub fn put_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        peer_site_id: SiteId,
        state: &PeerState,
    ) -> Result<()> {
        let key = keys::peer_state_key(peer_site_id);
        batch.put(key, state.to_bytes()?);
        Ok(())
    }
}
