//! Tombstone store: one `{hlc, createdAt}` per deleted `(schema, table, pk)`,
//! keyed under `tb:`, that blocks stale writes from resurrecting a row.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;
use crate::keys::{self};
use crate::kv::{store_error, KeyRange, KvBatch, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub hlc: Hlc,
    /// Wall-clock creation time in milliseconds since the Unix epoch, used
    /// only by pruning — never compared against an incoming HLC, which is
    /// the only thing that decides blocking.
    pub created_at_millis: u64,
}

impl Tombstone {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::corrupt(b"", e.to_string()))
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }
}

/// The on-disk record: a [`Tombstone`] plus the `pk` it belongs to,
/// duplicated from the key so [`TombstoneStore::scan_table`] can recover it
/// without a key decoder, the same reasoning as
/// `column_version::StoredColumnVersion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTombstone {
    hlc: Hlc,
    created_at_millis: u64,
    pk: Vec<u8>,
}

impl StoredTombstone {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::corrupt(b"", e.to_string()))
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }
}

pub struct TombstoneStore {
    kv: Arc<dyn KvStore>,
}

impl TombstoneStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        TombstoneStore { kv }
    }

    pub async fn get(&self, schema: &str, table: &str, pk: &[u8]) -> Result<Option<Tombstone>> {
        let key = keys::tombstone_key(schema, table, pk);
        match self.kv.get(&key).await? {
            Some(bytes) => {
                let stored = StoredTombstone::from_bytes(&key, &bytes)?;
                Ok(Some(Tombstone {
                    hlc: stored.hlc,
                    created_at_millis: stored.created_at_millis,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn put_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        schema: &str,
        table: &str,
        pk: &[u8],
        tombstone: &Tombstone,
    ) -> Result<()> {
        let key = keys::tombstone_key(schema, table, pk);
        let stored = StoredTombstone {
            hlc: tombstone.hlc,
            created_at_millis: tombstone.created_at_millis,
            pk: pk.to_vec(),
        };
        batch.put(key, stored.to_bytes()?);
        Ok(())
    }

    pub fn delete_in_batch(&self, batch: &mut dyn KvBatch, schema: &str, table: &str, pk: &[u8]) {
        batch.delete(keys::tombstone_key(schema, table, pk));
    }

    /// True iff a tombstone exists that should block `incoming_hlc` from
    /// being applied.
    ///
    /// - If no tombstone exists, never blocks.
    /// - If the tombstone's HLC is `>= incoming_hlc`, always blocks: the
    ///   delete happened-after (or concurrently with, LWW-tiebroken ahead
    ///   of) the incoming write.
    /// - Otherwise (tombstone strictly older than the incoming write), it
    ///   blocks only when `allow_resurrection` is false — i.e. by default a
    ///   deleted row stays deleted even against a causally later write,
    ///   unless the host opts into resurrection.
    pub async fn is_deleted_and_blocking(
        &self,
        schema: &str,
        table: &str,
        pk: &[u8],
        incoming_hlc: &Hlc,
        allow_resurrection: bool,
    ) -> Result<bool> {
        match self.get(schema, table, pk).await? {
            None => Ok(false),
            Some(tombstone) => {
                if tombstone.hlc >= *incoming_hlc {
                    Ok(true)
                } else {
                    Ok(!allow_resurrection)
                }
            }
        }
    }

    /// Scans every tombstone, used by pruning to find entries older than
    /// the configured TTL.
    pub async fn scan_all(&self) -> Result<Vec<(Vec<u8>, Tombstone)>> {
        let rows = self
            .kv
            .iterate(KeyRange::prefix(keys::TOMBSTONE_PREFIX))
            .await
            .map_err(store_error)?;
        rows.into_iter()
            .map(|(key, bytes)| {
                let stored = StoredTombstone::from_bytes(&key, &bytes)?;
                Ok((
                    key,
                    Tombstone {
                        hlc: stored.hlc,
                        created_at_millis: stored.created_at_millis,
                    },
                ))
            })
            .collect()
    }

    /// Scans every tombstone for one `(schema, table)`, recovering the `pk`
    /// each belongs to without a key decoder — used by the recovery-path
    /// full scan in `getChangesSince`.
    pub async fn scan_table(&self, schema: &str, table: &str) -> Result<Vec<(Vec<u8>, Tombstone)>> {
        let prefix = keys::tombstone_table_prefix(schema, table);
        let rows = self
            .kv
            .iterate(KeyRange::prefix(&prefix))
            .await
            .map_err(store_error)?;
        rows.into_iter()
            .map(|(key, bytes)| {
                let stored = StoredTombstone::from_bytes(&key, &bytes)?;
                Ok((
                    stored.pk.clone(),
                    Tombstone {
                        hlc: stored.hlc,
                        created_at_millis: stored.created_at_millis,
                    },
                ))
            })
            .collect()
    }
}
