//! Column-version store: one live `{hlc, value}` per `(schema, table, pk,
//! column)`, keyed under `cv:`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;
use crate::keys;
use crate::kv::{store_error, KeyRange, KvBatch, KvStore};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnVersion {
    pub hlc: Hlc,
    pub value: Value,
}

/// The on-disk record: a [`ColumnVersion`] plus the `pk`/`column` it belongs
/// to, duplicated from the key into the value so a table-wide scan can
/// recover them without a key decoder — the key codec is intentionally
/// write-only (decoding is never needed for metadata operations).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredColumnVersion {
    hlc: Hlc,
    value: Value,
    pk: Vec<u8>,
    column: String,
}

impl StoredColumnVersion {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::corrupt(b"", e.to_string()))
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }
}

/// One resolved entry from a table-wide column-version scan.
#[derive(Debug, Clone)]
pub struct ColumnVersionEntry {
    pub pk: Vec<u8>,
    pub column: String,
    pub version: ColumnVersion,
}

pub struct ColumnVersionStore {
    kv: Arc<dyn KvStore>,
}

impl ColumnVersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        ColumnVersionStore { kv }
    }

    pub async fn get(
        &self,
        schema: &str,
        table: &str,
        pk: &[u8],
        column: &str,
    ) -> Result<Option<ColumnVersion>> {
        let key = keys::column_version_key(schema, table, pk, column);
        match self.kv.get(&key).await? {
            Some(bytes) => {
                let stored = StoredColumnVersion::from_bytes(&key, &bytes)?;
                Ok(Some(ColumnVersion {
                    hlc: stored.hlc,
                    value: stored.value,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn put(
        &self,
        schema: &str,
        table: &str,
        pk: &[u8],
        column: &str,
        version: &ColumnVersion,
    ) -> Result<()> {
        let key = keys::column_version_key(schema, table, pk, column);
        let stored = StoredColumnVersion {
            hlc: version.hlc,
            value: version.value.clone(),
            pk: pk.to_vec(),
            column: column.to_string(),
        };
        self.kv.put(&key, &stored.to_bytes()?).await
    }

    pub fn put_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        schema: &str,
        table: &str,
        pk: &[u8],
        column: &str,
        version: &ColumnVersion,
    ) -> Result<()> {
        let key = keys::column_version_key(schema, table, pk, column);
        let stored = StoredColumnVersion {
            hlc: version.hlc,
            value: version.value.clone(),
            pk: pk.to_vec(),
            column: column.to_string(),
        };
        batch.put(key, stored.to_bytes()?);
        Ok(())
    }

    pub fn delete_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        schema: &str,
        table: &str,
        pk: &[u8],
        column: &str,
    ) {
        batch.delete(keys::column_version_key(schema, table, pk, column));
    }

    /// `shouldApplyWrite`: true iff no existing version exists, or the
    /// incoming HLC is strictly greater than the existing one.
    pub async fn should_apply_write(
        &self,
        schema: &str,
        table: &str,
        pk: &[u8],
        column: &str,
        incoming_hlc: &Hlc,
    ) -> Result<bool> {
        match self.get(schema, table, pk, column).await? {
            Some(existing) => Ok(*incoming_hlc > existing.hlc),
            None => Ok(true),
        }
    }

    /// Scans every live column version for one `(schema, table)`, used by
    /// the recovery-path full scan in `getChangesSince` and by snapshot
    /// emission.
    pub async fn scan_table(&self, schema: &str, table: &str) -> Result<Vec<ColumnVersionEntry>> {
        let prefix = keys::column_version_table_prefix(schema, table);
        let rows = self
            .kv
            .iterate(KeyRange::prefix(&prefix))
            .await
            .map_err(store_error)?;
        rows.into_iter()
            .map(|(key, bytes)| {
                let stored = StoredColumnVersion::from_bytes(&key, &bytes)?;
                Ok(ColumnVersionEntry {
                    pk: stored.pk,
                    column: stored.column,
                    version: ColumnVersion {
                        hlc: stored.hlc,
                        value: stored.value,
                    },
                })
            })
            .collect()
    }

    /// Deletes every live column version for a given `(schema, table, pk)`,
    /// as Phase 3 of the apply pipeline does for an applied row delete.
    ///
    /// Returns, for each removed column, the HLC it was written at and the
    /// `change_log_target_suffix`-shaped bytes (`key[COLUMN_VERSION_PREFIX
    /// .len()..]`) needed to retire its change-log entry — the caller (the
    /// change log) reuses these verbatim via
    /// [`keys::change_log_key_from_suffix`] instead of re-escaping the
    /// column name.
    pub async fn delete_row_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        schema: &str,
        table: &str,
        pk: &[u8],
    ) -> Result<Vec<(Hlc, Vec<u8>)>> {
        let row_prefix = {
            let mut p = keys::column_version_table_prefix(schema, table);
            p.extend_from_slice(pk);
            p
        };
        let rows = self
            .kv
            .iterate(KeyRange::prefix(&row_prefix))
            .await
            .map_err(store_error)?;
        let mut removed = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            let stored = StoredColumnVersion::from_bytes(&key, &bytes)?;
            let suffix = key[keys::COLUMN_VERSION_PREFIX.len()..].to_vec();
            batch.delete(key);
            removed.push((stored.hlc, suffix));
        }
        Ok(removed)
    }
}
