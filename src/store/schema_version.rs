//! Schema-version store: one `{hlc, kind, ...}` per `(schema, table,
//! column?)`, keyed under `sv:`, resolved destructive-writes-win rather than
//! last-writer-wins.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;
use crate::keys;
use crate::kv::{KvBatch, KvStore};

/// The kind of schema change a [`SchemaVersion`] records. Ranked by
/// "destructiveness" for conflict resolution: a table drop outranks a
/// column drop, which outranks a plain column/table create-or-alter, no
/// matter which HLC is later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersionKind {
    /// A column exists with some affinity/nullability/default.
    Column,
    /// The column named by this entry's key has been dropped.
    ColumnDropped,
    /// The whole table has been dropped.
    TableDropped,
}

impl SchemaVersionKind {
    /// Higher rank wins; on a rank tie the later HLC wins ("destructive
    /// wins").
    fn rank(self) -> u8 {
        match self {
            SchemaVersionKind::Column => 0,
            SchemaVersionKind::ColumnDropped => 1,
            SchemaVersionKind::TableDropped => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub hlc: Hlc,
    pub kind: SchemaVersionKind,
    /// Only meaningful when `kind == Column`: the storage affinity name
    /// (e.g. `"INTEGER"`, `"TEXT"`), left as an opaque string since this
    /// engine has no opinion on a host's type system.
    pub affinity: Option<String>,
    pub nullable: Option<bool>,
    pub default_expr: Option<String>,
    /// Free-form DDL text the host may want to replay verbatim.
    pub ddl: Option<String>,
}

impl SchemaVersion {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::corrupt(b"", e.to_string()))
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }

    /// True iff `self` should win over `existing`: a strictly higher
    /// destructiveness rank wins outright; a rank tie falls back to the
    /// higher HLC.
    fn wins_over(&self, existing: &SchemaVersion) -> bool {
        match self.kind.rank().cmp(&existing.kind.rank()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.hlc > existing.hlc,
        }
    }
}

pub struct SchemaVersionStore {
    kv: Arc<dyn KvStore>,
}

impl SchemaVersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        SchemaVersionStore { kv }
    }

    pub async fn get(
        &self,
        schema: &str,
        table: &str,
        column: Option<&str>,
    ) -> Result<Option<SchemaVersion>> {
        let key = keys::schema_version_key(schema, table, column);
        match self.kv.get(&key).await? {
            Some(bytes) => Ok(Some(SchemaVersion::from_bytes(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Merges an incoming schema-version entry against whatever is already
    /// stored, writing it to `batch` only if it wins. Returns whether the
    /// write was applied, mirroring `shouldApplyWrite`'s boolean contract
    /// elsewhere in the store layer.
    pub async fn merge_in_batch(
        &self,
        batch: &mut dyn KvBatch,
        schema: &str,
        table: &str,
        column: Option<&str>,
        incoming: &SchemaVersion,
    ) -> Result<bool> {
        let existing = self.get(schema, table, column).await?;
        let applies = match &existing {
            None => true,
            Some(existing) => incoming.wins_over(existing),
        };
        if applies {
            let key = keys::schema_version_key(schema, table, column);
            batch.put(key, incoming.to_bytes()?);
        }
        Ok(applies)
    }
}
