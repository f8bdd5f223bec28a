//! The change log: a true secondary index over live metadata, ordered by
//! HLC, used to answer "what changed after `lower_hlc`" without a full
//! table scan.
//!
//! Unlike an append-only write-ahead log, an entry is deleted the instant it
//! is superseded: when column `(schema, table, pk, col)` is next written at
//! a later HLC, the old change-log entry pointing at the old HLC is removed
//! in the same batch that inserts the new one. The invariant this
//! maintains is: at any time, for every live column version or tombstone
//! there is exactly one change-log entry, keyed at that version's own HLC.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;
use crate::keys::{self, ChangeLogKind};
use crate::kv::{store_error, KeyRange, KvBatch, KvStore};

/// The identifying fields duplicated into a change-log entry's value,
/// alongside its key, so a delta query can build a wire [`Change`] from the
/// entry alone — the key codec is write-only (decoding is never needed for
/// metadata operations), so a plaintext copy of the fields the wire
/// protocol needs travels in the value instead.
///
/// [`Change`]: crate::protocol::Change
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeLogValue {
    schema: String,
    table: String,
    pk: Vec<u8>,
    column: Option<String>,
}

impl ChangeLogValue {
    fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ChangeLogValue is always serializable")
    }

    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::corrupt(key, e.to_string()))
    }
}

/// One change-log entry: which kind of change it is, the HLC it happened
/// at, the raw key suffix (reusable for retirement), and the plaintext
/// `schema`/`table`/`pk`/`column` it points at.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub hlc: Hlc,
    pub kind: ChangeLogKind,
    /// The bytes following `hlc-bytes || kind` in the raw key: reusable
    /// verbatim as a [`keys::change_log_key_from_suffix`] suffix.
    pub target_suffix: Vec<u8>,
    pub schema: String,
    pub table: String,
    pub pk: Vec<u8>,
    /// `Some` for a column change, `None` for a row deletion.
    pub column: Option<String>,
}

fn decode_entry(key: &[u8], value: &[u8]) -> Result<Option<ChangeLogEntry>> {
    let Some(rest) = key.strip_prefix(keys::CHANGE_LOG_PREFIX) else {
        return Ok(None);
    };
    if rest.len() < 27 {
        return Ok(None);
    }
    let Ok(hlc) = Hlc::from_bytes(&rest[0..26]) else {
        return Ok(None);
    };
    let kind = match rest[26] {
        0x01 => ChangeLogKind::Column,
        0x02 => ChangeLogKind::Deletion,
        _ => return Ok(None),
    };
    let decoded = ChangeLogValue::from_bytes(key, value)?;
    Ok(Some(ChangeLogEntry {
        hlc,
        kind,
        target_suffix: rest[27..].to_vec(),
        schema: decoded.schema,
        table: decoded.table,
        pk: decoded.pk,
        column: decoded.column,
    }))
}

/// Inserts a change-log entry for a column write at `hlc`, and — if an
/// older entry for the same `(schema, table, pk, column)` exists — deletes
/// it in the same batch, preserving the one-live-entry-per-target
/// invariant.
pub fn record_column_change_in_batch(
    batch: &mut dyn KvBatch,
    hlc: &Hlc,
    previous_hlc: Option<&Hlc>,
    schema: &str,
    table: &str,
    pk: &[u8],
    column: &str,
) {
    if let Some(prev) = previous_hlc {
        let suffix = keys::change_log_target_suffix(schema, table, pk, Some(column));
        batch.delete(keys::change_log_key_from_suffix(
            prev,
            ChangeLogKind::Column,
            &suffix,
        ));
    }
    let value = ChangeLogValue {
        schema: schema.to_string(),
        table: table.to_string(),
        pk: pk.to_vec(),
        column: Some(column.to_string()),
    };
    batch.put(
        keys::change_log_key(hlc, ChangeLogKind::Column, schema, table, pk, Some(column)),
        value.to_bytes(),
    );
}

/// Deletes the change-log entry for a column version removed by a row
/// delete, given the `(hlc, suffix)` pair
/// [`crate::store::ColumnVersionStore::delete_row_in_batch`] returned for
/// it.
pub fn delete_column_change_in_batch(batch: &mut dyn KvBatch, hlc: &Hlc, suffix: &[u8]) {
    batch.delete(keys::change_log_key_from_suffix(
        hlc,
        ChangeLogKind::Column,
        suffix,
    ));
}

/// Inserts a change-log entry for a row deletion's tombstone at `hlc`.
pub fn record_deletion_change_in_batch(
    batch: &mut dyn KvBatch,
    hlc: &Hlc,
    schema: &str,
    table: &str,
    pk: &[u8],
) {
    let value = ChangeLogValue {
        schema: schema.to_string(),
        table: table.to_string(),
        pk: pk.to_vec(),
        column: None,
    };
    batch.put(
        keys::change_log_key(hlc, ChangeLogKind::Deletion, schema, table, pk, None),
        value.to_bytes(),
    );
}

/// `getChangesSince`'s index scan: every change-log entry strictly after
/// `lower_hlc`, in ascending HLC order (the change log's own key order).
pub async fn changes_since(kv: &dyn KvStore, lower_hlc: &Hlc) -> Result<Vec<ChangeLogEntry>> {
    let range = KeyRange::from(
        keys::change_log_scan_from_exclusive(lower_hlc),
        keys::prefix_upper_bound(keys::CHANGE_LOG_PREFIX),
    );
    let rows = kv.iterate(range).await.map_err(store_error)?;
    let mut entries = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        if let Some(entry) = decode_entry(&key, &value)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Count of live change-log entries for one `(schema, table)`, for
/// observability accessors. The log is keyed by HLC rather than by table, so
/// this walks the whole log rather than a table-scoped key range.
pub async fn count_for_table(kv: &dyn KvStore, schema: &str, table: &str) -> Result<usize> {
    let zero = Hlc::zero(crate::site::SiteId::generate());
    let entries = changes_since(kv, &zero).await?;
    Ok(entries
        .iter()
        .filter(|e| e.schema == schema && e.table == table)
        .count())
}
