//! Byte-ordered key encoding: primary-key tuples and the metadata
//! key-space's prefixes, built so two different logical keys never collide
//! and a `[gte, lt)` scan over a prefix visits exactly the intended entries.
//!
//! [`prefix_upper_bound`] computes the exclusive upper bound of a prefix
//! scan by incrementing the last byte with carry.

use crate::hlc::{Hlc, HLC_BYTE_LEN};
use crate::site::SiteId;
use crate::value::Value;

pub const COLUMN_VERSION_PREFIX: &[u8] = b"cv:";
pub const TOMBSTONE_PREFIX: &[u8] = b"tb:";
pub const SCHEMA_VERSION_PREFIX: &[u8] = b"sv:";
pub const SCHEMA_MIGRATION_PREFIX: &[u8] = b"sm:";
pub const CHANGE_LOG_PREFIX: &[u8] = b"cl:";
pub const PEER_STATE_PREFIX: &[u8] = b"ps:";
pub const SNAPSHOT_CHECKPOINT_PREFIX: &[u8] = b"sc:";
pub const HLC_STATE_KEY: &[u8] = b"meta:hlc_state";
pub const SITE_ID_KEY: &[u8] = b"meta:site_id";

/// Marks which kind of change a change-log entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeLogKind {
    Column = 0x01,
    Deletion = 0x02,
}

// --- Value / PK encoding ------------------------------------------------

/// Encodes one typed value so that byte order matches the value's natural
/// sort order, and the encoding is self-delimiting (a 1-byte type tag plus
/// either a fixed-width payload or an escaped, terminated variable-width
/// payload) so it can be concatenated with further components without
/// ambiguity.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    out.push(value.type_tag());
    match value {
        Value::Null => {}
        Value::Integer(i) => {
            // Sign-bit flip: maps i64's signed order onto u64's unsigned
            // byte order.
            let flipped = (*i as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        Value::Timestamp(millis) => {
            let flipped = (*millis as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        Value::Real(f) => {
            out.extend_from_slice(&encode_f64_ordered(*f));
        }
        Value::Boolean(b) => {
            out.push(if *b { 1 } else { 0 });
        }
        Value::Uuid(u) => {
            out.extend_from_slice(u.as_bytes());
        }
        Value::Text(s) => {
            escape_segment(s.as_bytes(), out);
        }
        Value::Blob(b) => {
            escape_segment(b, out);
        }
        Value::Decimal(d) => {
            // Canonical string form sorts correctly for values sharing scale
            // and sign; full total ordering across arbitrary scales would
            // need a digit-normalized encoding, which this engine does not
            // need (decimals are never used as sort keys across replicas,
            // only carried as opaque column values compared for equality).
            escape_segment(d.normalize().to_string().as_bytes(), out);
        }
    }
}

/// Maps an `f64` onto a `u64` such that the unsigned byte order of the
/// result matches the IEEE-754 total order of the floats (NaNs aside, which
/// this engine never stores as PK/column sort keys).
fn encode_f64_ordered(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let mapped = if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    };
    mapped.to_be_bytes()
}

/// Escapes `0x00` bytes as `0x00 0xFF` and appends a `0x00 0x00` terminator,
/// so a variable-length segment can be concatenated with further key
/// components while preserving lexicographic order of its own content and
/// remaining unambiguous about where it ends.
fn escape_segment(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Encodes a primary-key tuple: the concatenation of each component's
/// self-delimiting encoding, in column order. Total and injective.
pub fn encode_pk(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 9);
    for v in values {
        encode_value(v, &mut out);
    }
    out
}

/// Appends an escaped, terminated name segment (schema/table/column names),
/// using the same escaping scheme as variable-length PK components.
fn push_name(name: &str, out: &mut Vec<u8>) {
    escape_segment(name.as_bytes(), out);
}

// --- Metadata key builders ----------------------------------------------

pub fn column_version_key(schema: &str, table: &str, pk: &[u8], column: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(COLUMN_VERSION_PREFIX.len() + pk.len() + 64);
    out.extend_from_slice(COLUMN_VERSION_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out.extend_from_slice(pk);
    push_name(column, &mut out);
    out
}

pub fn column_version_table_prefix(schema: &str, table: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(COLUMN_VERSION_PREFIX.len() + 64);
    out.extend_from_slice(COLUMN_VERSION_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out
}

pub fn tombstone_key(schema: &str, table: &str, pk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TOMBSTONE_PREFIX.len() + pk.len() + 64);
    out.extend_from_slice(TOMBSTONE_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out.extend_from_slice(pk);
    out
}

pub fn tombstone_table_prefix(schema: &str, table: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(TOMBSTONE_PREFIX.len() + 64);
    out.extend_from_slice(TOMBSTONE_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out
}

/// Column-or-table marker for a schema-version key: `Some(column)` for a
/// column entry, `None` for the `__table__` marker.
pub fn schema_version_key(schema: &str, table: &str, column: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(SCHEMA_VERSION_PREFIX.len() + 64);
    out.extend_from_slice(SCHEMA_VERSION_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    push_name(column.unwrap_or("__table__"), &mut out);
    out
}

pub fn schema_migration_key(schema: &str, table: &str, schema_version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SCHEMA_MIGRATION_PREFIX.len() + 64);
    out.extend_from_slice(SCHEMA_MIGRATION_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out.extend_from_slice(&schema_version.to_be_bytes());
    out
}

pub fn schema_migration_table_prefix(schema: &str, table: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(SCHEMA_MIGRATION_PREFIX.len() + 64);
    out.extend_from_slice(SCHEMA_MIGRATION_PREFIX);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out
}

/// The `schema || table || pk || column?` portion shared by a
/// column-version (or tombstone) key and the change-log entry that points at
/// it, so the two can be built from the same bytes without re-escaping names.
pub fn change_log_target_suffix(
    schema: &str,
    table: &str,
    pk: &[u8],
    column: Option<&str>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(pk.len() + 64);
    push_name(schema, &mut out);
    push_name(table, &mut out);
    out.extend_from_slice(pk);
    if let Some(c) = column {
        push_name(c, &mut out);
    }
    out
}

/// `hlc-bytes || kind || schema || table || pk || column?`
pub fn change_log_key(
    hlc: &Hlc,
    kind: ChangeLogKind,
    schema: &str,
    table: &str,
    pk: &[u8],
    column: Option<&str>,
) -> Vec<u8> {
    let suffix = change_log_target_suffix(schema, table, pk, column);
    change_log_key_from_suffix(hlc, kind, &suffix)
}

/// Builds a change-log key from an already-encoded `schema || table || pk ||
/// column?` suffix, e.g. one recovered verbatim from a scanned
/// column-version key (`key[COLUMN_VERSION_PREFIX.len()..]` is exactly this
/// suffix for a `Column` entry), so a row-delete sweep never needs to
/// re-escape a column name it already has the encoded bytes for.
pub fn change_log_key_from_suffix(hlc: &Hlc, kind: ChangeLogKind, suffix: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(CHANGE_LOG_PREFIX.len() + HLC_BYTE_LEN + 1 + suffix.len());
    out.extend_from_slice(CHANGE_LOG_PREFIX);
    out.extend_from_slice(&hlc.to_bytes());
    out.push(kind as u8);
    out.extend_from_slice(suffix);
    out
}

/// Lower bound (inclusive) for scanning the change log from `lower_hlc`
/// exclusive, i.e. `lower_hlc + epsilon`: the smallest key strictly after
/// every entry at exactly `lower_hlc`.
pub fn change_log_scan_from_exclusive(lower_hlc: &Hlc) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHANGE_LOG_PREFIX.len() + HLC_BYTE_LEN + 1);
    out.extend_from_slice(CHANGE_LOG_PREFIX);
    out.extend_from_slice(&hlc_bytes_plus_epsilon(lower_hlc));
    out
}

/// Smallest byte string greater than `hlc`'s 26-byte encoding.
fn hlc_bytes_plus_epsilon(hlc: &Hlc) -> Vec<u8> {
    let mut bytes = hlc.to_bytes().to_vec();
    bytes.push(0x00);
    bytes
}

pub fn peer_state_key(peer_site_id: SiteId) -> Vec<u8> {
    let mut out = Vec::with_capacity(PEER_STATE_PREFIX.len() + SiteId::BYTE_LEN);
    out.extend_from_slice(PEER_STATE_PREFIX);
    out.extend_from_slice(&peer_site_id.to_bytes());
    out
}

pub fn snapshot_checkpoint_key(snapshot_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(SNAPSHOT_CHECKPOINT_PREFIX.len() + 64);
    out.extend_from_slice(SNAPSHOT_CHECKPOINT_PREFIX);
    push_name(snapshot_id, &mut out);
    out
}

/// Computes the exclusive upper bound of a `[prefix, upper)` range scan by
/// incrementing the prefix's last byte with carry, dropping trailing 0xFF
/// bytes that would otherwise overflow. Returns `None` if the prefix is all
/// `0xFF` (meaning the scan is unbounded above).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] != 0xFF {
            out[i] += 1;
            out.truncate(i + 1);
            return Some(out);
        }
    }
    None
}
