//! Wire types exchanged between replicas. Transport-agnostic:
//! this module only defines the shapes; serialization format (JSON,
//! MessagePack, ...) and the transport itself are the host's choice — the
//! engine only requires that HLCs round-trip as 26 bytes, site IDs as 16
//! bytes, and PK tuples round-trip through the key codec, all of which hold
//! for any `serde` format applied to these types.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::site::SiteId;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnChange {
    pub schema: String,
    pub table: String,
    pub pk: Vec<u8>,
    pub column: String,
    pub value: Value,
    pub hlc: Hlc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowDeletion {
    pub schema: String,
    pub table: String,
    pub pk: Vec<u8>,
    pub hlc: Hlc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    Column(ColumnChange),
    Delete(RowDeletion),
}

impl Change {
    pub fn hlc(&self) -> Hlc {
        match self {
            Change::Column(c) => c.hlc,
            Change::Delete(d) => d.hlc,
        }
    }

    pub fn schema(&self) -> &str {
        match self {
            Change::Column(c) => &c.schema,
            Change::Delete(d) => &d.schema,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Change::Column(c) => &c.table,
            Change::Delete(d) => &d.table,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMigrationKind {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AddIndex,
    DropIndex,
    AlterColumn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMigration {
    pub kind: SchemaMigrationKind,
    pub schema: String,
    pub table: String,
    pub ddl: String,
    pub hlc: Hlc,
    pub schema_version: u64,
}

/// A group of changes sharing one originating transaction, produced by
/// `getChangesSince` and consumed by the apply pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub site_id: SiteId,
    pub transaction_id: String,
    /// The max HLC among this changeset's contents.
    pub hlc: Hlc,
    pub changes: Vec<Change>,
    pub schema_migrations: Vec<SchemaMigration>,
}

/// A host-facing instruction to mutate user data, the `dataChange` half of
/// the `applyToStore` callback contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub kind: DataChangeKind,
    pub schema: String,
    pub table: String,
    pub pk: Vec<u8>,
    /// `None` for a delete; `Some` of the resolved `(column, value)` pairs to
    /// write for an insert/update.
    pub columns: Option<Vec<(String, Value)>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: SchemaMigrationKind,
    pub schema: String,
    pub table: String,
    pub ddl: String,
}

/// One chunk of a streamed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotChunk {
    Header {
        snapshot_id: String,
        site_id: SiteId,
        hlc: Hlc,
        table_count: u32,
        migration_count: u32,
    },
    TableStart {
        schema: String,
        table: String,
        estimated_entries: u64,
    },
    ColumnVersions {
        schema: String,
        table: String,
        /// `(pk, column, value, hlc)` rows, kept structured instead of
        /// string-joined as "encodedPk \":\" column", since the engine never
        /// needs the joined text form.
        entries: Vec<(Vec<u8>, String, Value, Hlc)>,
    },
    TableEnd {
        schema: String,
        table: String,
        entries_written: u64,
    },
    SchemaMigration(SchemaMigration),
    Footer {
        snapshot_id: String,
        total_tables: u32,
        total_entries: u64,
        total_migrations: u32,
    },
}

/// A checkpoint persisted during snapshot ingestion, letting
/// `resumeSnapshotStream` continue from where it left off after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCheckpoint {
    pub snapshot_id: String,
    pub site_id: SiteId,
    pub hlc: Hlc,
    pub completed_tables: Vec<(String, String)>,
    pub entries_processed: u64,
    pub created_at_millis: u64,
}
