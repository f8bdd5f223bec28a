//! The sync manager: orchestrates local-write recording, the two-phase
//! apply pipeline, delta pull, and tombstone pruning — the component every
//! other module exists to support.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(not(test))]
use log::{debug, info, warn};
#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use crate::change_log::{self, ChangeLogEntry};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::events::{
    ConflictResolvedEvent, EventEmitter, LocalChangeEvent, RemoteChangeEvent, SyncEvent, SyncState,
};
use crate::hlc::{HlcClock, HlcClockState, PhysicalClock, SystemClock};
use crate::keys::{self, ChangeLogKind};
use crate::kv::KvStore;
use crate::protocol::{
    Change, ChangeSet, ColumnChange, DataChange, DataChangeKind, RowDeletion, SchemaChange,
    SchemaMigration, SchemaMigrationKind,
};
use crate::site::{SiteId, SiteIdentityRecord};
use crate::store::column_version::ColumnVersion;
use crate::store::schema_version::{SchemaVersion, SchemaVersionKind};
use crate::store::{ColumnVersionStore, PeerState, PeerStateStore, SchemaVersionStore, TombstoneStore};
use crate::value::Value;

/// One column's current value as the host observes it, the row-array-index
/// form `recordLocalChange` accepts before translating to stable names via
/// [`SchemaLookup`].
#[derive(Debug, Clone)]
pub struct ColumnValue {
    pub column: Option<String>,
    pub value: Value,
}

/// A local data-change event as the host reports it.
#[derive(Debug, Clone)]
pub struct LocalDataChange {
    pub kind: DataChangeKind,
    pub schema: String,
    pub table: String,
    pub pk: Vec<u8>,
    /// The row's columns after the change (insert/update); empty for a
    /// delete. Columns identical to `old_columns` at the same index are
    /// skipped when recording column versions.
    pub new_columns: Vec<ColumnValue>,
    pub old_columns: Vec<ColumnValue>,
}

/// Host callback translating a `(schema, table)` pair to its column names,
/// used to turn row-array indices into stable column identifiers. Falls
/// back to `col_<index>` when unavailable.
pub trait SchemaLookup: Send + Sync {
    fn columns_for(&self, schema: &str, table: &str) -> Option<Vec<String>>;
}

/// No-op [`SchemaLookup`]: every column falls back to `col_<index>`.
pub struct NoSchemaLookup;

impl SchemaLookup for NoSchemaLookup {
    fn columns_for(&self, _schema: &str, _table: &str) -> Option<Vec<String>> {
        None
    }
}

/// Host callback that applies resolved changes to user tables, invoked
/// during apply's Phase 2. The engine never touches user data directly;
/// this is the only side effect the apply pipeline has on table contents.
#[async_trait]
pub trait ApplyToStore: Send + Sync {
    async fn apply(
        &self,
        data_changes: &[DataChange],
        schema_changes: &[SchemaChange],
    ) -> Result<ApplyCallbackOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct ApplyCallbackOutcome {
    pub data_changes_applied: usize,
    pub schema_changes_applied: usize,
    pub errors: Vec<String>,
}

/// Outcome of one call to [`SyncManager::apply_changesets`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub transactions: usize,
}

/// Running counters surfaced for diagnostics: a read-only window onto
/// manager activity, not a correctness invariant in itself.
#[derive(Debug, Clone, Default)]
pub struct SyncManagerStats {
    pub local_changes_recorded: u64,
    pub changesets_applied: u64,
    pub tombstones_pruned: u64,
}

/// Live-entry counts for one `(schema, table)`, for host dashboards and for
/// this crate's own tests to check invariants without re-deriving them by
/// hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub live_column_versions: usize,
    pub live_tombstones: usize,
    pub change_log_entries: usize,
}

struct StagedColumn {
    column: String,
    version: ColumnVersion,
    previous_hlc: Option<crate::hlc::Hlc>,
}

struct StagedDelete {
    pk: Vec<u8>,
    hlc: crate::hlc::Hlc,
}

/// The orchestrator for one replica. Holds the HLC clock, the typed
/// metadata stores, the event emitter, and the host-provided callbacks;
/// everything else in this crate exists to be called from here.
pub struct SyncManager<C: PhysicalClock = SystemClock> {
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) clock: tokio::sync::Mutex<HlcClock<C>>,
    pub(crate) site_id: SiteId,
    pub(crate) config: EngineConfig,
    pub(crate) column_versions: ColumnVersionStore,
    pub(crate) tombstones: TombstoneStore,
    pub(crate) schema_versions: SchemaVersionStore,
    pub(crate) peer_states: PeerStateStore,
    pub(crate) events: EventEmitter,
    pub(crate) schema_lookup: Arc<dyn SchemaLookup>,
    pub(crate) apply_to_store: Option<Arc<dyn ApplyToStore>>,
    pub(crate) stats: tokio::sync::Mutex<SyncManagerStats>,
}

impl SyncManager<SystemClock> {
    /// Opens the engine against `kv`: restores persisted HLC state and site
    /// identity if present, otherwise mints fresh ones and persists them.
    pub async fn open(kv: Arc<dyn KvStore>, config: EngineConfig) -> Result<Self> {
        Self::open_with_physical_clock(kv, config, SystemClock).await
    }
}

impl<C: PhysicalClock> SyncManager<C> {
    pub async fn open_with_physical_clock(
        kv: Arc<dyn KvStore>,
        config: EngineConfig,
        physical: C,
    ) -> Result<Self> {
        let site_id = match kv.get(keys::SITE_ID_KEY).await? {
            Some(bytes) => {
                let record: SiteIdentityRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::corrupt(keys::SITE_ID_KEY, e.to_string()))?;
                record.site_id
            }
            None => {
                let site_id = SiteId::generate();
                let record = SiteIdentityRecord {
                    site_id,
                    created_at_millis: physical.now_millis(),
                };
                let bytes = serde_json::to_vec(&record)
                    .map_err(|e| SyncError::corrupt(keys::SITE_ID_KEY, e.to_string()))?;
                kv.put(keys::SITE_ID_KEY, &bytes).await?;
                info!("minted fresh site id {}", site_id);
                site_id
            }
        };

        let mut clock = HlcClock::with_physical_clock(site_id, config.max_clock_drift_millis, physical);
        if let Some(bytes) = kv.get(keys::HLC_STATE_KEY).await? {
            let state: HlcClockState = serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::corrupt(keys::HLC_STATE_KEY, e.to_string()))?;
            clock.restore(state);
        }

        Ok(SyncManager {
            column_versions: ColumnVersionStore::new(kv.clone()),
            tombstones: TombstoneStore::new(kv.clone()),
            schema_versions: SchemaVersionStore::new(kv.clone()),
            peer_states: PeerStateStore::new(kv.clone()),
            kv,
            clock: tokio::sync::Mutex::new(clock),
            site_id,
            config,
            events: EventEmitter::default(),
            schema_lookup: Arc::new(NoSchemaLookup),
            apply_to_store: None,
            stats: tokio::sync::Mutex::new(SyncManagerStats::default()),
        })
    }

    pub fn with_schema_lookup(mut self, lookup: Arc<dyn SchemaLookup>) -> Self {
        self.schema_lookup = lookup;
        self
    }

    pub fn with_apply_to_store(mut self, callback: Arc<dyn ApplyToStore>) -> Self {
        self.apply_to_store = Some(callback);
        self
    }

    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> SyncManagerStats {
        self.stats.lock().await.clone()
    }

    /// Live column-version, tombstone, and change-log entry counts for one
    /// `(schema, table)`. Walks that table's key ranges; not O(1), but cheap
    /// relative to a full snapshot scan.
    pub async fn table_stats(&self, schema: &str, table: &str) -> Result<TableStats> {
        let live_column_versions = self.column_versions.scan_table(schema, table).await?.len();
        let live_tombstones = self.tombstones.scan_table(schema, table).await?.len();
        let change_log_entries = change_log::count_for_table(self.kv.as_ref(), schema, table).await?;
        Ok(TableStats {
            live_column_versions,
            live_tombstones,
            change_log_entries,
        })
    }

    pub(crate) async fn persist_hlc_state_in_batch(&self, batch: &mut dyn crate::kv::KvBatch) -> Result<()> {
        let state = self.clock.lock().await.state();
        let bytes = serde_json::to_vec(&state)
            .map_err(|e| SyncError::corrupt(keys::HLC_STATE_KEY, e.to_string()))?;
        batch.put(keys::HLC_STATE_KEY.to_vec(), bytes);
        Ok(())
    }

    fn resolve_column_names(&self, schema: &str, table: &str, count: usize) -> Vec<String> {
        match self.schema_lookup.columns_for(schema, table) {
            Some(names) if names.len() >= count => names,
            _ => (0..count).map(|i| format!("col_{i}")).collect(),
        }
    }

    // ---- local write pipeline ----------------------------------------

    /// Records one local data-change event. Does nothing if the event
    /// originated remotely (`remote == true`): the apply pipeline already
    /// recorded its metadata.
    pub async fn record_local_change(&self, event: LocalDataChange, remote: bool) -> Result<()> {
        if remote {
            return Ok(());
        }

        let hlc = self.clock.lock().await.tick()?;
        let mut batch = self.kv.batch();
        let mut applied_changes = Vec::new();

        match event.kind {
            DataChangeKind::Delete => {
                self.tombstones.put_in_batch(
                    batch.as_mut(),
                    &event.schema,
                    &event.table,
                    &event.pk,
                    &crate::store::tombstone::Tombstone {
                        hlc,
                        created_at_millis: self.now_millis().await,
                    },
                )?;
                change_log::record_deletion_change_in_batch(
                    batch.as_mut(),
                    &hlc,
                    &event.schema,
                    &event.table,
                    &event.pk,
                );
                let removed = self
                    .column_versions
                    .delete_row_in_batch(batch.as_mut(), &event.schema, &event.table, &event.pk)
                    .await?;
                for (old_hlc, suffix) in &removed {
                    change_log::delete_column_change_in_batch(batch.as_mut(), old_hlc, suffix);
                }
                applied_changes.push(Change::Delete(RowDeletion {
                    schema: event.schema.clone(),
                    table: event.table.clone(),
                    pk: event.pk.clone(),
                    hlc,
                }));
            }
            DataChangeKind::Insert | DataChangeKind::Update => {
                let names = self.resolve_column_names(&event.schema, &event.table, event.new_columns.len());
                for (i, new_col) in event.new_columns.iter().enumerate() {
                    let unchanged = event
                        .old_columns
                        .get(i)
                        .is_some_and(|old| values_equal(&old.value, &new_col.value));
                    if unchanged {
                        continue;
                    }
                    let column = new_col
                        .column
                        .clone()
                        .unwrap_or_else(|| names.get(i).cloned().unwrap_or_else(|| format!("col_{i}")));

                    let existing = self
                        .column_versions
                        .get(&event.schema, &event.table, &event.pk, &column)
                        .await?;
                    let previous_hlc = existing.map(|e| e.hlc);
                    let version = ColumnVersion {
                        hlc,
                        value: new_col.value.clone(),
                    };
                    self.column_versions.put_in_batch(
                        batch.as_mut(),
                        &event.schema,
                        &event.table,
                        &event.pk,
                        &column,
                        &version,
                    )?;
                    change_log::record_column_change_in_batch(
                        batch.as_mut(),
                        &hlc,
                        previous_hlc.as_ref(),
                        &event.schema,
                        &event.table,
                        &event.pk,
                        &column,
                    );
                    applied_changes.push(Change::Column(ColumnChange {
                        schema: event.schema.clone(),
                        table: event.table.clone(),
                        pk: event.pk.clone(),
                        column,
                        value: version.value,
                        hlc,
                    }));
                }
            }
        }

        self.persist_hlc_state_in_batch(batch.as_mut()).await?;
        batch.commit().await?;

        {
            let mut stats = self.stats.lock().await;
            stats.local_changes_recorded += 1;
        }

        if !applied_changes.is_empty() {
            self.events.emit(SyncEvent::LocalChange(LocalChangeEvent {
                schema: event.schema,
                table: event.table,
                changes: applied_changes,
                schema_migrations: Vec::new(),
            }));
        }
        Ok(())
    }

    /// Records a schema-change event: bumps the monotonic `schemaVersion`
    /// for `(schema, table)`, persists the migration, and emits it as a
    /// `localChange` with no data changes attached.
    pub async fn record_schema_change(
        &self,
        kind: SchemaMigrationKind,
        schema: &str,
        table: &str,
        ddl: &str,
        column: Option<&str>,
    ) -> Result<()> {
        let hlc = self.clock.lock().await.tick()?;
        let schema_version_kind = match kind {
            SchemaMigrationKind::DropTable => SchemaVersionKind::TableDropped,
            SchemaMigrationKind::DropColumn => SchemaVersionKind::ColumnDropped,
            _ => SchemaVersionKind::Column,
        };

        let next_version = self.next_schema_migration_version(schema, table).await?;
        let mut batch = self.kv.batch();
        self.schema_versions
            .merge_in_batch(
                batch.as_mut(),
                schema,
                table,
                column,
                &SchemaVersion {
                    hlc,
                    kind: schema_version_kind,
                    affinity: None,
                    nullable: None,
                    default_expr: None,
                    ddl: Some(ddl.to_string()),
                },
            )
            .await?;
        let migration = SchemaMigration {
            kind,
            schema: schema.to_string(),
            table: table.to_string(),
            ddl: ddl.to_string(),
            hlc,
            schema_version: next_version,
        };
        batch.put(
            keys::schema_migration_key(schema, table, next_version),
            serde_json::to_vec(&migration)
                .map_err(|e| SyncError::corrupt(b"schema_migration", e.to_string()))?,
        );
        self.persist_hlc_state_in_batch(batch.as_mut()).await?;
        batch.commit().await?;

        self.events.emit(SyncEvent::LocalChange(LocalChangeEvent {
            schema: schema.to_string(),
            table: table.to_string(),
            changes: Vec::new(),
            schema_migrations: vec![migration],
        }));
        Ok(())
    }

    async fn next_schema_migration_version(&self, schema: &str, table: &str) -> Result<u64> {
        let prefix = keys::schema_migration_table_prefix(schema, table);
        let rows = self
            .kv
            .iterate(crate::kv::KeyRange::prefix(&prefix))
            .await?;
        Ok(rows.len() as u64 + 1)
    }

    pub(crate) async fn now_millis(&self) -> u64 {
        self.clock.lock().await.now().wall_time
    }

    // ---- two-phase apply pipeline -------------------------------------

    /// Resolves, applies, and commits a batch of inbound changesets.
    pub async fn apply_changesets(&self, changesets: &[ChangeSet]) -> Result<ApplyResult> {
        let mut result = ApplyResult::default();
        let mut staged_columns: Vec<StagedColumn> = Vec::new();
        let mut staged_deletes: Vec<StagedDelete> = Vec::new();
        let mut staged_migrations: Vec<SchemaMigration> = Vec::new();
        let mut data_changes: Vec<DataChange> = Vec::new();
        let mut schema_changes: Vec<SchemaChange> = Vec::new();
        let mut changes_by_site: HashMap<SiteId, Vec<Change>> = HashMap::new();

        // --- Phase 1: resolve, no metadata writes yet ---
        for changeset in changesets {
            self.clock.lock().await.receive(&changeset.hlc)?;
            result.transactions += 1;

            for change in &changeset.changes {
                if change.hlc().site_id == self.site_id {
                    result.skipped += 1;
                    continue;
                }

                match change {
                    Change::Delete(deletion) => {
                        let tombstone = self
                            .tombstones
                            .get(&deletion.schema, &deletion.table, &deletion.pk)
                            .await?;
                        if tombstone.is_some_and(|t| t.hlc >= deletion.hlc) {
                            result.skipped += 1;
                            continue;
                        }
                        staged_deletes.push(StagedDelete {
                            pk: deletion.pk.clone(),
                            hlc: deletion.hlc,
                        });
                        data_changes.push(DataChange {
                            kind: DataChangeKind::Delete,
                            schema: deletion.schema.clone(),
                            table: deletion.table.clone(),
                            pk: deletion.pk.clone(),
                            columns: None,
                        });
                        changes_by_site
                            .entry(change.hlc().site_id)
                            .or_default()
                            .push(change.clone());
                        result.applied += 1;
                    }
                    Change::Column(col) => {
                        let should_apply = self
                            .column_versions
                            .should_apply_write(&col.schema, &col.table, &col.pk, &col.column, &col.hlc)
                            .await?;
                        if !should_apply {
                            self.events.emit(SyncEvent::ConflictResolved(ConflictResolvedEvent {
                                schema: col.schema.clone(),
                                table: col.table.clone(),
                                column: col.column.clone(),
                                winner_hlc: self
                                    .column_versions
                                    .get(&col.schema, &col.table, &col.pk, &col.column)
                                    .await?
                                    .map(|v| v.hlc)
                                    .unwrap_or(col.hlc),
                                local_won: true,
                            }));
                            result.conflicts += 1;
                            continue;
                        }
                        let blocked = self
                            .tombstones
                            .is_deleted_and_blocking(
                                &col.schema,
                                &col.table,
                                &col.pk,
                                &col.hlc,
                                self.config.allow_resurrection,
                            )
                            .await?;
                        if blocked {
                            result.skipped += 1;
                            continue;
                        }
                        let existing = self
                            .column_versions
                            .get(&col.schema, &col.table, &col.pk, &col.column)
                            .await?;
                        staged_columns.push(StagedColumn {
                            column: col.column.clone(),
                            version: ColumnVersion {
                                hlc: col.hlc,
                                value: col.value.clone(),
                            },
                            previous_hlc: existing.map(|e| e.hlc),
                        });
                        data_changes.push(DataChange {
                            kind: DataChangeKind::Update,
                            schema: col.schema.clone(),
                            table: col.table.clone(),
                            pk: col.pk.clone(),
                            columns: Some(vec![(col.column.clone(), col.value.clone())]),
                        });
                        changes_by_site
                            .entry(change.hlc().site_id)
                            .or_default()
                            .push(change.clone());
                        result.applied += 1;
                    }
                }
            }

            for migration in &changeset.schema_migrations {
                // Migrations are deduped by the exact
                // `(schema, table, schemaVersion)` triple, not by destructive-
                // wins rank — that rank only governs the *effective* column
                // state in `schema_versions`, updated alongside in Phase 3.
                let migration_key =
                    keys::schema_migration_key(&migration.schema, &migration.table, migration.schema_version);
                let already_applied = match self.kv.get(&migration_key).await? {
                    Some(bytes) => {
                        let existing: SchemaMigration = serde_json::from_slice(&bytes)
                            .map_err(|e| SyncError::corrupt(&migration_key, e.to_string()))?;
                        existing.hlc >= migration.hlc
                    }
                    None => false,
                };
                if already_applied {
                    result.skipped += 1;
                    continue;
                }
                schema_changes.push(SchemaChange {
                    kind: migration.kind,
                    schema: migration.schema.clone(),
                    table: migration.table.clone(),
                    ddl: migration.ddl.clone(),
                });
                staged_migrations.push(migration.clone());
            }
        }

        // --- Phase 2: apply to user data via the host callback ---
        if let Some(callback) = &self.apply_to_store {
            if !data_changes.is_empty() || !schema_changes.is_empty() {
                let outcome = callback
                    .apply(&data_changes, &schema_changes)
                    .await
                    .map_err(|e| SyncError::ApplyCallbackFailed(anyhow::anyhow!(e.to_string())))?;
                if !outcome.errors.is_empty() {
                    warn!(
                        "applyToStore reported {} error(s) while applying {} data change(s)",
                        outcome.errors.len(),
                        data_changes.len()
                    );
                }
            }
        }

        // --- Phase 3: commit metadata in one batch ---
        let mut batch = self.kv.batch();
        // Need the schema/table context per staged item; changesets carry it
        // per-change, so re-derive it from data_changes in lockstep.
        let mut column_idx = 0;
        let mut delete_idx = 0;
        for dc in &data_changes {
            match dc.kind {
                DataChangeKind::Delete => {
                    let staged = &staged_deletes[delete_idx];
                    delete_idx += 1;
                    self.tombstones.put_in_batch(
                        batch.as_mut(),
                        &dc.schema,
                        &dc.table,
                        &dc.pk,
                        &crate::store::tombstone::Tombstone {
                            hlc: staged.hlc,
                            created_at_millis: self.now_millis().await,
                        },
                    )?;
                    change_log::record_deletion_change_in_batch(
                        batch.as_mut(),
                        &staged.hlc,
                        &dc.schema,
                        &dc.table,
                        &dc.pk,
                    );
                    let removed = self
                        .column_versions
                        .delete_row_in_batch(batch.as_mut(), &dc.schema, &dc.table, &dc.pk)
                        .await?;
                    for (old_hlc, suffix) in &removed {
                        change_log::delete_column_change_in_batch(batch.as_mut(), old_hlc, suffix);
                    }
                }
                DataChangeKind::Update | DataChangeKind::Insert => {
                    let staged = &staged_columns[column_idx];
                    column_idx += 1;
                    self.column_versions.put_in_batch(
                        batch.as_mut(),
                        &dc.schema,
                        &dc.table,
                        &dc.pk,
                        &staged.column,
                        &staged.version,
                    )?;
                    change_log::record_column_change_in_batch(
                        batch.as_mut(),
                        &staged.version.hlc,
                        staged.previous_hlc.as_ref(),
                        &dc.schema,
                        &dc.table,
                        &dc.pk,
                        &staged.column,
                    );
                }
            }
        }
        for migration in &staged_migrations {
            batch.put(
                keys::schema_migration_key(&migration.schema, &migration.table, migration.schema_version),
                serde_json::to_vec(migration)
                    .map_err(|e| SyncError::corrupt(b"schema_migration", e.to_string()))?,
            );
            let schema_version_kind = match migration.kind {
                SchemaMigrationKind::DropTable => SchemaVersionKind::TableDropped,
                SchemaMigrationKind::DropColumn => SchemaVersionKind::ColumnDropped,
                _ => SchemaVersionKind::Column,
            };
            self.schema_versions
                .merge_in_batch(
                    batch.as_mut(),
                    &migration.schema,
                    &migration.table,
                    None,
                    &SchemaVersion {
                        hlc: migration.hlc,
                        kind: schema_version_kind,
                        affinity: None,
                        nullable: None,
                        default_expr: None,
                        ddl: Some(migration.ddl.clone()),
                    },
                )
                .await?;
        }
        self.persist_hlc_state_in_batch(batch.as_mut()).await?;
        batch.commit().await?;

        {
            let mut stats = self.stats.lock().await;
            stats.changesets_applied += changesets.len() as u64;
        }

        for (origin_site_id, changes) in changes_by_site {
            self.events.emit(SyncEvent::RemoteChange(RemoteChangeEvent {
                origin_site_id,
                changes,
            }));
        }

        Ok(result)
    }

    // ---- delta pull --------------------------------------------------

    /// Produces changesets for `peer_site_id` containing everything since
    /// `since_hlc`, or a full recovery scan when `since_hlc` is `None`.
    ///
    /// `known_tables` is the `(schema, table)` catalog the host maintains —
    /// this engine has no schema catalog of its own, so a full-table scan
    /// needs the host to name what tables exist.
    /// Delta pulls never consult it: the change log alone is enough once a
    /// watermark is available.
    pub async fn get_changes_since(
        &self,
        peer_site_id: SiteId,
        since_hlc: Option<crate::hlc::Hlc>,
        known_tables: &[(String, String)],
    ) -> Result<Vec<ChangeSet>> {
        let mut changes: Vec<Change> = match since_hlc {
            Some(hlc) => self.delta_changes_since(&hlc, peer_site_id).await?,
            None => self.full_recovery_changes(peer_site_id, known_tables).await?,
        };
        changes.sort_by_key(|c| c.hlc());

        let migrations = self
            .migrations_since(since_hlc, peer_site_id, known_tables)
            .await?;

        Ok(batch_into_changesets(self.site_id, changes, migrations, self.config.batch_size))
    }

    /// Joins change-log entries strictly after `since_hlc` against the
    /// column-version and tombstone stores to build wire [`Change`]s. Every
    /// change-log entry embeds the `schema`/`table`/`pk`/`column` it points
    /// at in its value (see [`change_log::ChangeLogEntry`]), so no key
    /// decoding is needed here.
    async fn delta_changes_since(
        &self,
        since_hlc: &crate::hlc::Hlc,
        peer_site_id: SiteId,
    ) -> Result<Vec<Change>> {
        let entries: Vec<ChangeLogEntry> = change_log::changes_since(self.kv.as_ref(), since_hlc).await?;
        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.hlc.site_id == peer_site_id {
                continue;
            }
            match entry.kind {
                ChangeLogKind::Column => {
                    let Some(column) = entry.column.clone() else {
                        continue;
                    };
                    if let Some(version) = self
                        .column_versions
                        .get(&entry.schema, &entry.table, &entry.pk, &column)
                        .await?
                    {
                        if version.hlc != entry.hlc {
                            // Superseded between the index scan and this
                            // lookup; the change-log entry for the newer
                            // write will surface it instead.
                            continue;
                        }
                        changes.push(Change::Column(ColumnChange {
                            schema: entry.schema,
                            table: entry.table,
                            pk: entry.pk,
                            column,
                            value: version.value,
                            hlc: entry.hlc,
                        }));
                    }
                }
                ChangeLogKind::Deletion => {
                    if let Some(tombstone) = self
                        .tombstones
                        .get(&entry.schema, &entry.table, &entry.pk)
                        .await?
                    {
                        if tombstone.hlc != entry.hlc {
                            continue;
                        }
                        changes.push(Change::Delete(RowDeletion {
                            schema: entry.schema,
                            table: entry.table,
                            pk: entry.pk,
                            hlc: entry.hlc,
                        }));
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Full-table scan used when no watermark is available (first sync, or
    /// a peer past the tombstone TTL). Walks every known table's live
    /// column versions and tombstones directly, bypassing the change log
    /// entirely.
    async fn full_recovery_changes(
        &self,
        peer_site_id: SiteId,
        known_tables: &[(String, String)],
    ) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for (schema, table) in known_tables {
            for entry in self.column_versions.scan_table(schema, table).await? {
                if entry.version.hlc.site_id == peer_site_id {
                    continue;
                }
                changes.push(Change::Column(ColumnChange {
                    schema: schema.clone(),
                    table: table.clone(),
                    pk: entry.pk,
                    column: entry.column,
                    value: entry.version.value,
                    hlc: entry.version.hlc,
                }));
            }
            for (pk, tombstone) in self.tombstones.scan_table(schema, table).await? {
                if tombstone.hlc.site_id == peer_site_id {
                    continue;
                }
                changes.push(Change::Delete(RowDeletion {
                    schema: schema.clone(),
                    table: table.clone(),
                    pk,
                    hlc: tombstone.hlc,
                }));
            }
        }
        Ok(changes)
    }

    /// Scans every known table's schema-migration log, keeping entries
    /// strictly after `since_hlc` (when given) that did not originate at
    /// `peer_site_id`.
    async fn migrations_since(
        &self,
        since_hlc: Option<crate::hlc::Hlc>,
        peer_site_id: SiteId,
        known_tables: &[(String, String)],
    ) -> Result<Vec<SchemaMigration>> {
        let mut migrations = Vec::new();
        for (schema, table) in known_tables {
            let prefix = keys::schema_migration_table_prefix(schema, table);
            let rows = self.kv.iterate(crate::kv::KeyRange::prefix(&prefix)).await?;
            for (key, bytes) in rows {
                let migration: SchemaMigration = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::corrupt(&key, e.to_string()))?;
                if migration.hlc.site_id == peer_site_id {
                    continue;
                }
                if let Some(since) = since_hlc {
                    if migration.hlc <= since {
                        continue;
                    }
                }
                migrations.push(migration);
            }
        }
        migrations.sort_by_key(|m| m.hlc);
        Ok(migrations)
    }

    // ---- pruning and gating -------------------------------------------

    pub async fn can_delta_sync(&self, peer_site_id: SiteId, since_hlc: crate::hlc::Hlc) -> Result<bool> {
        let peer_state = self.peer_states.get(peer_site_id).await?;
        if peer_state.is_none() {
            return Ok(false);
        }
        let now = self.now_millis().await;
        Ok(now.saturating_sub(since_hlc.wall_time) <= self.config.tombstone_ttl_millis)
    }

    pub async fn update_peer_state(&self, peer_site_id: SiteId, last_sync_hlc: crate::hlc::Hlc) -> Result<()> {
        self.peer_states
            .put(
                peer_site_id,
                &PeerState {
                    last_sync_hlc,
                    last_sync_time_millis: self.now_millis().await,
                },
            )
            .await
    }

    /// Deletes every tombstone older than `config.tombstone_ttl_millis`.
    /// Returns the number removed.
    pub async fn prune_tombstones(&self) -> Result<usize> {
        let now = self.now_millis().await;
        let all = self.tombstones.scan_all().await?;
        let stale: Vec<_> = all
            .into_iter()
            .filter(|(_, t)| now.saturating_sub(t.created_at_millis) > self.config.tombstone_ttl_millis)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let mut batch = self.kv.batch();
        for (key, _) in &stale {
            batch.delete(key.clone());
        }
        batch.commit().await?;
        debug!("pruned {} stale tombstone(s)", stale.len());

        let mut stats = self.stats.lock().await;
        stats.tombstones_pruned += stale.len() as u64;
        Ok(stale.len())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    // `Value` has no blanket `Eq` (f64 in `Real`), so compare by the same
    // byte encoding the key codec uses, which is exact for every variant
    // this engine stores.
    let mut ea = Vec::new();
    let mut eb = Vec::new();
    keys::encode_value(a, &mut ea);
    keys::encode_value(b, &mut eb);
    ea == eb
}

fn batch_into_changesets(
    site_id: SiteId,
    changes: Vec<Change>,
    migrations: Vec<SchemaMigration>,
    batch_size: usize,
) -> Vec<ChangeSet> {
    if changes.is_empty() && migrations.is_empty() {
        return Vec::new();
    }
    let mut changesets = Vec::new();
    let mut chunks = changes.chunks(batch_size.max(1)).peekable();
    let mut first = true;
    if chunks.peek().is_none() && !migrations.is_empty() {
        changesets.push(ChangeSet {
            site_id,
            transaction_id: format!("{site_id}-0"),
            hlc: migrations.iter().map(|m| m.hlc).max().unwrap(),
            changes: Vec::new(),
            schema_migrations: migrations,
        });
        return changesets;
    }
    for (i, chunk) in chunks.enumerate() {
        let hlc = chunk.iter().map(|c| c.hlc()).max().unwrap();
        changesets.push(ChangeSet {
            site_id,
            transaction_id: format!("{site_id}-{i}"),
            hlc,
            changes: chunk.to_vec(),
            schema_migrations: if first { migrations.clone() } else { Vec::new() },
        });
        first = false;
    }
    changesets
}
