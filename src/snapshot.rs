//! Snapshot streaming: full-state transfer for a peer that cannot delta-sync,
//! with ingestion checkpointing so a crash mid-stream can resume instead of
//! restarting from scratch.
//!
//! Emission and ingestion are both expressed over an owned `Vec<SnapshotChunk>`
//! rather than a true async generator: the engine has no transport of its own,
//! and the host is expected to forward chunks to its wire format one at a
//! time as they're produced, so the in-memory sequence here stands in for
//! "whatever the host streams out".

use std::collections::HashMap;

#[cfg(not(test))]
use log::{debug, info};
#[cfg(test)]
use std::{println as debug, println as info};

use crate::error::{Result, SyncError};
use crate::events::{SyncEvent, SyncState};
use crate::hlc::{Hlc, PhysicalClock};
use crate::keys;
use crate::kv::KeyRange;
use crate::manager::SyncManager;
use crate::protocol::{SchemaMigration, SnapshotCheckpoint, SnapshotChunk};
use crate::site::SiteId;
use crate::value::Value;

impl<C: PhysicalClock> SyncManager<C> {
    /// Builds the full chunk sequence for `known_tables`: one `Header`, each
    /// table's `TableStart`/`ColumnVersions*`/`TableEnd`, every recorded
    /// schema migration, then one `Footer`.
    pub async fn emit_snapshot(
        &self,
        snapshot_id: &str,
        known_tables: &[(String, String)],
    ) -> Result<Vec<SnapshotChunk>> {
        let hlc = self.clock.lock().await.now();
        let migrations = self.all_migrations(known_tables).await?;
        let mut chunks = Vec::new();
        chunks.push(SnapshotChunk::Header {
            snapshot_id: snapshot_id.to_string(),
            site_id: self.site_id,
            hlc,
            table_count: known_tables.len() as u32,
            migration_count: migrations.len() as u32,
        });

        let mut total_entries = 0u64;
        for (schema, table) in known_tables {
            total_entries += self.emit_table(schema, table, &mut chunks).await?;
        }

        for migration in &migrations {
            chunks.push(SnapshotChunk::SchemaMigration(migration.clone()));
        }

        chunks.push(SnapshotChunk::Footer {
            snapshot_id: snapshot_id.to_string(),
            total_tables: known_tables.len() as u32,
            total_entries,
            total_migrations: migrations.len() as u32,
        });
        info!(
            "emitted snapshot {snapshot_id}: {} tables, {total_entries} entries, {} migrations",
            known_tables.len(),
            migrations.len()
        );
        Ok(chunks)
    }

    /// `resumeSnapshotStream`: re-emits the header, skips tables already in
    /// `checkpoint.completed_tables`, then migrations and footer — so a
    /// receiver that crashed mid-ingestion can pick up without re-walking
    /// tables it already finished.
    pub async fn resume_snapshot_stream(
        &self,
        checkpoint: &SnapshotCheckpoint,
        known_tables: &[(String, String)],
    ) -> Result<Vec<SnapshotChunk>> {
        let remaining: Vec<(String, String)> = known_tables
            .iter()
            .filter(|t| !checkpoint.completed_tables.contains(t))
            .cloned()
            .collect();
        let migrations = self.all_migrations(known_tables).await?;

        let mut chunks = Vec::new();
        chunks.push(SnapshotChunk::Header {
            snapshot_id: checkpoint.snapshot_id.clone(),
            site_id: checkpoint.site_id,
            hlc: checkpoint.hlc,
            table_count: remaining.len() as u32,
            migration_count: migrations.len() as u32,
        });
        let mut total_entries = checkpoint.entries_processed;
        for (schema, table) in &remaining {
            total_entries += self.emit_table(schema, table, &mut chunks).await?;
        }
        for migration in &migrations {
            chunks.push(SnapshotChunk::SchemaMigration(migration.clone()));
        }
        chunks.push(SnapshotChunk::Footer {
            snapshot_id: checkpoint.snapshot_id.clone(),
            total_tables: known_tables.len() as u32,
            total_entries,
            total_migrations: migrations.len() as u32,
        });
        Ok(chunks)
    }

    async fn emit_table(
        &self,
        schema: &str,
        table: &str,
        chunks: &mut Vec<SnapshotChunk>,
    ) -> Result<u64> {
        let entries = self.column_versions.scan_table(schema, table).await?;
        chunks.push(SnapshotChunk::TableStart {
            schema: schema.to_string(),
            table: table.to_string(),
            estimated_entries: entries.len() as u64,
        });
        let chunk_size = self.config.snapshot_chunk_size.max(1);
        for slice in entries.chunks(chunk_size) {
            let rows = slice
                .iter()
                .map(|e| (e.pk.clone(), e.column.clone(), e.version.value.clone(), e.version.hlc))
                .collect();
            chunks.push(SnapshotChunk::ColumnVersions {
                schema: schema.to_string(),
                table: table.to_string(),
                entries: rows,
            });
        }
        for (pk, tombstone) in self.tombstones.scan_table(schema, table).await? {
            chunks.push(SnapshotChunk::ColumnVersions {
                schema: schema.to_string(),
                table: table.to_string(),
                entries: vec![(pk, String::new(), Value::Null, tombstone.hlc)],
            });
        }
        chunks.push(SnapshotChunk::TableEnd {
            schema: schema.to_string(),
            table: table.to_string(),
            entries_written: entries.len() as u64,
        });
        Ok(entries.len() as u64)
    }

    async fn all_migrations(&self, known_tables: &[(String, String)]) -> Result<Vec<SchemaMigration>> {
        let mut migrations = Vec::new();
        for (schema, table) in known_tables {
            let prefix = keys::schema_migration_table_prefix(schema, table);
            let rows = self.kv.iterate(KeyRange::prefix(&prefix)).await?;
            for (key, bytes) in rows {
                let migration: SchemaMigration = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::corrupt(&key, e.to_string()))?;
                migrations.push(migration);
            }
        }
        migrations.sort_by_key(|m| m.hlc);
        Ok(migrations)
    }

    /// Step 1 of ingestion: clears the column-version, tombstone, and
    /// change-log key spaces in one batch, since an incoming snapshot
    /// replaces local state wholesale rather than merging with it.
    pub async fn begin_snapshot_ingestion(&self) -> Result<()> {
        let mut batch = self.kv.batch();
        for prefix in [
            keys::COLUMN_VERSION_PREFIX,
            keys::TOMBSTONE_PREFIX,
            keys::CHANGE_LOG_PREFIX,
        ] {
            for (key, _) in self.kv.iterate(KeyRange::prefix(prefix)).await? {
                batch.delete(key);
            }
        }
        batch.commit().await?;
        debug!("cleared metadata spaces ahead of snapshot ingestion");
        Ok(())
    }

    /// Applies one chunk of an inbound snapshot stream to `state`,
    /// committing flush batches and checkpoints as thresholds are crossed.
    pub async fn ingest_snapshot_chunk(
        &self,
        chunk: SnapshotChunk,
        state: &mut SnapshotIngestState,
    ) -> Result<()> {
        match chunk {
            SnapshotChunk::Header {
                snapshot_id,
                site_id,
                hlc,
                ..
            } => {
                state.snapshot_id = snapshot_id;
                state.origin_site_id = site_id;
                state.hlc = hlc;
            }
            SnapshotChunk::TableStart { schema, table, .. } => {
                state.current_table = Some((schema, table));
            }
            SnapshotChunk::ColumnVersions { schema, table, entries } => {
                let mut batch = self.kv.batch();
                for (pk, column, value, hlc) in entries {
                    if column.is_empty() {
                        self.tombstones.put_in_batch(
                            batch.as_mut(),
                            &schema,
                            &table,
                            &pk,
                            &crate::store::tombstone::Tombstone {
                                hlc,
                                created_at_millis: self.now_millis().await,
                            },
                        )?;
                        crate::change_log::record_deletion_change_in_batch(
                            batch.as_mut(),
                            &hlc,
                            &schema,
                            &table,
                            &pk,
                        );
                    } else {
                        self.column_versions.put_in_batch(
                            batch.as_mut(),
                            &schema,
                            &table,
                            &pk,
                            &column,
                            &crate::store::column_version::ColumnVersion { hlc, value: value.clone() },
                        )?;
                        crate::change_log::record_column_change_in_batch(
                            batch.as_mut(),
                            &hlc,
                            None,
                            &schema,
                            &table,
                            &pk,
                            &column,
                        );
                    }
                    state
                        .pending_rows
                        .entry((schema.clone(), table.clone()))
                        .or_default()
                        .push((pk, column, value));
                    state.entries_processed += 1;
                }
                batch.commit().await?;

                if state.entries_processed.saturating_sub(state.last_checkpoint_at)
                    >= self.config.snapshot_flush_size as u64
                {
                    self.write_checkpoint(state).await?;
                }
            }
            SnapshotChunk::TableEnd { schema, table, .. } => {
                let key = (schema.clone(), table.clone());
                if let Some(rows) = state.pending_rows.remove(&key) {
                    self.flush_rows_to_host(&schema, &table, rows).await?;
                }
                state.completed_tables.push(key);
                state.current_table = None;
            }
            SnapshotChunk::SchemaMigration(migration) => {
                state.pending_migrations.push(migration);
            }
            SnapshotChunk::Footer { .. } => {
                for (key, rows) in std::mem::take(&mut state.pending_rows) {
                    self.flush_rows_to_host(&key.0, &key.1, rows).await?;
                }
                if !state.pending_migrations.is_empty() {
                    if let Some(callback) = &self.apply_to_store {
                        let schema_changes: Vec<crate::protocol::SchemaChange> = state
                            .pending_migrations
                            .iter()
                            .map(|m| crate::protocol::SchemaChange {
                                kind: m.kind,
                                schema: m.schema.clone(),
                                table: m.table.clone(),
                                ddl: m.ddl.clone(),
                            })
                            .collect();
                        callback
                            .apply(&[], &schema_changes)
                            .await
                            .map_err(|e| SyncError::ApplyCallbackFailed(anyhow::anyhow!(e.to_string())))?;
                    }
                }

                let mut clock = self.clock.lock().await;
                if state.hlc > clock.now() {
                    let _ = clock.receive(&state.hlc)?;
                }
                drop(clock);

                let mut batch = self.kv.batch();
                self.persist_hlc_state_in_batch(batch.as_mut()).await?;
                batch.delete(keys::snapshot_checkpoint_key(&state.snapshot_id));
                batch.commit().await?;

                self.events.emit(SyncEvent::SyncStateChange(SyncState::Synced));
                info!(
                    "finished ingesting snapshot {} ({} entries)",
                    state.snapshot_id, state.entries_processed
                );
            }
        }
        Ok(())
    }

    async fn flush_rows_to_host(
        &self,
        schema: &str,
        table: &str,
        rows: Vec<(Vec<u8>, String, Value)>,
    ) -> Result<()> {
        let Some(callback) = &self.apply_to_store else {
            return Ok(());
        };
        for slice in rows.chunks(self.config.snapshot_flush_size.max(1)) {
            let data_changes: Vec<crate::protocol::DataChange> = slice
                .iter()
                .filter(|(_, column, _)| !column.is_empty())
                .map(|(pk, column, value)| crate::protocol::DataChange {
                    kind: crate::protocol::DataChangeKind::Insert,
                    schema: schema.to_string(),
                    table: table.to_string(),
                    pk: pk.clone(),
                    columns: Some(vec![(column.clone(), value.clone())]),
                })
                .collect();
            let deletes: Vec<crate::protocol::DataChange> = slice
                .iter()
                .filter(|(_, column, _)| column.is_empty())
                .map(|(pk, _, _)| crate::protocol::DataChange {
                    kind: crate::protocol::DataChangeKind::Delete,
                    schema: schema.to_string(),
                    table: table.to_string(),
                    pk: pk.clone(),
                    columns: None,
                })
                .collect();
            if data_changes.is_empty() && deletes.is_empty() {
                continue;
            }
            let mut combined = data_changes;
            combined.extend(deletes);
            callback
                .apply(&combined, &[])
                .await
                .map_err(|e| SyncError::ApplyCallbackFailed(anyhow::anyhow!(e.to_string())))?;
        }
        Ok(())
    }

    async fn write_checkpoint(&self, state: &mut SnapshotIngestState) -> Result<()> {
        let checkpoint = SnapshotCheckpoint {
            snapshot_id: state.snapshot_id.clone(),
            site_id: state.origin_site_id,
            hlc: state.hlc,
            completed_tables: state.completed_tables.clone(),
            entries_processed: state.entries_processed,
            created_at_millis: self.now_millis().await,
        };
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| SyncError::corrupt(b"snapshot_checkpoint", e.to_string()))?;
        self.kv
            .put(&keys::snapshot_checkpoint_key(&state.snapshot_id), &bytes)
            .await?;
        state.last_checkpoint_at = state.entries_processed;
        Ok(())
    }
}

/// Accumulated state while ingesting a snapshot chunk sequence, threaded
/// through successive [`SyncManager::ingest_snapshot_chunk`] calls.
///
/// `origin_site_id` and `hlc` are placeholders until the `Header` chunk is
/// processed (always the first chunk of any well-formed sequence), which
/// overwrites them with the emitting replica's real identity and HLC.
#[derive(Debug, Clone)]
pub struct SnapshotIngestState {
    pub snapshot_id: String,
    pub origin_site_id: SiteId,
    pub hlc: Hlc,
    pub current_table: Option<(String, String)>,
    pub completed_tables: Vec<(String, String)>,
    pub entries_processed: u64,
    pub pending_rows: HashMap<(String, String), Vec<(Vec<u8>, String, Value)>>,
    pub pending_migrations: Vec<SchemaMigration>,
    last_checkpoint_at: u64,
}

impl SnapshotIngestState {
    pub fn new() -> Self {
        let placeholder_site = SiteId::generate();
        SnapshotIngestState {
            snapshot_id: String::new(),
            origin_site_id: placeholder_site,
            hlc: Hlc::zero(placeholder_site),
            current_table: None,
            completed_tables: Vec::new(),
            entries_processed: 0,
            pending_rows: HashMap::new(),
            pending_migrations: Vec::new(),
            last_checkpoint_at: 0,
        }
    }
}

impl Default for SnapshotIngestState {
    fn default() -> Self {
        SnapshotIngestState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::kv::MemoryKv;
    use crate::manager::{ApplyCallbackOutcome, ApplyToStore, LocalDataChange, ColumnValue};
    use crate::protocol::{DataChange, DataChangeKind, SchemaChange};
    use async_trait::async_trait;
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    struct FakeClock(Cell<u64>);
    impl PhysicalClock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.get()
        }
    }

    struct RecordingApply {
        data_changes: Mutex<Vec<DataChange>>,
        schema_changes: Mutex<Vec<SchemaChange>>,
    }

    impl RecordingApply {
        fn new() -> Self {
            RecordingApply {
                data_changes: Mutex::new(Vec::new()),
                schema_changes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApplyToStore for RecordingApply {
        async fn apply(
            &self,
            data_changes: &[DataChange],
            schema_changes: &[SchemaChange],
        ) -> Result<ApplyCallbackOutcome> {
            self.data_changes.lock().unwrap().extend(data_changes.iter().cloned());
            self.schema_changes.lock().unwrap().extend(schema_changes.iter().cloned());
            Ok(ApplyCallbackOutcome {
                data_changes_applied: data_changes.len(),
                schema_changes_applied: schema_changes.len(),
                errors: Vec::new(),
            })
        }
    }

    async fn source_manager() -> SyncManager<FakeClock> {
        SyncManager::open_with_physical_clock(
            Arc::new(MemoryKv::new()),
            EngineConfig::default(),
            FakeClock(Cell::new(1000)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn emit_snapshot_covers_every_known_table() {
        let manager = source_manager().await;
        manager
            .record_local_change(
                LocalDataChange {
                    kind: DataChangeKind::Insert,
                    schema: "main".into(),
                    table: "users".into(),
                    pk: keys::encode_pk(&[Value::Integer(1)]),
                    new_columns: vec![ColumnValue {
                        column: Some("name".into()),
                        value: Value::Text("Alice".into()),
                    }],
                    old_columns: Vec::new(),
                },
                false,
            )
            .await
            .unwrap();

        let known_tables = vec![("main".to_string(), "users".to_string())];
        let chunks = manager.emit_snapshot("snap-1", &known_tables).await.unwrap();
        assert!(matches!(chunks.first(), Some(SnapshotChunk::Header { .. })));
        assert!(matches!(chunks.last(), Some(SnapshotChunk::Footer { total_entries: 1, .. })));
        assert!(chunks
            .iter()
            .any(|c| matches!(c, SnapshotChunk::ColumnVersions { entries, .. } if entries.len() == 1)));
    }

    #[tokio::test]
    async fn ingest_snapshot_round_trips_into_apply_callback() {
        let source = source_manager().await;
        source
            .record_local_change(
                LocalDataChange {
                    kind: DataChangeKind::Insert,
                    schema: "main".into(),
                    table: "users".into(),
                    pk: keys::encode_pk(&[Value::Integer(1)]),
                    new_columns: vec![ColumnValue {
                        column: Some("name".into()),
                        value: Value::Text("Alice".into()),
                    }],
                    old_columns: Vec::new(),
                },
                false,
            )
            .await
            .unwrap();
        let known_tables = vec![("main".to_string(), "users".to_string())];
        let chunks = source.emit_snapshot("snap-1", &known_tables).await.unwrap();

        let apply = Arc::new(RecordingApply::new());
        let target = SyncManager::open_with_physical_clock(
            Arc::new(MemoryKv::new()),
            EngineConfig::default(),
            FakeClock(Cell::new(2000)),
        )
        .await
        .unwrap()
        .with_apply_to_store(apply.clone());
        target.begin_snapshot_ingestion().await.unwrap();

        let mut state = SnapshotIngestState::new();
        for chunk in chunks {
            target.ingest_snapshot_chunk(chunk, &mut state).await.unwrap();
        }

        let applied = apply.data_changes.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].schema, "main");
        assert_eq!(applied[0].table, "users");
    }

    #[tokio::test]
    async fn resume_snapshot_stream_skips_completed_tables() {
        let manager = source_manager().await;
        let known_tables = vec![
            ("main".to_string(), "users".to_string()),
            ("main".to_string(), "posts".to_string()),
        ];
        let checkpoint = SnapshotCheckpoint {
            snapshot_id: "snap-1".into(),
            site_id: manager.site_id(),
            hlc: Hlc::zero(manager.site_id()),
            completed_tables: vec![("main".to_string(), "users".to_string())],
            entries_processed: 0,
            created_at_millis: 0,
        };
        let chunks = manager
            .resume_snapshot_stream(&checkpoint, &known_tables)
            .await
            .unwrap();
        assert!(!chunks
            .iter()
            .any(|c| matches!(c, SnapshotChunk::TableStart { table, .. } if table == "users")));
        assert!(chunks
            .iter()
            .any(|c| matches!(c, SnapshotChunk::TableStart { table, .. } if table == "posts")));
    }
}
