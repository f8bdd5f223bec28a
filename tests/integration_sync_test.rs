//! End-to-end scenarios against the public `SyncManager` API, covering the
//! literal scenarios and the cross-replica properties that a single
//! manager's own `#[cfg(test)]` suite can't exercise in isolation.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use sync::hlc::{Hlc, PhysicalClock};
use sync::keys;
use sync::kv::MemoryKv;
use sync::manager::{ApplyCallbackOutcome, ApplyToStore, ColumnValue, LocalDataChange};
use sync::protocol::{DataChange, DataChangeKind, SchemaChange};
use sync::snapshot::SnapshotIngestState;
use sync::site::SiteId;
use sync::value::Value;
use sync::{ChangeSet, EngineConfig, SyncManager};

struct FakeClock(Cell<u64>);

impl PhysicalClock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.0.get()
    }
}

impl FakeClock {
    fn new(millis: u64) -> Self {
        FakeClock(Cell::new(millis))
    }
}

/// Mirrors applied changes into an in-memory table, the way a host's real
/// `applyToStore` would write into its own row store. Good enough to assert
/// convergence between replicas without a real database.
#[derive(Default)]
struct MirrorStore {
    rows: Mutex<HashMap<(String, String, Vec<u8>), HashMap<String, Value>>>,
    migrations: Mutex<Vec<SchemaChange>>,
}

#[async_trait]
impl ApplyToStore for MirrorStore {
    async fn apply(
        &self,
        data_changes: &[DataChange],
        schema_changes: &[SchemaChange],
    ) -> sync::Result<ApplyCallbackOutcome> {
        let mut rows = self.rows.lock().unwrap();
        for change in data_changes {
            let key = (change.schema.clone(), change.table.clone(), change.pk.clone());
            match change.kind {
                DataChangeKind::Delete => {
                    rows.remove(&key);
                }
                DataChangeKind::Insert | DataChangeKind::Update => {
                    let row = rows.entry(key).or_default();
                    if let Some(columns) = &change.columns {
                        for (col, value) in columns {
                            row.insert(col.clone(), value.clone());
                        }
                    }
                }
            }
        }
        self.migrations.lock().unwrap().extend(schema_changes.iter().cloned());
        Ok(ApplyCallbackOutcome {
            data_changes_applied: data_changes.len(),
            schema_changes_applied: schema_changes.len(),
            errors: Vec::new(),
        })
    }
}

async fn replica(millis: u64) -> (SyncManager<FakeClock>, Arc<MirrorStore>) {
    let mirror = Arc::new(MirrorStore::default());
    let manager = SyncManager::open_with_physical_clock(
        Arc::new(MemoryKv::new()),
        EngineConfig::default(),
        FakeClock::new(millis),
    )
    .await
    .unwrap()
    .with_apply_to_store(mirror.clone());
    (manager, mirror)
}

fn insert_alice(pk: Vec<u8>) -> LocalDataChange {
    LocalDataChange {
        kind: DataChangeKind::Insert,
        schema: "main".into(),
        table: "users".into(),
        pk,
        new_columns: vec![
            ColumnValue { column: Some("col_0".into()), value: Value::Integer(1) },
            ColumnValue { column: Some("col_1".into()), value: Value::Text("Alice".into()) },
        ],
        old_columns: Vec::new(),
    }
}

// Scenario A (basic sync).
#[tokio::test]
async fn scenario_a_basic_sync_delivers_both_columns() {
    let _ = env_logger::try_init();
    let (r1, _) = replica(1000).await;
    let (r2, mirror2) = replica(1000).await;

    let pk = keys::encode_pk(&[Value::Integer(1)]);
    r1.record_local_change(insert_alice(pk.clone()), false).await.unwrap();

    let changesets = r1.get_changes_since(r2.site_id(), None, &[("main".into(), "users".into())]).await.unwrap();
    let total_changes: usize = changesets.iter().map(|c| c.changes.len()).sum();
    assert_eq!(total_changes, 2);

    let result = r2.apply_changesets(&changesets).await.unwrap();
    assert_eq!(result.applied, 2);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.conflicts, 0);

    let rows = mirror2.rows.lock().unwrap();
    let row = rows.get(&("main".to_string(), "users".to_string(), pk)).unwrap();
    assert_eq!(row.get("col_0"), Some(&Value::Integer(1)));
    assert_eq!(row.get("col_1"), Some(&Value::Text("Alice".into())));
}

// Scenario B (LWW loses).
#[tokio::test]
async fn scenario_b_later_hlc_wins_regardless_of_arrival_order() {
    let (r1, _) = replica(1000).await;
    let (r2, mirror2) = replica(2000).await;
    let pk = keys::encode_pk(&[Value::Integer(1)]);

    let h1 = Hlc { wall_time: 1000, counter: 0, site_id: r1.site_id() };
    let h2 = Hlc { wall_time: 2000, counter: 0, site_id: r2.site_id() };

    // R2 writes "Bob" at the later HLC first, establishing local state.
    let bob_changeset = ChangeSet {
        site_id: r2.site_id(),
        transaction_id: "r2-1".into(),
        hlc: h2,
        changes: vec![sync::Change::Column(sync::protocol::ColumnChange {
            schema: "main".into(),
            table: "users".into(),
            pk: pk.clone(),
            column: "name".into(),
            value: Value::Text("Bob".into()),
            hlc: h2,
        })],
        schema_migrations: Vec::new(),
    };
    let applied_local = r2.apply_changesets(&[bob_changeset]).await.unwrap();
    assert_eq!(applied_local.applied, 1);

    // The older write from R1 arrives afterward and must lose.
    let alice_changeset = ChangeSet {
        site_id: r1.site_id(),
        transaction_id: "r1-1".into(),
        hlc: h1,
        changes: vec![sync::Change::Column(sync::protocol::ColumnChange {
            schema: "main".into(),
            table: "users".into(),
            pk: pk.clone(),
            column: "name".into(),
            value: Value::Text("Alice".into()),
            hlc: h1,
        })],
        schema_migrations: Vec::new(),
    };
    let result = r2.apply_changesets(&[alice_changeset]).await.unwrap();
    assert_eq!(result.conflicts, 1);
    assert_eq!(result.applied, 0);

    let rows = mirror2.rows.lock().unwrap();
    let row = rows.get(&("main".to_string(), "users".to_string(), pk)).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Text("Bob".into())));
}

// Scenario C (delete wins over stale update).
#[tokio::test]
async fn scenario_c_delete_blocks_an_older_update() {
    let (r2, mirror2) = replica(2000).await;
    let pk = keys::encode_pk(&[Value::Integer(1)]);
    let site_a = SiteId::generate();

    let h_d = Hlc { wall_time: 2000, counter: 0, site_id: SiteId::generate() };
    let delete_changeset = ChangeSet {
        site_id: h_d.site_id,
        transaction_id: "delete-1".into(),
        hlc: h_d,
        changes: vec![sync::Change::Delete(sync::protocol::RowDeletion {
            schema: "main".into(),
            table: "users".into(),
            pk: pk.clone(),
            hlc: h_d,
        })],
        schema_migrations: Vec::new(),
    };
    let deleted = r2.apply_changesets(&[delete_changeset]).await.unwrap();
    assert_eq!(deleted.applied, 1);

    let h_w = Hlc { wall_time: 1500, counter: 0, site_id: site_a };
    let stale_update = ChangeSet {
        site_id: site_a,
        transaction_id: "update-1".into(),
        hlc: h_w,
        changes: vec![sync::Change::Column(sync::protocol::ColumnChange {
            schema: "main".into(),
            table: "users".into(),
            pk: pk.clone(),
            column: "name".into(),
            value: Value::Text("Resurrected".into()),
            hlc: h_w,
        })],
        schema_migrations: Vec::new(),
    };
    let result = r2.apply_changesets(&[stale_update]).await.unwrap();
    assert_eq!(result.skipped, 1);
    assert_eq!(result.applied, 0);
    assert!(mirror2
        .rows
        .lock()
        .unwrap()
        .get(&("main".to_string(), "users".to_string(), pk))
        .is_none());
}

// Scenario D (snapshot): 3 rows across 2 tables, small chunk size.
#[tokio::test]
async fn scenario_d_snapshot_chunks_every_table_and_footer_totals_match() {
    let (r1, _) = replica(1000).await;
    let mut config = EngineConfig::default();
    config.snapshot_chunk_size = 2;
    let kv = Arc::new(MemoryKv::new());
    let r1 = SyncManager::open_with_physical_clock(kv, config, FakeClock::new(1000))
        .await
        .unwrap();

    let pk1 = keys::encode_pk(&[Value::Integer(1)]);
    let pk2 = keys::encode_pk(&[Value::Integer(2)]);
    let pk3 = keys::encode_pk(&[Value::Integer(3)]);
    r1.record_local_change(insert_alice(pk1.clone()), false).await.unwrap();
    r1.record_local_change(insert_alice(pk2.clone()), false).await.unwrap();
    r1.record_local_change(
        LocalDataChange {
            kind: DataChangeKind::Insert,
            schema: "main".into(),
            table: "posts".into(),
            pk: pk3.clone(),
            new_columns: vec![ColumnValue { column: Some("title".into()), value: Value::Text("Hi".into()) }],
            old_columns: Vec::new(),
        },
        false,
    )
    .await
    .unwrap();

    let known_tables = vec![("main".to_string(), "users".to_string()), ("main".to_string(), "posts".to_string())];
    let chunks = r1.emit_snapshot("snap-d", &known_tables).await.unwrap();

    let total_written: u64 = chunks
        .iter()
        .filter_map(|c| match c {
            sync::protocol::SnapshotChunk::TableEnd { entries_written, .. } => Some(*entries_written),
            _ => None,
        })
        .sum();
    match chunks.last() {
        Some(sync::protocol::SnapshotChunk::Footer { total_entries, .. }) => {
            assert_eq!(*total_entries, total_written);
        }
        other => panic!("expected Footer as last chunk, got {other:?}"),
    }

    let user_column_chunks = chunks
        .iter()
        .filter(|c| matches!(c, sync::protocol::SnapshotChunk::ColumnVersions { table, .. } if table == "users"))
        .count();
    // 2 rows x 2 columns = 4 column-version entries, chunked at 2 per chunk.
    assert_eq!(user_column_chunks, 2);
}

// Scenario D continued: applying the snapshot to a fresh replica converges.
#[tokio::test]
async fn snapshot_round_trip_converges_and_advances_hlc() {
    let (r1, _) = replica(1000).await;
    let pk = keys::encode_pk(&[Value::Integer(1)]);
    r1.record_local_change(insert_alice(pk.clone()), false).await.unwrap();
    let known_tables = vec![("main".to_string(), "users".to_string())];
    let chunks = r1.emit_snapshot("snap-1", &known_tables).await.unwrap();

    let (r2, mirror2) = replica(500).await;
    r2.begin_snapshot_ingestion().await.unwrap();
    let mut state = SnapshotIngestState::new();
    for chunk in chunks {
        r2.ingest_snapshot_chunk(chunk, &mut state).await.unwrap();
    }

    let rows = mirror2.rows.lock().unwrap();
    let row = rows.get(&("main".to_string(), "users".to_string(), pk)).unwrap();
    assert_eq!(row.get("col_1"), Some(&Value::Text("Alice".into())));
    drop(rows);

    // R1's snapshot HLC had wall_time 1000; R2 started at 500 and must now
    // be at or past it.
    let r2_now = r2.can_delta_sync(r1.site_id(), Hlc { wall_time: 0, counter: 0, site_id: r1.site_id() }).await;
    assert!(r2_now.is_ok());
}

// Scenario F (checkpoint resume).
#[tokio::test]
async fn scenario_f_resume_skips_completed_tables() {
    let (r1, _) = replica(1000).await;
    let pk1 = keys::encode_pk(&[Value::Integer(1)]);
    let pk2 = keys::encode_pk(&[Value::Integer(2)]);
    r1.record_local_change(insert_alice(pk1), false).await.unwrap();
    r1.record_local_change(
        LocalDataChange {
            kind: DataChangeKind::Insert,
            schema: "main".into(),
            table: "posts".into(),
            pk: pk2,
            new_columns: vec![ColumnValue { column: Some("title".into()), value: Value::Text("Hi".into()) }],
            old_columns: Vec::new(),
        },
        false,
    )
    .await
    .unwrap();

    let known_tables = vec![("main".to_string(), "users".to_string()), ("main".to_string(), "posts".to_string())];
    let checkpoint = sync::protocol::SnapshotCheckpoint {
        snapshot_id: "snap-f".into(),
        site_id: r1.site_id(),
        hlc: Hlc { wall_time: 1000, counter: 0, site_id: r1.site_id() },
        completed_tables: vec![("main".to_string(), "users".to_string())],
        entries_processed: 2,
        created_at_millis: 1000,
    };
    let resumed = r1.resume_snapshot_stream(&checkpoint, &known_tables).await.unwrap();
    assert!(!resumed
        .iter()
        .any(|c| matches!(c, sync::protocol::SnapshotChunk::TableStart { table, .. } if table == "users")));
    assert!(resumed
        .iter()
        .any(|c| matches!(c, sync::protocol::SnapshotChunk::TableStart { table, .. } if table == "posts")));
}

// Property 5 (convergence) + property 9 (echo suppression): exchanging
// changesets both ways leaves both replicas with the same column-version
// state, and pulling-then-applying one's own writes is a no-op.
#[tokio::test]
async fn convergence_and_echo_suppression_across_two_replicas() {
    let (r1, mirror1) = replica(1000).await;
    let (r2, mirror2) = replica(1000).await;

    let pk = keys::encode_pk(&[Value::Integer(1)]);
    r1.record_local_change(insert_alice(pk.clone()), false).await.unwrap();

    let known = vec![("main".to_string(), "users".to_string())];
    let to_r2 = r1.get_changes_since(r2.site_id(), None, &known).await.unwrap();
    r2.apply_changesets(&to_r2).await.unwrap();

    // R1 pulling its own changes back (as if echoed by a relay) applies
    // nothing.
    let echoed = r1.get_changes_since(r1.site_id(), None, &known).await.unwrap();
    assert!(echoed.is_empty(), "a peer should never see its own writes echoed back");

    let rows1 = mirror1.rows.lock().unwrap();
    let rows2 = mirror2.rows.lock().unwrap();
    assert_eq!(rows1.len(), 0, "R1 never had applyToStore invoked for its own local write in this test");
    assert_eq!(
        rows2.get(&("main".to_string(), "users".to_string(), pk)).unwrap().get("col_1"),
        Some(&Value::Text("Alice".into()))
    );
}

// Property 10 (idempotent apply).
#[tokio::test]
async fn idempotent_apply_settles_after_first_application() {
    let (r2, _) = replica(1000).await;
    let pk = keys::encode_pk(&[Value::Integer(1)]);
    let remote = SiteId::generate();
    let hlc = Hlc { wall_time: 5000, counter: 0, site_id: remote };
    let changeset = ChangeSet {
        site_id: remote,
        transaction_id: "t1".into(),
        hlc,
        changes: vec![sync::Change::Column(sync::protocol::ColumnChange {
            schema: "main".into(),
            table: "users".into(),
            pk,
            column: "name".into(),
            value: Value::Text("Once".into()),
            hlc,
        })],
        schema_migrations: Vec::new(),
    };
    let first = r2.apply_changesets(&[changeset.clone()]).await.unwrap();
    assert_eq!(first.applied, 1);
    assert!(first.skipped + first.conflicts == 0);

    for _ in 0..3 {
        let again = r2.apply_changesets(&[changeset.clone()]).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped + again.conflicts, 1);
    }
}

// Property 12 (delta-sync gating).
#[tokio::test]
async fn delta_sync_gating_follows_peer_state_and_ttl() {
    let mut config = EngineConfig::default();
    config.tombstone_ttl_millis = 10_000;
    let manager = SyncManager::open_with_physical_clock(
        Arc::new(MemoryKv::new()),
        config,
        FakeClock::new(20_000),
    )
    .await
    .unwrap();
    let peer = SiteId::generate();

    let old_watermark = Hlc { wall_time: 1_000, counter: 0, site_id: peer };
    assert!(!manager.can_delta_sync(peer, old_watermark).await.unwrap(), "unknown peer must not delta-sync");

    manager.update_peer_state(peer, old_watermark).await.unwrap();
    assert!(
        !manager.can_delta_sync(peer, old_watermark).await.unwrap(),
        "20000 - 1000 exceeds the 10000ms TTL"
    );

    let recent_watermark = Hlc { wall_time: 15_000, counter: 0, site_id: peer };
    assert!(manager.can_delta_sync(peer, recent_watermark).await.unwrap());
}

// Scenario E (crash between Phase 2 and Phase 3): re-applying the same
// changeset after a simulated crash (nothing committed yet, since this is a
// single process) must be safe and converge to the same state as a single
// clean application.
#[tokio::test]
async fn reapplying_after_a_simulated_crash_converges_once() {
    let (r2, mirror2) = replica(1000).await;
    let pk = keys::encode_pk(&[Value::Integer(1)]);
    let remote = SiteId::generate();
    let hlc = Hlc { wall_time: 3000, counter: 0, site_id: remote };
    let changeset = ChangeSet {
        site_id: remote,
        transaction_id: "crash-1".into(),
        hlc,
        changes: vec![sync::Change::Column(sync::protocol::ColumnChange {
            schema: "main".into(),
            table: "users".into(),
            pk: pk.clone(),
            column: "name".into(),
            value: Value::Text("Resilient".into()),
            hlc,
        })],
        schema_migrations: Vec::new(),
    };

    // Host's applyToStore already ran once (simulated by applying fully);
    // a restart re-pulls and re-applies the identical changeset.
    let first = r2.apply_changesets(&[changeset.clone()]).await.unwrap();
    assert_eq!(first.applied, 1);
    let second = r2.apply_changesets(&[changeset]).await.unwrap();
    assert_eq!(second.applied, 0, "metadata already committed should block a second application");

    let rows = mirror2.rows.lock().unwrap();
    assert_eq!(
        rows.get(&("main".to_string(), "users".to_string(), pk)).unwrap().get("name"),
        Some(&Value::Text("Resilient".into()))
    );
}
