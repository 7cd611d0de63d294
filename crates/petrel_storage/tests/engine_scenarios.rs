//! Engine-level scenarios: DDL, pooled readers and writers, the checkpoint
//! barrier and notification backpressure.

use std::sync::Arc;

use petrel_common::config::EngineConfig;
use petrel_common::error::PetrelError;
use petrel_common::types::{ColumnType, PartitionBy, Value, MICROS_PER_DAY};

use petrel_storage::engine::{Engine, EngineMaintenanceJob, TableStructure};
use petrel_storage::metadata::ColumnMeta;

// 2024-01-01T00:00:00Z
const JAN_1_2024: i64 = 1_704_067_200_000_000;

fn column(name: &str, col_type: ColumnType) -> ColumnMeta {
    ColumnMeta {
        name: name.to_string(),
        col_type,
    }
}

fn int_ts_table(name: &str, is_wal: bool) -> TableStructure {
    TableStructure {
        table_name: name.to_string(),
        partition_by: PartitionBy::Day,
        timestamp_index: 1,
        columns: vec![column("a", ColumnType::Int), column("ts", ColumnType::Timestamp)],
        is_wal,
        is_mat_view: false,
        base_table_name: None,
        query: None,
    }
}

fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    Engine::open(EngineConfig::new(dir)).unwrap()
}

#[test]
fn test_create_write_read_single_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();
    {
        let mut writer = engine.get_writer(&token, "insert").unwrap();
        writer
            .append_row(vec![Value::Int(42), Value::Timestamp(JAN_1_2024)])
            .unwrap();
        writer.commit().unwrap();
    }

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 1);
    let pts = PartitionBy::Day.floor(JAN_1_2024);
    assert_eq!(reader.value_at(pts, 0, 0).unwrap(), Value::Int(42));
    assert_eq!(
        reader.value_at(pts, 1, 0).unwrap(),
        Value::Timestamp(JAN_1_2024)
    );
}

#[test]
fn test_create_existing_table_conflicts_unless_if_not_exists() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();
    let err = engine
        .create_table(&int_ts_table("t", false), false)
        .expect_err("name is taken");
    assert!(matches!(err, PetrelError::EntryUnavailable { .. }));

    let existing = engine.create_table(&int_ts_table("t", false), true).unwrap();
    assert_eq!(existing, token);
}

#[test]
fn test_invalid_table_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let mut structure = int_ts_table("bad/name", false);
    assert!(matches!(
        engine.create_table(&structure, false),
        Err(PetrelError::InvalidName(_))
    ));
    structure.table_name = String::new();
    assert!(matches!(
        engine.create_table(&structure, false),
        Err(PetrelError::InvalidName(_))
    ));
}

#[test]
fn test_concurrent_queries_during_add_column_observe_consistent_state() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();
    let pts = PartitionBy::Day.floor(JAN_1_2024);
    {
        let mut writer = engine.get_writer(&token, "load").unwrap();
        for i in 0..1_000 {
            writer
                .append_row(vec![Value::Int(i), Value::Timestamp(JAN_1_2024 + i as i64)])
                .unwrap();
        }
        writer.commit().unwrap();
    }
    let expected_sum: i64 = (0..1_000).sum();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            s.spawn(move || {
                for _ in 0..25 {
                    let reader = engine.get_reader(&token).unwrap();
                    let values = reader.column_values(0).unwrap();
                    assert_eq!(values.len(), 1_000);
                    let sum: i64 = values
                        .iter()
                        .map(|v| match v {
                            Value::Int(i) => *i as i64,
                            other => panic!("unexpected value {other:?}"),
                        })
                        .sum();
                    assert_eq!(sum, expected_sum);

                    if reader.meta().columns.len() == 3 {
                        assert_eq!(reader.column_top(pts, 2), 1_000);
                        for row in [0u64, 500, 999] {
                            assert_eq!(reader.value_at(pts, 2, row).unwrap(), Value::Null);
                        }
                    }
                }
            });
        }

        {
            let mut writer = engine.get_writer(&token, "alter").unwrap();
            writer.add_column("b", ColumnType::Double).unwrap();
        }
    });

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.meta().columns.len(), 3);
    assert_eq!(reader.metadata_version(), 1);
    assert_eq!(reader.column_top(pts, 2), 1_000);

    // rows appended after the alter land below the column top
    {
        let mut writer = engine.get_writer(&token, "insert").unwrap();
        writer
            .append_row(vec![
                Value::Int(7),
                Value::Timestamp(JAN_1_2024 + 5_000),
                Value::Double(1.5),
            ])
            .unwrap();
        writer.commit().unwrap();
    }
    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.value_at(pts, 2, 1_000).unwrap(), Value::Double(1.5));
    assert_eq!(reader.value_at(pts, 2, 999).unwrap(), Value::Null);
}

#[test]
fn test_reader_pinned_to_stale_metadata_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    assert!(engine.get_reader_at_version(&token, 0).is_ok());
    {
        let mut writer = engine.get_writer(&token, "alter").unwrap();
        writer.add_column("b", ColumnType::Double).unwrap();
    }
    let err = engine
        .get_reader_at_version(&token, 0)
        .expect_err("metadata moved");
    assert!(matches!(err, PetrelError::TableReferenceOutOfDate { .. }));
    assert!(engine.get_reader_at_version(&token, 1).is_ok());
}

#[test]
fn test_reader_pool_exhaustion_fails_fast_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.reader_pool_capacity = 4;
    let engine = Engine::open(config).unwrap();
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(engine.get_reader(&token).unwrap());
    }
    let err = engine.get_reader(&token).expect_err("pool is exhausted");
    assert!(matches!(err, PetrelError::EntryUnavailable { .. }));

    held.pop();
    assert!(engine.get_reader(&token).is_ok());
}

#[test]
fn test_writer_is_exclusive_per_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    let writer = engine.get_writer(&token, "ingest").unwrap();
    let err = engine
        .get_writer(&token, "second")
        .expect_err("single writer per table");
    assert!(matches!(err, PetrelError::EntryUnavailable { reason } if reason == "ingest"));
    drop(writer);
    assert!(engine.get_writer(&token, "second").is_ok());
}

#[test]
fn test_drop_table_refuses_while_reader_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    let reader = engine.get_reader(&token).unwrap();
    let err = engine
        .drop_table_or_mat_view(&token)
        .expect_err("reader holds the table");
    assert!(matches!(err, PetrelError::EntryUnavailable { .. }));
    drop(reader);

    engine.drop_table_or_mat_view(&token).unwrap();
    assert!(matches!(
        engine.verify_table_name("t"),
        Err(PetrelError::TableDoesNotExist(_))
    ));
    assert!(!dir.path().join(token.dir_name()).exists());
}

#[test]
fn test_non_wal_rename_moves_directory_and_swings_registry() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("x", false), false).unwrap();
    {
        let mut writer = engine.get_writer(&token, "insert").unwrap();
        writer
            .append_row(vec![Value::Int(1), Value::Timestamp(JAN_1_2024)])
            .unwrap();
        writer.commit().unwrap();
    }

    let renamed = engine.rename_table("x", "y").unwrap();
    assert_eq!(renamed.table_name(), "y");
    assert!(dir.path().join("y").exists());
    assert!(!dir.path().join("x").exists());
    assert!(matches!(
        engine.verify_table_name("x"),
        Err(PetrelError::TableDoesNotExist(_))
    ));

    let reader = engine.get_reader(&renamed).unwrap();
    assert_eq!(reader.row_count(), 1);
}

#[test]
fn test_checkpoint_freezes_reader_locking() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    engine.checkpoint_create().unwrap();
    assert!(engine.checkpoint_in_progress());
    assert_eq!(
        engine.lock_readers(&token),
        Err("checkpointInProgress".to_string())
    );
    assert_eq!(
        engine.lock_readers_and_metadata(&token),
        Err("checkpointInProgress".to_string())
    );
    // a second checkpoint cannot start inside the barrier
    assert!(matches!(
        engine.checkpoint_create(),
        Err(PetrelError::CheckpointInProgress)
    ));

    engine.checkpoint_release().unwrap();
    assert_eq!(engine.lock_readers(&token), Ok(()));
    engine.unlock_readers(&token);
}

#[test]
fn test_notification_queue_overflow_defers_to_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.wal_txn_notification_queue_capacity = 2;
    let engine = Engine::open(config).unwrap();
    let token = engine.create_table(&int_ts_table("q", true), false).unwrap();

    assert_eq!(engine.unpublished_wal_txn_count(), 1);
    assert!(engine.notify_wal_txn_committed(&token));
    assert!(engine.notify_wal_txn_committed(&token));
    assert!(!engine.notify_wal_txn_committed(&token));
    assert_eq!(engine.unpublished_wal_txn_count(), 2);
}

#[test]
fn test_concurrent_creates_of_same_name_yield_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    let winners = std::sync::atomic::AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let winners = &winners;
            s.spawn(move || {
                match engine.create_table(&int_ts_table("t", false), false) {
                    Ok(_) => {
                        winners.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                    }
                    Err(PetrelError::EntryUnavailable { .. }) => {}
                    Err(other) => panic!("unexpected error {other}"),
                }
            });
        }
    });
    assert_eq!(winners.load(std::sync::atomic::Ordering::Acquire), 1);
    assert!(engine.verify_table_name("t").is_ok());
}

#[test]
fn test_maintenance_sweep_reaps_idle_resources() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.idle_check_interval_ms = 0;
    config.inactive_ttl_ms = 0;
    let engine = Engine::open(config).unwrap();
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    drop(engine.get_reader(&token).unwrap());
    drop(engine.get_writer(&token, "warmup").unwrap());

    let mut job = EngineMaintenanceJob::new(Arc::clone(&engine));
    assert!(job.run(), "idle reader and writer are reaped");
    assert!(!job.run(), "nothing left to reap");
    assert_eq!(engine.busy_reader_count(), 0);
    assert_eq!(engine.busy_writer_count(), 0);
}

#[test]
fn test_busy_writer_serializes_command_onto_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();

    let writer = engine.get_writer(&token, "ingest").unwrap();
    let acquired = engine
        .get_writer_or_publish_command(&token, 1, "alter table t add column b double")
        .unwrap();
    assert!(acquired.is_none());
    let command = engine
        .message_bus()
        .writer_commands
        .try_consume()
        .expect("command enqueued");
    assert_eq!(command.cmd_type, 1);
    assert_eq!(command.token, token);
    assert_eq!(command.sql, "alter table t add column b double");

    drop(writer);
    let acquired = engine
        .get_writer_or_publish_command(&token, 1, "alter table t add column b double")
        .unwrap();
    assert!(acquired.is_some());
}

#[test]
fn test_rows_spread_across_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&int_ts_table("t", false), false).unwrap();
    {
        let mut writer = engine.get_writer(&token, "insert").unwrap();
        for day in 0..3 {
            writer
                .append_row(vec![
                    Value::Int(day),
                    Value::Timestamp(JAN_1_2024 + day as i64 * MICROS_PER_DAY),
                ])
                .unwrap();
        }
        writer.commit().unwrap();
    }
    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.partitions().len(), 3);
    assert_eq!(reader.row_count(), 3);
    for day in 0..3 {
        let pts = PartitionBy::Day.floor(JAN_1_2024 + day as i64 * MICROS_PER_DAY);
        assert_eq!(reader.value_at(pts, 0, 0).unwrap(), Value::Int(day));
    }
}
