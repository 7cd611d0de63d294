//! WAL ingestion and apply: commit → notification → merge into table
//! storage, replay idempotence, txn waiting and rename recovery.

use std::sync::Arc;
use std::time::Duration;

use petrel_common::config::EngineConfig;
use petrel_common::error::PetrelError;
use petrel_common::types::{ColumnType, PartitionBy, Value};

use petrel_storage::apply::WalApplyJob;
use petrel_storage::engine::{Engine, TableStructure};
use petrel_storage::metadata::{overwrite_table_name_file, ColumnMeta};

// 2024-01-01T00:00:00Z
const JAN_1_2024: i64 = 1_704_067_200_000_000;

fn column(name: &str, col_type: ColumnType) -> ColumnMeta {
    ColumnMeta {
        name: name.to_string(),
        col_type,
    }
}

fn trades_table(name: &str) -> TableStructure {
    TableStructure {
        table_name: name.to_string(),
        partition_by: PartitionBy::Day,
        timestamp_index: 2,
        columns: vec![
            column("sym", ColumnType::Symbol),
            column("price", ColumnType::Double),
            column("ts", ColumnType::Timestamp),
        ],
        is_wal: true,
        is_mat_view: false,
        base_table_name: None,
        query: None,
    }
}

fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    Engine::open(EngineConfig::new(dir)).unwrap()
}

fn row(sym: &str, price: f64, ts_offset: i64) -> Vec<Value> {
    vec![
        Value::Symbol(sym.to_string()),
        Value::Double(price),
        Value::Timestamp(JAN_1_2024 + ts_offset),
    ]
}

#[test]
fn test_wal_commit_is_applied_to_table_storage() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("trades"), false).unwrap();

    {
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.append_row(row("usd", 1.00, 1)).unwrap();
        wal.append_row(row("eur", 1.11, 2)).unwrap();
        assert_eq!(wal.commit().unwrap(), 1);
        wal.append_row(row("gbp", 1.25, 3)).unwrap();
        assert_eq!(wal.commit().unwrap(), 2);
    }

    // nothing visible before apply
    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 0);
    drop(reader);

    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    assert!(apply.run());

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 4);
    let syms = reader.column_values(0).unwrap();
    assert_eq!(
        syms,
        vec![
            Value::Symbol("eur".to_string()),
            Value::Symbol("usd".to_string()),
            Value::Symbol("eur".to_string()),
            Value::Symbol("gbp".to_string()),
        ]
    );
    let prices = reader.column_values(1).unwrap();
    assert_eq!(prices[3], Value::Double(1.25));
}

#[test]
fn test_apply_is_idempotent_for_already_applied_txns() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("trades"), false).unwrap();

    {
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit().unwrap();
    }
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    assert!(apply.run());
    // a second pass and a republish find nothing new
    assert!(!apply.run());
    engine.notify_wal_txn_republisher(&token);
    apply.run();

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 1);
}

#[test]
fn test_apply_survives_engine_restart_and_replays_pending_txns() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        let token = engine.create_table(&trades_table("trades"), false).unwrap();
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.append_row(row("usd", 1.00, 1)).unwrap();
        wal.commit().unwrap();
        // process dies before any apply ran
    }

    let engine = open_engine(dir.path());
    let token = engine.verify_table_name("trades").unwrap();
    // the unpublished count starts at 1, forcing a full rescan
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    assert!(apply.run());

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 2);
    assert_eq!(
        reader.column_values(0).unwrap()[1],
        Value::Symbol("usd".to_string())
    );
}

#[test]
fn test_await_txn_catches_up_through_apply() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("trades"), false).unwrap();

    let seq_txn = {
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit().unwrap()
    };

    let err = engine
        .await_txn("trades", seq_txn, Duration::from_millis(50))
        .expect_err("nothing applied yet");
    assert!(matches!(err, PetrelError::TxnTimeout { .. }));

    std::thread::scope(|s| {
        let engine_for_apply = Arc::clone(&engine);
        s.spawn(move || {
            let mut apply = WalApplyJob::new(engine_for_apply);
            apply.run();
        });
        engine
            .await_txn("trades", seq_txn, Duration::from_secs(5))
            .unwrap();
    });
}

#[test]
fn test_wal_truncate_applies_to_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("trades"), false).unwrap();

    {
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit().unwrap();
        wal.truncate().unwrap();
    }
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    apply.run();

    let reader = engine.get_reader(&token).unwrap();
    assert_eq!(reader.row_count(), 0);
    assert_eq!(reader.partitions().len(), 0);
}

#[test]
fn test_wal_rename_swings_registry_after_apply() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("x"), false).unwrap();

    let renamed = engine.rename_table("x", "y").unwrap();
    assert_eq!(renamed.table_name(), "y");
    assert_eq!(renamed.dir_name(), token.dir_name());
    assert!(matches!(
        engine.verify_table_name("x"),
        Err(PetrelError::TableDoesNotExist(_))
    ));
    assert!(engine.verify_table_name("y").is_ok());

    // the rename record in the WAL applies cleanly as a no-op
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    apply.run();
    assert!(engine.verify_table_name("y").is_ok());
}

#[test]
fn test_wal_rename_crash_before_registry_swing_recovers_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let table_dir;
    {
        let engine = open_engine(dir.path());
        let token = engine.create_table(&trades_table("x"), false).unwrap();
        table_dir = token.dir_name().to_string();

        // crash window: the rename reached the WAL and the _name file, but
        // the registry never swung
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.rename_table("y").unwrap();
        drop(wal);
        overwrite_table_name_file(
            engine.files(),
            &dir.path().join(token.dir_name()),
            "y",
        )
        .unwrap();
    }

    let engine = open_engine(dir.path());
    // before apply, the old name still resolves and the new one does not
    let resolved_x = engine.verify_table_name("x").is_ok();
    let resolved_y = engine.verify_table_name("y").is_ok();
    assert!(resolved_x ^ resolved_y, "exactly one name resolves");

    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    apply.run();

    let token = engine.verify_table_name("y").expect("WAL rename wins");
    assert!(matches!(
        engine.verify_table_name("x"),
        Err(PetrelError::TableDoesNotExist(_))
    ));
    assert_eq!(token.dir_name(), table_dir);
}

#[test]
fn test_drop_wal_table_removes_directories() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let token = engine.create_table(&trades_table("trades"), false).unwrap();
    {
        let mut wal = engine.get_wal_writer(&token).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit().unwrap();
    }

    engine.drop_table_or_mat_view(&token).unwrap();
    assert!(matches!(
        engine.verify_table_name("trades"),
        Err(PetrelError::TableDoesNotExist(_))
    ));
    assert!(!dir.path().join(token.dir_name()).exists());

    // apply passes skip the dropped table
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    apply.run();
}

#[test]
fn test_mat_view_registration_and_refresh_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let base = engine.create_table(&trades_table("trades"), false).unwrap();

    let mut view_structure = trades_table("trades_1h");
    view_structure.is_mat_view = true;
    view_structure.base_table_name = Some("trades".to_string());
    view_structure.query = Some("select sym, avg(price) from trades".to_string());
    let view = engine.create_mat_view(&view_structure, false).unwrap();
    assert!(view.is_mat_view());

    {
        let mut wal = engine.get_wal_writer(&base).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit().unwrap();
    }
    let mut apply = WalApplyJob::new(Arc::clone(&engine));
    apply.run();

    let task = engine
        .mat_view_graph()
        .take_refresh_task()
        .expect("refresh task enqueued");
    assert_eq!(task.view.dir_name(), view.dir_name());
    assert_eq!(task.base_seq_txn, 1);

    // a refresh worker would now write the view's rows, stamping the base
    // txn it computed against
    {
        let mut wal = engine.get_wal_writer(&view).unwrap();
        wal.append_row(row("eur", 1.10, 0)).unwrap();
        wal.commit_mat_view_data(task.base_seq_txn, JAN_1_2024).unwrap();
    }
    apply.run();
    let state = engine.mat_view_graph().view_state(&view).unwrap();
    assert_eq!(state.last_refresh_base_txn(), 1);
    assert_eq!(state.last_refresh_timestamp(), JAN_1_2024);
    let view_reader = engine.get_reader(&view).unwrap();
    assert_eq!(view_reader.row_count(), 1);
    drop(view_reader);

    // an explicit invalidation travels through the WAL too
    {
        let mut wal = engine.get_wal_writer(&view).unwrap();
        wal.invalidate_mat_view(true, Some("manual refresh required"))
            .unwrap();
    }
    apply.run();
    assert!(state.is_invalid());
    assert_eq!(
        state.invalidation_reason().as_deref(),
        Some("manual refresh required")
    );

    // dropping the base invalidates dependent views outright
    engine.drop_table_or_mat_view(&base).unwrap();
    assert!(engine.mat_view_graph().view_state(&view).unwrap().is_invalid());
}
