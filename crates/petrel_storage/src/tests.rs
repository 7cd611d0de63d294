#[cfg(test)]
mod column_version_tests {
    use std::time::Duration;

    use petrel_common::types::COL_TOP_DEFAULT_PARTITION;

    use crate::column_version::{ColumnVersionReader, ColumnVersionWriter, OFFSET_VERSION_64};
    use crate::fs::FilesFacade;
    use crate::mem::RwMem;

    #[test]
    fn test_upsert_keeps_records_sorted_and_lookup_finds_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();

        writer.upsert(2_000, 1, 7, 10);
        writer.upsert(1_000, 0, 5, 0);
        writer.upsert(2_000, 0, 6, 3);

        let list = writer.list();
        assert_eq!(list.record_count(), 3);
        assert_eq!(list.column_top_quick(2_000, 0), 3);
        assert_eq!(list.column_top_quick(2_000, 1), 10);
        assert_eq!(list.column_name_txn(1_000, 0), 5);
        assert!(list.record_index(3_000, 0) < 0);
    }

    #[test]
    fn test_column_top_falls_back_to_introduction_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();

        // column 2 added in partition 5_000
        writer.upsert_column_added(2, 5_000);
        writer.upsert(5_000, 2, -1, 100);

        let list = writer.list();
        // explicit record wins
        assert_eq!(list.column_top(5_000, 2), 100);
        // later partition: column fully present
        assert_eq!(list.column_top(6_000, 2), 0);
        // earlier partition: column absent
        assert_eq!(list.column_top(4_000, 2), -1);
        assert_eq!(list.column_top_partition_timestamp(2), 5_000);
        // a column with no records existed from creation
        assert_eq!(list.column_top(4_000, 0), 0);
        assert_eq!(
            list.column_top_partition_timestamp(0),
            COL_TOP_DEFAULT_PARTITION
        );
    }

    #[test]
    fn test_commit_flips_parity_and_reader_observes_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
        assert_eq!(writer.version(), 0);

        writer.upsert(1_000, 0, 1, 11);
        writer.commit().unwrap();
        assert_eq!(writer.version(), 1);

        let mut reader = ColumnVersionReader::open(FilesFacade, &path).unwrap();
        reader.read_safe(Duration::from_millis(100)).unwrap();
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.list().column_top_quick(1_000, 0), 11);

        writer.upsert(1_000, 0, 1, 22);
        writer.commit().unwrap();
        assert_eq!(writer.version(), 2);
        reader.read_safe(Duration::from_millis(100)).unwrap();
        assert_eq!(reader.version(), 2);
        assert_eq!(reader.list().column_top_quick(1_000, 0), 22);
    }

    #[test]
    fn test_writer_reopens_from_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        {
            let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
            writer.upsert(1_000, 0, 9, 4);
            writer.upsert(2_000, 3, 9, 8);
            writer.commit().unwrap();
        }
        let writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
        assert_eq!(writer.version(), 1);
        assert_eq!(writer.list().record_count(), 2);
        assert_eq!(writer.list().column_top_quick(2_000, 3), 8);
    }

    #[test]
    fn test_read_times_out_while_writer_stalls_mid_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        {
            let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
            writer.upsert(1_000, 0, 1, 1);
            writer.commit().unwrap();
        }

        let stop = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            // a stalled writer that keeps the version word moving so the
            // reader can never validate a snapshot
            s.spawn(|| {
                let mut raw = RwMem::open(FilesFacade, &path, 4096).unwrap();
                let mut v = 100i64;
                while !stop.load(std::sync::atomic::Ordering::Acquire) {
                    raw.put_i64_volatile_at(OFFSET_VERSION_64, v).unwrap();
                    v += 1;
                    std::hint::spin_loop();
                }
            });

            let mut reader = ColumnVersionReader::open(FilesFacade, &path).unwrap();
            let err = reader
                .read_safe(Duration::from_millis(10))
                .expect_err("read must time out");
            assert!(err.is_critical());
            assert!(err.to_string().contains("column version read timeout"));
            stop.store(true, std::sync::atomic::Ordering::Release);
        });
    }

    #[test]
    fn test_concurrent_reads_never_observe_torn_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_cv");
        {
            // generation 0: every record's top is 0
            let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
            for col in 0..8 {
                writer.upsert(1_000, col, 0, 0);
            }
            writer.commit().unwrap();
        }

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut writer = ColumnVersionWriter::open(FilesFacade, &path).unwrap();
                for generation in 1..200i64 {
                    for col in 0..8 {
                        writer.upsert(1_000, col, generation, generation);
                    }
                    writer.commit().unwrap();
                }
            });

            for _ in 0..2 {
                s.spawn(|| {
                    let mut reader = ColumnVersionReader::open(FilesFacade, &path).unwrap();
                    for _ in 0..500 {
                        reader.read_safe(Duration::from_secs(5)).unwrap();
                        let list = reader.list();
                        let generation = list.column_top_quick(1_000, 0);
                        for col in 1..8 {
                            assert_eq!(
                                list.column_top_quick(1_000, col),
                                generation,
                                "blended snapshot observed"
                            );
                        }
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod wal_event_tests {
    use petrel_common::types::CommitMode;

    use crate::fs::FilesFacade;
    use crate::wal::events::{BindValue, DataInfo, SymbolMapDiff, WalEventBody, WalEventReader, WalEventWriter};
    use crate::wal::{WALE_FORMAT_VERSION, WALE_HEADER_SIZE};
    use crate::EVENT_INDEX_FILE_NAME;

    fn open_writer(dir: &std::path::Path) -> WalEventWriter {
        WalEventWriter::open(FilesFacade, dir, 4096, CommitMode::NoSync).unwrap()
    }

    fn data_info(start: i64, end: i64, diffs: Vec<SymbolMapDiff>) -> DataInfo {
        DataInfo {
            start_row_id: start,
            end_row_id: end,
            min_timestamp: 10,
            max_timestamp: 20,
            out_of_order: false,
            symbol_diffs: diffs,
        }
    }

    fn index_entries(dir: &std::path::Path) -> Vec<i64> {
        let bytes = std::fs::read(dir.join(EVENT_INDEX_FILE_NAME)).unwrap();
        bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_open_writes_header_and_seeds_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        assert_eq!(writer.txn(), 0);
        drop(writer);

        let mut reader = WalEventReader::open(FilesFacade, dir.path()).unwrap();
        assert_eq!(reader.format_version(), WALE_FORMAT_VERSION);
        assert_eq!(reader.max_txn(), -1);
        assert!(reader.read_record(0).unwrap().is_none());
        assert_eq!(index_entries(dir.path()), vec![WALE_HEADER_SIZE as i64]);
    }

    #[test]
    fn test_index_holds_n_plus_one_entries_with_terminal_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        let n = 5;
        for i in 0..n {
            writer.append_data(&data_info(i, i + 1, Vec::new())).unwrap();
        }
        drop(writer);

        let entries = index_entries(dir.path());
        assert_eq!(entries.len(), n as usize + 1);

        let bytes = std::fs::read(dir.path().join(crate::EVENT_FILE_NAME)).unwrap();
        let last = *entries.last().unwrap() as usize;
        let terminal = i32::from_le_bytes(bytes[last..last + 4].try_into().unwrap());
        assert_eq!(terminal, -1);

        // every non-terminal entry points at a committed record's length
        for &entry in &entries[..n as usize] {
            let len =
                i32::from_le_bytes(bytes[entry as usize..entry as usize + 4].try_into().unwrap());
            assert!(len > 0);
        }
    }

    #[test]
    fn test_data_record_round_trip_with_symbol_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        let diffs = vec![SymbolMapDiff {
            column_index: 2,
            null_flag: true,
            initial_count: 1,
            // code 0 predates this txn and must not be serialized
            entries: vec![(0, "stale".to_string()), (1, "eur".to_string()), (2, "usd".to_string())],
        }];
        let txn = writer.append_data(&data_info(0, 42, diffs)).unwrap();
        assert_eq!(txn, 0);
        drop(writer);

        let mut reader = WalEventReader::open(FilesFacade, dir.path()).unwrap();
        assert_eq!(reader.max_txn(), 0);
        let record = reader.read_record(0).unwrap().expect("committed record");
        assert_eq!(record.txn, 0);
        match record.body {
            WalEventBody::Data(data) => {
                assert_eq!(data.start_row_id, 0);
                assert_eq!(data.end_row_id, 42);
                assert_eq!(data.symbol_diffs.len(), 1);
                let diff = &data.symbol_diffs[0];
                assert_eq!(diff.column_index, 2);
                assert!(diff.null_flag);
                assert_eq!(diff.initial_count, 1);
                assert_eq!(
                    diff.entries,
                    vec![(1, "eur".to_string()), (2, "usd".to_string())]
                );
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_sql_record_round_trip_with_bind_variables() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        let indexed = vec![
            BindValue::Int(7),
            BindValue::Double(2.5),
            BindValue::Str(Some("abc".to_string())),
            BindValue::Str(None),
            BindValue::Bool(true),
        ];
        let named = vec![
            ("lo".to_string(), BindValue::Timestamp(1_000_000)),
            ("hi".to_string(), BindValue::Long(99)),
        ];
        writer
            .append_sql(2, "update t set a = $1", 11, 13, &indexed, &named)
            .unwrap();
        drop(writer);

        let mut reader = WalEventReader::open(FilesFacade, dir.path()).unwrap();
        let record = reader.read_record(0).unwrap().unwrap();
        match record.body {
            WalEventBody::Sql {
                cmd_type,
                sql,
                rnd_seed0,
                rnd_seed1,
                indexed_vars,
                named_vars,
            } => {
                assert_eq!(cmd_type, 2);
                assert_eq!(sql, "update t set a = $1");
                assert_eq!((rnd_seed0, rnd_seed1), (11, 13));
                assert_eq!(indexed_vars, indexed);
                assert_eq!(named_vars, named);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_truncate_and_invalidate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        writer.truncate().unwrap();
        writer.invalidate(true, Some("stale base")).unwrap();
        drop(writer);

        let mut reader = WalEventReader::open(FilesFacade, dir.path()).unwrap();
        assert!(matches!(
            reader.read_record(0).unwrap().unwrap().body,
            WalEventBody::Truncate
        ));
        match reader.read_record(1).unwrap().unwrap().body {
            WalEventBody::MatViewInvalidate { invalid, reason } => {
                assert!(invalid);
                assert_eq!(reason.as_deref(), Some("stale base"));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_rollback_invalidates_record_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path());
        writer.append_data(&data_info(0, 1, Vec::new())).unwrap();
        let size_before = writer.size();
        writer.append_data(&data_info(1, 2, Vec::new())).unwrap();
        writer.rollback().unwrap();
        // rollback never truncates, an apply job may still be reading
        assert!(writer.size() >= size_before);
        drop(writer);

        let mut reader = WalEventReader::open(FilesFacade, dir.path()).unwrap();
        assert!(reader.read_record(0).unwrap().is_some());
        assert!(reader.read_record(1).unwrap().is_none());
        assert_eq!(reader.max_txn(), 0);
    }
}

#[cfg(test)]
mod pool_tests {
    use std::time::Duration;

    use petrel_common::error::{PetrelError, PetrelResult};
    use petrel_common::types::{TableId, TableToken};

    use crate::pool::{ResourceFactory, ResourcePool};

    struct CountingFactory;

    struct Counter {
        serial: u64,
    }

    impl ResourceFactory<Counter> for CountingFactory {
        fn new_resource(&self, token: &TableToken) -> PetrelResult<Counter> {
            Ok(Counter {
                serial: token.table_id().0 as u64,
            })
        }
    }

    fn token(name: &str) -> TableToken {
        TableToken::new(name, name, TableId(1), false, false)
    }

    #[test]
    fn test_get_release_recycles_resource() {
        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let t = token("t");
        let guard = pool.get(&t, "first").unwrap();
        assert_eq!(pool.busy_count(), 1);
        drop(guard);
        assert_eq!(pool.busy_count(), 0);
        let guard = pool.get(&t, "second").unwrap();
        assert_eq!(guard.serial, 1);
    }

    #[test]
    fn test_capacity_exhaustion_fails_fast_and_release_unblocks() {
        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let t = token("t");
        let g1 = pool.get(&t, "q1").unwrap();
        let _g2 = pool.get(&t, "q2").unwrap();
        let err = pool.get(&t, "q3").expect_err("pool is exhausted");
        assert!(matches!(err, PetrelError::EntryUnavailable { .. }));
        drop(g1);
        assert!(pool.get(&t, "q3").is_ok());
    }

    #[test]
    fn test_lock_reports_busy_holder_and_blocks_get() {
        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let t = token("t");
        let guard = pool.get(&t, "ingest").unwrap();
        assert_eq!(pool.lock(&t, "ddl"), Err("ingest".to_string()));
        drop(guard);
        assert_eq!(pool.lock(&t, "ddl"), Ok(()));
        let err = pool.get(&t, "reader").expect_err("entry is locked");
        assert!(matches!(err, PetrelError::EntryUnavailable { reason } if reason == "ddl"));
        pool.unlock(&t);
        assert!(pool.get(&t, "reader").is_ok());
    }

    #[test]
    fn test_release_inactive_reports_useful_work() {
        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let t = token("t");
        drop(pool.get(&t, "warmup").unwrap());
        assert!(pool.release_inactive(Duration::from_millis(0)));
        assert!(!pool.release_inactive(Duration::from_millis(0)));
    }

    #[test]
    fn test_release_all_reports_busy_resources() {
        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let t = token("t");
        let guard = pool.get(&t, "held").unwrap();
        drop(pool.get(&t, "idle").unwrap());
        assert!(!pool.release_all());
        drop(guard);
        assert!(pool.release_all());
    }

    #[test]
    fn test_listener_observes_balanced_get_and_return() {
        use crate::pool::{PoolEvent, PoolListener};
        use parking_lot::Mutex;
        use std::sync::Arc;

        #[derive(Default)]
        struct EventLog(Mutex<Vec<PoolEvent>>);

        impl PoolListener for EventLog {
            fn on_event(&self, _pool: &'static str, event: PoolEvent, _token: &TableToken) {
                self.0.lock().push(event);
            }
        }

        let pool = ResourcePool::new("Test", 2, CountingFactory);
        let log = Arc::new(EventLog::default());
        pool.set_listener(Some(log.clone()));

        let t = token("t");
        drop(pool.get(&t, "first").unwrap());
        drop(pool.get(&t, "second").unwrap());

        let events = log.0.lock();
        let gets = events.iter().filter(|e| **e == PoolEvent::Get).count();
        let returns = events.iter().filter(|e| **e == PoolEvent::Return).count();
        let creates = events.iter().filter(|e| **e == PoolEvent::Create).count();
        assert_eq!(gets, 2);
        assert_eq!(returns, 2, "no leaked resources");
        assert_eq!(creates, 1, "second get recycled the resource");
    }
}

#[cfg(test)]
mod message_bus_tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use petrel_common::types::{TableId, TableToken};

    use crate::message_bus::{publish_wal_txn, MessageBus, RingQueue, CURSOR_FULL};

    fn token(name: &str) -> TableToken {
        TableToken::new(name, name, TableId(3), true, false)
    }

    #[test]
    fn test_ring_queue_claims_and_consumes_in_order() {
        let queue: RingQueue<u32> = RingQueue::new(4);
        for i in 0..4 {
            let cursor = queue.next();
            assert!(cursor >= 0);
            queue.set(cursor, i);
            queue.done(cursor);
        }
        assert_eq!(queue.next(), CURSOR_FULL);
        assert_eq!(queue.try_consume(), Some(0));
        assert!(queue.next() >= 0);
        assert_eq!(queue.try_consume(), Some(1));
        assert_eq!(queue.try_consume(), Some(2));
    }

    #[test]
    fn test_consumer_waits_for_done() {
        let queue: RingQueue<u32> = RingQueue::new(2);
        let cursor = queue.next();
        queue.set(cursor, 9);
        // not yet published
        assert_eq!(queue.try_consume(), None);
        queue.done(cursor);
        assert_eq!(queue.try_consume(), Some(9));
    }

    #[test]
    fn test_full_queue_bumps_unpublished_count_instead_of_dropping() {
        let bus = MessageBus::new(2, 2);
        let unpublished = AtomicI64::new(1);
        let t = token("q");
        assert!(publish_wal_txn(&bus, &unpublished, &t));
        assert!(publish_wal_txn(&bus, &unpublished, &t));
        assert!(!publish_wal_txn(&bus, &unpublished, &t));
        assert_eq!(unpublished.load(Ordering::Acquire), 2);
        // the queued entries are intact
        assert!(bus.wal_txn_notifications.try_consume().is_some());
        assert!(bus.wal_txn_notifications.try_consume().is_some());
        assert!(bus.wal_txn_notifications.try_consume().is_none());
    }
}

#[cfg(test)]
mod registry_tests {
    use petrel_common::types::TableId;

    use crate::fs::FilesFacade;
    use crate::metadata::overwrite_table_name_file;
    use crate::registry::{RegistryEntry, TableNameRegistry};

    fn open(dir: &std::path::Path) -> TableNameRegistry {
        TableNameRegistry::open(FilesFacade, dir.to_path_buf()).unwrap()
    }

    #[test]
    fn test_lock_register_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path());

        let token = registry
            .lock_table_name("trades", "trades~1", TableId(1), false, true)
            .unwrap();
        // locked is reserved, not live
        assert!(registry.get_token("trades").is_none());
        assert!(matches!(
            registry.get_entry("trades"),
            Some(RegistryEntry::Locked(_))
        ));
        // second lock conflicts
        assert!(registry
            .lock_table_name("trades", "trades~2", TableId(2), false, true)
            .is_none());

        registry.register_name(&token).unwrap();
        assert_eq!(registry.get_token("trades").unwrap(), token);
        assert_eq!(registry.get_token_by_dir_name("trades~1").unwrap(), token);
    }

    #[test]
    fn test_unlock_rolls_back_failed_create() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path());
        let token = registry
            .lock_table_name("t", "t", TableId(1), false, false)
            .unwrap();
        registry.unlock_table_name(&token);
        assert!(registry.get_entry("t").is_none());
    }

    #[test]
    fn test_drop_moves_to_locked_drop_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path());
        let token = registry
            .lock_table_name("t", "t~1", TableId(1), false, true)
            .unwrap();
        registry.register_name(&token).unwrap();

        assert!(registry.drop_table(&token).unwrap());
        assert!(registry.is_table_dropped(&token));
        assert!(registry.get_token("t").is_none());
        // double drop is not the owner
        assert!(!registry.drop_table(&token).unwrap());

        registry.purge_token(&token);
        assert!(registry.get_entry("t").is_none());
    }

    #[test]
    fn test_reload_replays_persisted_operations() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = open(dir.path());
            let a = registry
                .lock_table_name("a", "a~1", TableId(1), false, true)
                .unwrap();
            registry.register_name(&a).unwrap();
            let b = registry
                .lock_table_name("b", "b~2", TableId(2), false, true)
                .unwrap();
            registry.register_name(&b).unwrap();
            registry.drop_table(&b).unwrap();
        }
        let registry = open(dir.path());
        assert!(registry.get_token("a").is_some());
        assert!(registry.get_token("b").is_none());
        assert_eq!(registry.table_count(false), 1);
    }

    #[test]
    fn test_rename_swings_name_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = open(dir.path());
            let old = registry
                .lock_table_name("x", "x~1", TableId(1), false, true)
                .unwrap();
            registry.register_name(&old).unwrap();
            let new = registry.add_table_alias("y", &old).unwrap();
            registry.rename(&old, &new).unwrap();
            assert!(registry.get_token("x").is_none());
            assert_eq!(registry.get_token("y").unwrap().dir_name(), "x~1");
        }
        let registry = open(dir.path());
        assert!(registry.get_token("x").is_none());
        assert!(registry.get_token("y").is_some());
    }

    #[test]
    fn test_reconcile_prefers_name_file_winner_for_duplicate_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path());
        let old = registry
            .lock_table_name("x", "x~1", TableId(1), false, true)
            .unwrap();
        registry.register_name(&old).unwrap();
        // crash window: alias installed, old name never removed
        registry.add_table_alias("y", &old).unwrap();

        let table_dir = dir.path().join("x~1");
        FilesFacade.mkdirs(&table_dir).unwrap();
        overwrite_table_name_file(FilesFacade, &table_dir, "y").unwrap();

        registry.reconcile().unwrap();
        assert!(registry.get_token("x").is_none());
        assert_eq!(registry.get_token("y").unwrap().dir_name(), "x~1");

        // compacted file round-trips
        let reloaded = open(dir.path());
        assert!(reloaded.get_token("x").is_none());
        assert!(reloaded.get_token("y").is_some());
    }
}

#[cfg(test)]
mod sequencer_tests {
    use std::time::Duration;

    use petrel_common::error::PetrelError;
    use petrel_common::types::{TableId, TableToken};

    use crate::fs::FilesFacade;
    use crate::metadata::{ColumnMeta, TableMeta};
    use crate::sequencer::{TableSequencerApi, TxnLocation};

    fn wal_token(name: &str) -> TableToken {
        TableToken::new(name, format!("{name}~1"), TableId(1), true, false)
    }

    fn meta() -> TableMeta {
        TableMeta {
            table_id: TableId(1),
            metadata_version: 0,
            partition_by: petrel_common::types::PartitionBy::Day,
            timestamp_index: 0,
            is_wal: true,
            is_mat_view: false,
            columns: vec![ColumnMeta {
                name: "ts".to_string(),
                col_type: petrel_common::types::ColumnType::Timestamp,
            }],
        }
    }

    #[test]
    fn test_txn_allocation_persists_locations() {
        let dir = tempfile::tempdir().unwrap();
        let api = TableSequencerApi::new(FilesFacade, dir.path().to_path_buf());
        let token = wal_token("t");
        FilesFacade
            .mkdirs(&dir.path().join(token.dir_name()))
            .unwrap();
        api.register_table(&token, &meta()).unwrap();

        let loc1 = TxnLocation {
            wal_id: 0,
            segment_id: 0,
            segment_txn: 0,
        };
        let loc2 = TxnLocation {
            wal_id: 0,
            segment_id: 0,
            segment_txn: 1,
        };
        assert_eq!(api.next_txn(&token, loc1).unwrap(), 1);
        assert_eq!(api.next_txn(&token, loc2).unwrap(), 2);
        assert_eq!(api.txn_location(&token, 1).unwrap(), loc1);
        assert_eq!(api.txn_location(&token, 2).unwrap(), loc2);

        // a fresh api instance reads the persisted count
        let api2 = TableSequencerApi::new(FilesFacade, dir.path().to_path_buf());
        assert_eq!(api2.tracker(&token).unwrap().seq_txn(), 2);
        assert_eq!(api2.txn_location(&token, 2).unwrap(), loc2);
    }

    #[test]
    fn test_await_txn_returns_once_writer_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let api = TableSequencerApi::new(FilesFacade, dir.path().to_path_buf());
        let token = wal_token("t");
        FilesFacade
            .mkdirs(&dir.path().join(token.dir_name()))
            .unwrap();
        api.register_table(&token, &meta()).unwrap();
        api.next_txn(
            &token,
            TxnLocation {
                wal_id: 0,
                segment_id: 0,
                segment_txn: 0,
            },
        )
        .unwrap();

        api.update_writer_txns(&token, 1, 1);
        api.await_txn(&token, 1, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_await_txn_times_out_and_fails_fast_when_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let api = TableSequencerApi::new(FilesFacade, dir.path().to_path_buf());
        let token = wal_token("t");
        FilesFacade
            .mkdirs(&dir.path().join(token.dir_name()))
            .unwrap();
        api.register_table(&token, &meta()).unwrap();
        api.next_txn(
            &token,
            TxnLocation {
                wal_id: 0,
                segment_id: 0,
                segment_txn: 0,
            },
        )
        .unwrap();

        let err = api
            .await_txn(&token, 1, Duration::from_millis(30))
            .expect_err("writer never catches up");
        assert!(matches!(err, PetrelError::TxnTimeout { .. }));

        api.suspend(&token).unwrap();
        let err = api
            .await_txn(&token, 1, Duration::from_secs(10))
            .expect_err("suspended table fails fast");
        assert!(matches!(err, PetrelError::TableSuspended(_)));

        let err = api
            .next_txn(
                &token,
                TxnLocation {
                    wal_id: 0,
                    segment_id: 0,
                    segment_txn: 1,
                },
            )
            .expect_err("suspended table rejects writes");
        assert!(matches!(err, PetrelError::TableSuspended(_)));
    }
}
