//! Engine facade: composes the pools, registry, sequencer, message bus,
//! checkpoint agent and mat-view graph, and owns the lock ordering every
//! DDL path follows.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use petrel_common::config::EngineConfig;
use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{TableId, TableToken};

use crate::checkpoint::{
    CheckpointAgent, CheckpointManifest, CheckpointTableEntry, REASON_CHECKPOINT_IN_PROGRESS,
};
use crate::fs::FilesFacade;
use crate::mat_view::{MatViewGraph, MatViewGraphImpl, NoOpMatViewGraph};
use crate::message_bus::{publish_wal_txn, MessageBus, WriterCommand};
use crate::metadata::{
    SequencerMetadata, SequencerMetadataFactory, TableMetadata, TableMetadataFactory, TxnFile,
};
use crate::pool::{PoolGuard, PoolListener, ResourcePool};
use crate::reader::{TableReader, TableReaderFactory};
use crate::registry::{RegistryEntry, TableNameRegistry};
use crate::sequencer::{TableSequencerApi, UNINITIALIZED_TXN};
use crate::wal::writer::{WalWriter, WalWriterFactory};
use crate::writer::{TableWriter, TableWriterFactory};
use crate::TAB_INDEX_FILE_NAME;

pub use crate::engine_ddl::TableStructure;

pub const REASON_BUSY_READER: &str = "busyReader";
pub const REASON_BUSY_SEQUENCER_METADATA_POOL: &str = "busySequencerMetaPool";
pub const REASON_BUSY_TABLE_READER_METADATA_POOL: &str = "busyTableReaderMetaPool";

pub type WriterPool = ResourcePool<TableWriter>;
pub type ReaderPool = ResourcePool<TableReader>;
pub type TableMetadataPool = ResourcePool<TableMetadata>;
pub type SequencerMetadataPool = ResourcePool<SequencerMetadata>;
pub type WalWriterPool = ResourcePool<WalWriter>;

/// Persistent table-id generator backed by the `_tab_index` file.
pub(crate) struct TableIdGenerator {
    ff: FilesFacade,
    file: Mutex<File>,
    next: AtomicI32,
}

impl TableIdGenerator {
    fn open(ff: FilesFacade, db_root: &Path) -> PetrelResult<Self> {
        let path = db_root.join(TAB_INDEX_FILE_NAME);
        let fresh = !ff.exists(&path);
        let file = ff.open_rw(&path)?;
        let next = if fresh {
            ff.write_at(&file, &1i32.to_le_bytes(), 0)?;
            1
        } else {
            let mut buf = [0u8; 4];
            ff.read_at(&file, &mut buf, 0)?;
            i32::from_le_bytes(buf)
        };
        Ok(Self {
            ff,
            file: Mutex::new(file),
            next: AtomicI32::new(next),
        })
    }

    fn next_id(&self) -> PetrelResult<TableId> {
        let id = self.next.fetch_add(1, Ordering::AcqRel);
        let file = self.file.lock();
        self.ff.write_at(&file, &(id + 1).to_le_bytes(), 0)?;
        self.ff.fdatasync(&file)?;
        Ok(TableId(id))
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    ff: FilesFacade,
    bus: Arc<MessageBus>,
    registry: TableNameRegistry,
    sequencer: Arc<TableSequencerApi>,
    checkpoint: CheckpointAgent,
    mat_views: Arc<dyn MatViewGraph>,
    writer_pool: Arc<WriterPool>,
    reader_pool: Arc<ReaderPool>,
    table_metadata_pool: Arc<TableMetadataPool>,
    sequencer_metadata_pool: Arc<SequencerMetadataPool>,
    wal_writer_pool: Arc<WalWriterPool>,
    table_id_generator: TableIdGenerator,
    pub(crate) create_table_lock: DashMap<String, TableToken>,
    /// Starts at 1 so the apply job's first run rescans every table for
    /// WAL txns committed before this process started.
    unpublished_wal_txn_count: Arc<AtomicI64>,
    command_correlation_id: AtomicI64,
}

impl Engine {
    pub fn open(config: EngineConfig) -> PetrelResult<Arc<Self>> {
        let config = Arc::new(config);
        let ff = FilesFacade;
        ff.mkdirs(&config.db_root)?;

        let bus = Arc::new(MessageBus::new(
            config.wal_txn_notification_queue_capacity,
            config.writer_command_queue_capacity,
        ));
        let sequencer = Arc::new(TableSequencerApi::new(ff, config.db_root.clone()));
        let unpublished = Arc::new(AtomicI64::new(1));

        let writer_pool = ResourcePool::new(
            "Writer",
            1,
            TableWriterFactory {
                ff,
                db_root: config.db_root.clone(),
            },
        );
        let reader_pool = ResourcePool::new(
            "Reader",
            config.reader_pool_capacity,
            TableReaderFactory {
                ff,
                db_root: config.db_root.clone(),
                spin_lock_timeout: Duration::from_millis(config.spin_lock_timeout_ms),
            },
        );
        let table_metadata_pool = ResourcePool::new(
            "TableMetadata",
            config.metadata_pool_capacity,
            TableMetadataFactory {
                ff,
                db_root: config.db_root.clone(),
            },
        );
        let sequencer_metadata_pool = ResourcePool::new(
            "SequencerMetadata",
            config.metadata_pool_capacity,
            SequencerMetadataFactory {
                ff,
                db_root: config.db_root.clone(),
            },
        );
        let wal_writer_pool = ResourcePool::new(
            "WalWriter",
            config.wal_writer_pool_capacity,
            WalWriterFactory {
                ff,
                config: Arc::clone(&config),
                sequencer: Arc::clone(&sequencer),
                bus: Arc::clone(&bus),
                unpublished: Arc::clone(&unpublished),
            },
        );

        let checkpoint = CheckpointAgent::new(ff, config.db_root.clone());
        checkpoint.recover()?;

        let registry = TableNameRegistry::open(ff, config.db_root.clone())?;
        registry.reconcile()?;

        let mat_views: Arc<dyn MatViewGraph> = if config.mat_views_enabled {
            Arc::new(MatViewGraphImpl::new())
        } else {
            Arc::new(NoOpMatViewGraph)
        };

        let table_id_generator = TableIdGenerator::open(ff, &config.db_root)?;

        let engine = Arc::new(Self {
            config,
            ff,
            bus,
            registry,
            sequencer,
            checkpoint,
            mat_views,
            writer_pool,
            reader_pool,
            table_metadata_pool,
            sequencer_metadata_pool,
            wal_writer_pool,
            table_id_generator,
            create_table_lock: DashMap::new(),
            unpublished_wal_txn_count: unpublished,
            command_correlation_id: AtomicI64::new(0),
        });
        tracing::info!(db_root = %engine.config.db_root.display(), "engine opened");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn files(&self) -> FilesFacade {
        self.ff
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &TableNameRegistry {
        &self.registry
    }

    pub fn sequencer(&self) -> &Arc<TableSequencerApi> {
        &self.sequencer
    }

    pub fn mat_view_graph(&self) -> &Arc<dyn MatViewGraph> {
        &self.mat_views
    }

    pub fn next_table_id(&self) -> PetrelResult<TableId> {
        self.table_id_generator.next_id()
    }

    pub(crate) fn writer_pool(&self) -> &Arc<WriterPool> {
        &self.writer_pool
    }

    pub(crate) fn reader_pool(&self) -> &Arc<ReaderPool> {
        &self.reader_pool
    }

    pub(crate) fn table_metadata_pool(&self) -> &Arc<TableMetadataPool> {
        &self.table_metadata_pool
    }

    pub(crate) fn sequencer_metadata_pool(&self) -> &Arc<SequencerMetadataPool> {
        &self.sequencer_metadata_pool
    }

    pub fn set_pool_listener(&self, listener: Option<Arc<dyn PoolListener>>) {
        self.writer_pool.set_listener(listener.clone());
        self.reader_pool.set_listener(listener.clone());
        self.table_metadata_pool.set_listener(listener.clone());
        self.sequencer_metadata_pool.set_listener(listener.clone());
        self.wal_writer_pool.set_listener(listener);
    }

    // ── Name and token verification ──────────────────────────────────

    /// Resolves a name to its live token, reporting reserved and dropped
    /// states distinctly.
    pub fn verify_table_name(&self, table_name: &str) -> PetrelResult<TableToken> {
        match self.registry.get_entry(table_name) {
            None => Err(PetrelError::TableDoesNotExist(table_name.to_string())),
            Some(RegistryEntry::Locked(_)) => {
                Err(PetrelError::NameReserved(table_name.to_string()))
            }
            Some(RegistryEntry::LockedDrop(_)) => {
                Err(PetrelError::TableDoesNotExist(table_name.to_string()))
            }
            Some(RegistryEntry::Live(token)) => Ok(token),
        }
    }

    pub fn get_table_token_if_exists(&self, table_name: &str) -> Option<TableToken> {
        self.registry.get_token(table_name)
    }

    /// Fails with `TableReferenceOutOfDate` when the caller's token no
    /// longer matches the registry's.
    pub fn verify_table_token(&self, token: &TableToken) -> PetrelResult<()> {
        let current = match self.registry.get_entry(token.table_name()) {
            Some(RegistryEntry::Live(t)) => t,
            _ => return Err(PetrelError::TableDoesNotExist(token.table_name().to_string())),
        };
        if &current != token {
            return Err(PetrelError::TableReferenceOutOfDate {
                table: token.table_name().to_string(),
                expected_id: token.table_id(),
                actual_id: current.table_id(),
                expected_version: -1,
                actual_version: -1,
            });
        }
        Ok(())
    }

    pub fn is_table_dropped(&self, token: &TableToken) -> bool {
        self.registry.is_table_dropped(token)
    }

    // ── Readers ──────────────────────────────────────────────────────

    pub fn get_reader(&self, token: &TableToken) -> PetrelResult<PoolGuard<TableReader>> {
        self.verify_table_token(token)?;
        self.reader_pool.get(token, "reader")
    }

    /// Reader pinned to a metadata version: a mismatch in either the table
    /// id or the version throws `TableReferenceOutOfDate` and the caller
    /// must recompile.
    pub fn get_reader_at_version(
        &self,
        token: &TableToken,
        metadata_version: i64,
    ) -> PetrelResult<PoolGuard<TableReader>> {
        let reader = self.get_reader(token)?;
        if (metadata_version > -1 && reader.metadata_version() != metadata_version)
            || reader.table_id() != token.table_id()
        {
            let err = PetrelError::TableReferenceOutOfDate {
                table: token.table_name().to_string(),
                expected_id: token.table_id(),
                actual_id: reader.table_id(),
                expected_version: metadata_version,
                actual_version: reader.metadata_version(),
            };
            drop(reader);
            return Err(err);
        }
        Ok(reader)
    }

    /// Reader open with one repair attempt: a failed open acquires the
    /// writer briefly (which runs recovery), then retries; failing that the
    /// original error is rethrown.
    pub fn get_reader_with_repair(
        &self,
        token: &TableToken,
    ) -> PetrelResult<PoolGuard<TableReader>> {
        self.verify_table_token(token)?;
        match self.reader_pool.get(token, "reader") {
            Ok(reader) => Ok(reader),
            // contention is not a broken table
            Err(e @ PetrelError::EntryUnavailable { .. }) => Err(e),
            Err(e) => {
                self.try_repair_table(token, e)?;
                match self.reader_pool.get(token, "reader") {
                    Ok(reader) => Ok(reader),
                    Err(e) => {
                        tracing::error!(table = %token, error = %e, "could not open reader");
                        Err(e)
                    }
                }
            }
        }
    }

    fn try_repair_table(&self, token: &TableToken, cause: PetrelError) -> PetrelResult<()> {
        tracing::info!(table = %token, cause = %cause, "starting table repair");
        match self.writer_pool.get(token, "repair") {
            Ok(writer) => {
                drop(writer);
                tracing::info!(table = %token, "table repair succeeded");
                Ok(())
            }
            Err(PetrelError::EntryUnavailable { .. }) => {
                // writer is busy, the table is being repaired by its owner
                Err(cause)
            }
            Err(e) => {
                tracing::error!(table = %token, error = %e, "table repair failed");
                Err(cause)
            }
        }
    }

    // ── Writers ──────────────────────────────────────────────────────

    pub fn get_writer(
        &self,
        token: &TableToken,
        lock_reason: &str,
    ) -> PetrelResult<PoolGuard<TableWriter>> {
        self.verify_table_token(token)?;
        self.writer_pool.get(token, lock_reason)
    }

    /// Writer acquisition without token verification; DDL internals use it
    /// while the registry entry is still locked.
    pub(crate) fn get_writer_unsafe(
        &self,
        token: &TableToken,
        lock_reason: &str,
    ) -> PetrelResult<PoolGuard<TableWriter>> {
        self.writer_pool.get(token, lock_reason)
    }

    pub fn get_wal_writer(&self, token: &TableToken) -> PetrelResult<PoolGuard<WalWriter>> {
        self.verify_table_token(token)?;
        self.wal_writer_pool.get(token, "walWriter")
    }

    /// Tries the writer; a busy writer gets the command serialized onto the
    /// async command queue instead. Returns the writer when acquired, or
    /// `None` after a successful enqueue.
    pub fn get_writer_or_publish_command(
        &self,
        token: &TableToken,
        cmd_type: i32,
        sql: &str,
    ) -> PetrelResult<Option<PoolGuard<TableWriter>>> {
        self.verify_table_token(token)?;
        match self.writer_pool.get(token, "asyncCommand") {
            Ok(writer) => Ok(Some(writer)),
            Err(PetrelError::EntryUnavailable { .. }) => {
                let command = WriterCommand {
                    cmd_type,
                    correlation_id: self.next_command_correlation_id(),
                    token: token.clone(),
                    sql: sql.to_string(),
                };
                loop {
                    let cursor = self.bus.writer_commands.next();
                    if cursor >= 0 {
                        self.bus.writer_commands.set(cursor, command);
                        self.bus.writer_commands.done(cursor);
                        return Ok(None);
                    }
                    if cursor == crate::message_bus::CURSOR_FULL {
                        return Err(PetrelError::entry_unavailable("writerCommandQueueFull"));
                    }
                    std::hint::spin_loop();
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn next_command_correlation_id(&self) -> i64 {
        self.command_correlation_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub fn get_table_metadata(
        &self,
        token: &TableToken,
    ) -> PetrelResult<PoolGuard<TableMetadata>> {
        self.verify_table_token(token)?;
        self.table_metadata_pool.get(token, "metadata")
    }

    pub fn get_sequencer_metadata(
        &self,
        token: &TableToken,
    ) -> PetrelResult<PoolGuard<SequencerMetadata>> {
        debug_assert!(token.is_wal());
        self.verify_table_token(token)?;
        self.sequencer_metadata_pool.get(token, "seqMetadata")
    }

    // ── Reader/metadata locking and the checkpoint barrier ───────────

    pub fn lock_readers(&self, token: &TableToken) -> Result<(), String> {
        if self.checkpoint.is_in_progress() {
            return Err(REASON_CHECKPOINT_IN_PROGRESS.to_string());
        }
        self.reader_pool.lock(token, REASON_BUSY_READER)
    }

    pub fn unlock_readers(&self, token: &TableToken) {
        self.reader_pool.unlock(token);
    }

    pub fn lock_readers_and_metadata(&self, token: &TableToken) -> Result<(), String> {
        if self.checkpoint.is_in_progress() {
            return Err(REASON_CHECKPOINT_IN_PROGRESS.to_string());
        }
        self.reader_pool.lock(token, REASON_BUSY_READER)?;
        if let Err(reason) = self
            .table_metadata_pool
            .lock(token, REASON_BUSY_TABLE_READER_METADATA_POOL)
        {
            self.reader_pool.unlock(token);
            return Err(reason);
        }
        Ok(())
    }

    pub fn unlock_readers_and_metadata(&self, token: &TableToken) {
        self.reader_pool.unlock(token);
        self.table_metadata_pool.unlock(token);
    }

    pub fn checkpoint_create(&self) -> PetrelResult<()> {
        let mut tables = Vec::new();
        for token in self.registry.table_tokens(false) {
            let txn = TxnFile::load(self.ff, &self.config.db_root.join(token.dir_name()))
                .map(|t| t.txn)
                .unwrap_or(0);
            tables.push(CheckpointTableEntry {
                table_name: token.table_name().to_string(),
                dir_name: token.dir_name().to_string(),
                txn,
            });
        }
        self.checkpoint.checkpoint_create(&CheckpointManifest { tables })
    }

    pub fn checkpoint_release(&self) -> PetrelResult<()> {
        self.checkpoint.checkpoint_release()
    }

    pub fn checkpoint_recover(&self) -> PetrelResult<()> {
        self.checkpoint.recover()
    }

    pub fn checkpoint_in_progress(&self) -> bool {
        self.checkpoint.is_in_progress()
    }

    // ── WAL notifications ────────────────────────────────────────────

    /// Publishes a committed-txn notification for the apply job. On a full
    /// queue the unpublished counter is bumped instead and `false`
    /// returned; the periodic rescan picks the txn up, the signal is never
    /// lost.
    pub fn notify_wal_txn_committed(&self, token: &TableToken) -> bool {
        publish_wal_txn(&self.bus, &self.unpublished_wal_txn_count, token)
    }

    /// Forces the next apply pass to rescan all tables.
    pub fn notify_wal_txn_republisher(&self, token: &TableToken) {
        self.sequencer
            .update_writer_txns(token, UNINITIALIZED_TXN, UNINITIALIZED_TXN);
        self.unpublished_wal_txn_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpublished_wal_txn_count(&self) -> i64 {
        self.unpublished_wal_txn_count.load(Ordering::Acquire)
    }

    pub(crate) fn take_unpublished_wal_txn_count(&self) -> i64 {
        self.unpublished_wal_txn_count.swap(0, Ordering::AcqRel)
    }

    // ── Txn waiting ──────────────────────────────────────────────────

    /// Waits until the table's applied txn catches up with `txn` (or with
    /// the sequencer's current txn when `txn < 0`).
    pub fn await_txn(&self, table_name: &str, txn: i64, timeout: Duration) -> PetrelResult<()> {
        let token = self.verify_table_name(table_name)?;
        self.sequencer.await_txn(&token, txn, timeout)
    }

    pub fn await_table(&self, table_name: &str, timeout: Duration) -> PetrelResult<()> {
        self.await_txn(table_name, UNINITIALIZED_TXN, timeout)
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// One idle-resource sweep across every pool. True when any resource
    /// was closed.
    pub fn release_inactive(&self) -> bool {
        let ttl = Duration::from_millis(self.config.inactive_ttl_ms);
        let mut useful = self.writer_pool.release_inactive(ttl);
        useful |= self.reader_pool.release_inactive(ttl);
        useful |= self.sequencer.release_inactive();
        useful |= self.sequencer_metadata_pool.release_inactive(ttl);
        useful |= self.table_metadata_pool.release_inactive(ttl);
        useful |= self.wal_writer_pool.release_inactive(ttl);
        useful
    }

    pub fn release_all(&self) -> bool {
        let b1 = self.reader_pool.release_all();
        let b2 = self.writer_pool.release_all();
        let b3 = self.sequencer.release_all();
        let b4 = self.sequencer_metadata_pool.release_all();
        let b5 = self.wal_writer_pool.release_all();
        let b6 = self.table_metadata_pool.release_all();
        b1 & b2 & b3 & b4 & b5 & b6
    }

    pub fn busy_reader_count(&self) -> usize {
        self.reader_pool.busy_count()
    }

    pub fn busy_writer_count(&self) -> usize {
        self.writer_pool.busy_count()
    }
}

/// Periodic idle-resource reaper; the host drives `run` from a worker
/// thread.
pub struct EngineMaintenanceJob {
    engine: Arc<Engine>,
    check_interval: Duration,
    last: Option<Instant>,
}

impl EngineMaintenanceJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        let check_interval = Duration::from_millis(engine.config.idle_check_interval_ms);
        Self {
            engine,
            check_interval,
            last: None,
        }
    }

    /// True when the sweep ran and freed something.
    pub fn run(&mut self) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.check_interval,
        };
        if !due {
            return false;
        }
        self.last = Some(now);
        self.engine.release_inactive()
    }
}
