//! Per-table sequencer: allocates monotone seq txns for WAL commits, maps
//! each one to its `(wal, segment, segment_txn)` location, and tracks
//! applied-vs-committed progress per table.
//!
//! `seq_txn` is the highest txn accepted by the sequencer, `writer_txn` the
//! highest applied to table storage; `seq_txn >= writer_txn` always. A
//! table suspends when apply fails; suspended tables reject writes and make
//! `await_txn` fail fast.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::TableToken;

use crate::fs::FilesFacade;
use crate::metadata::TableMeta;
use crate::SEQ_DIR_NAME;

pub const UNINITIALIZED_TXN: i64 = -1;

const TXNLOG_FILE_NAME: &str = "_txnlog";
const TXNLOG_FORMAT: i32 = 1;
const TXNLOG_HEADER_SIZE: u64 = 12;
const TXNLOG_ENTRY_SIZE: u64 = 12;

const MIN_SLEEP_MS: u64 = 10;
const MAX_SLEEP_MS: u64 = 250;

/// Location of one committed txn inside a table's WAL directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnLocation {
    pub wal_id: i32,
    pub segment_id: i32,
    pub segment_txn: i32,
}

#[derive(Debug, Default)]
pub struct SeqTxnTracker {
    seq_txn: AtomicI64,
    writer_txn: AtomicI64,
    suspended: AtomicBool,
}

impl SeqTxnTracker {
    fn new(seq_txn: i64) -> Self {
        Self {
            seq_txn: AtomicI64::new(seq_txn),
            writer_txn: AtomicI64::new(UNINITIALIZED_TXN),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn seq_txn(&self) -> i64 {
        self.seq_txn.load(Ordering::Acquire)
    }

    pub fn writer_txn(&self) -> i64 {
        self.writer_txn.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

/// Append-only `seq/_txnlog`: 12-byte header (format, txn count), then one
/// 12-byte entry per txn. Entry `n` locates seq txn `n + 1`.
struct TxnLog {
    file: File,
    count: i64,
}

impl TxnLog {
    fn open(ff: FilesFacade, seq_dir: &Path) -> PetrelResult<Self> {
        let path = seq_dir.join(TXNLOG_FILE_NAME);
        let fresh = !ff.exists(&path);
        let file = ff.open_rw(&path)?;
        if fresh {
            let mut header = [0u8; TXNLOG_HEADER_SIZE as usize];
            header[0..4].copy_from_slice(&TXNLOG_FORMAT.to_le_bytes());
            ff.write_at(&file, &header, 0)?;
            ff.fdatasync(&file)?;
            return Ok(Self { file, count: 0 });
        }
        let mut header = [0u8; TXNLOG_HEADER_SIZE as usize];
        ff.read_at(&file, &mut header, 0)
            .map_err(|_| PetrelError::CorruptFile {
                path: path.display().to_string(),
                reason: "short txn log header".to_string(),
            })?;
        let count = i64::from_le_bytes(header[4..12].try_into().unwrap());
        Ok(Self { file, count })
    }

    fn append(&mut self, ff: FilesFacade, location: TxnLocation) -> PetrelResult<i64> {
        let mut entry = [0u8; TXNLOG_ENTRY_SIZE as usize];
        entry[0..4].copy_from_slice(&location.wal_id.to_le_bytes());
        entry[4..8].copy_from_slice(&location.segment_id.to_le_bytes());
        entry[8..12].copy_from_slice(&location.segment_txn.to_le_bytes());
        let offset = TXNLOG_HEADER_SIZE + self.count as u64 * TXNLOG_ENTRY_SIZE;
        ff.write_at(&self.file, &entry, offset)?;
        ff.fdatasync(&self.file)?;
        self.count += 1;
        ff.write_at(&self.file, &self.count.to_le_bytes(), 4)?;
        ff.fdatasync(&self.file)?;
        Ok(self.count)
    }

    fn location(&self, ff: FilesFacade, seq_txn: i64) -> PetrelResult<TxnLocation> {
        let mut entry = [0u8; TXNLOG_ENTRY_SIZE as usize];
        let offset = TXNLOG_HEADER_SIZE + (seq_txn - 1) as u64 * TXNLOG_ENTRY_SIZE;
        ff.read_at(&self.file, &mut entry, offset)?;
        Ok(TxnLocation {
            wal_id: i32::from_le_bytes(entry[0..4].try_into().unwrap()),
            segment_id: i32::from_le_bytes(entry[4..8].try_into().unwrap()),
            segment_txn: i32::from_le_bytes(entry[8..12].try_into().unwrap()),
        })
    }
}

pub struct TableSequencerApi {
    ff: FilesFacade,
    db_root: PathBuf,
    trackers: DashMap<String, Arc<SeqTxnTracker>>,
    txn_logs: DashMap<String, Arc<Mutex<TxnLog>>>,
    next_wal_id: DashMap<String, AtomicI32>,
}

impl TableSequencerApi {
    pub fn new(ff: FilesFacade, db_root: PathBuf) -> Self {
        Self {
            ff,
            db_root,
            trackers: DashMap::new(),
            txn_logs: DashMap::new(),
            next_wal_id: DashMap::new(),
        }
    }

    fn seq_dir(&self, token: &TableToken) -> PathBuf {
        self.db_root.join(token.dir_name()).join(SEQ_DIR_NAME)
    }

    fn txn_log(&self, token: &TableToken) -> PetrelResult<Arc<Mutex<TxnLog>>> {
        if let Some(log) = self.txn_logs.get(token.dir_name()) {
            return Ok(Arc::clone(&log));
        }
        // A racing open loses to whichever entry landed first; there must
        // never be two handles appending to one txn log.
        let log = Arc::new(Mutex::new(TxnLog::open(self.ff, &self.seq_dir(token))?));
        let entry = self
            .txn_logs
            .entry(token.dir_name().to_string())
            .or_insert(log);
        Ok(Arc::clone(&entry))
    }

    /// Creates the `seq/` directory, the schema copy the sequencer metadata
    /// pool serves, and an empty txn log.
    pub fn register_table(&self, token: &TableToken, meta: &TableMeta) -> PetrelResult<()> {
        let seq_dir = self.seq_dir(token);
        self.ff.mkdirs(&seq_dir)?;
        meta.store(self.ff, &seq_dir)?;
        let log = TxnLog::open(self.ff, &seq_dir)?;
        self.txn_logs
            .insert(token.dir_name().to_string(), Arc::new(Mutex::new(log)));
        self.trackers
            .insert(token.dir_name().to_string(), Arc::new(SeqTxnTracker::new(0)));
        tracing::info!(table = %token, "sequencer registered table");
        Ok(())
    }

    /// Removes the table's sequencer state and WAL directories. With
    /// `starting_up` the table directory itself is already being torn down
    /// by the failed create.
    pub fn drop_table(&self, token: &TableToken, starting_up: bool) -> PetrelResult<()> {
        self.txn_logs.remove(token.dir_name());
        self.trackers.remove(token.dir_name());
        self.next_wal_id.remove(token.dir_name());
        let table_dir = self.db_root.join(token.dir_name());
        if !starting_up && self.ff.exists(&table_dir) {
            for name in self.ff.list_dir(&table_dir)? {
                if name == SEQ_DIR_NAME || name.starts_with("wal") {
                    self.ff.unlink_or_remove(&table_dir.join(&name))?;
                }
            }
        }
        tracing::info!(table = %token, "sequencer dropped table");
        Ok(())
    }

    pub fn purge_txn_tracker(&self, dir_name: &str) {
        self.trackers.remove(dir_name);
    }

    /// The tracker for a table, seeding `seq_txn` from the persisted txn
    /// log on first access. `writer_txn` starts uninitialized so the apply
    /// job reconciles it against table storage.
    pub fn tracker(&self, token: &TableToken) -> PetrelResult<Arc<SeqTxnTracker>> {
        if let Some(t) = self.trackers.get(token.dir_name()) {
            return Ok(Arc::clone(&t));
        }
        let count = self.txn_log(token)?.lock().count;
        let entry = self
            .trackers
            .entry(token.dir_name().to_string())
            .or_insert_with(|| Arc::new(SeqTxnTracker::new(count)));
        Ok(Arc::clone(&entry))
    }

    /// Allocates the next WAL id for a new writer, scanning existing
    /// `wal<N>` directories once per table.
    pub fn next_wal_id(&self, token: &TableToken) -> PetrelResult<i32> {
        if let Some(counter) = self.next_wal_id.get(token.dir_name()) {
            return Ok(counter.fetch_add(1, Ordering::AcqRel));
        }
        let table_dir = self.db_root.join(token.dir_name());
        let mut max_id = 0;
        for name in self.ff.list_dir(&table_dir)? {
            if let Some(id) = name.strip_prefix("wal").and_then(|s| s.parse::<i32>().ok()) {
                max_id = max_id.max(id + 1);
            }
        }
        let counter = self
            .next_wal_id
            .entry(token.dir_name().to_string())
            .or_insert_with(|| AtomicI32::new(max_id));
        Ok(counter.fetch_add(1, Ordering::AcqRel))
    }

    /// Accepts a committed segment txn: appends its location to the txn log
    /// and returns the allocated seq txn.
    pub fn next_txn(&self, token: &TableToken, location: TxnLocation) -> PetrelResult<i64> {
        if self.is_suspended(token) {
            return Err(PetrelError::TableSuspended(token.table_name().to_string()));
        }
        let log = self.txn_log(token)?;
        let seq_txn = log.lock().append(self.ff, location)?;
        let tracker = self.tracker(token)?;
        tracker.seq_txn.store(seq_txn, Ordering::Release);
        Ok(seq_txn)
    }

    pub fn txn_location(&self, token: &TableToken, seq_txn: i64) -> PetrelResult<TxnLocation> {
        let log = self.txn_log(token)?;
        let log = log.lock();
        log.location(self.ff, seq_txn)
    }

    pub fn is_suspended(&self, token: &TableToken) -> bool {
        self.trackers
            .get(token.dir_name())
            .map(|t| t.is_suspended())
            .unwrap_or(false)
    }

    /// Marks the table as requiring manual intervention. Subsequent writes
    /// fail fast until [`resume`](Self::resume).
    pub fn suspend(&self, token: &TableToken) -> PetrelResult<()> {
        self.tracker(token)?
            .suspended
            .store(true, Ordering::Release);
        tracing::error!(table = %token, "table suspended");
        Ok(())
    }

    pub fn resume(&self, token: &TableToken) -> PetrelResult<()> {
        self.tracker(token)?
            .suspended
            .store(false, Ordering::Release);
        Ok(())
    }

    pub fn update_writer_txns(&self, token: &TableToken, writer_txn: i64, seq_txn: i64) {
        if let Some(tracker) = self.trackers.get(token.dir_name()) {
            tracker.writer_txn.store(writer_txn, Ordering::Release);
            if seq_txn != UNINITIALIZED_TXN {
                tracker.seq_txn.fetch_max(seq_txn, Ordering::AcqRel);
            }
        }
    }

    /// Polls until `writer_txn >= txn`, backing off 10ms → 250ms. Fails
    /// fast when the table suspends, times out at the deadline.
    pub fn await_txn(
        &self,
        token: &TableToken,
        txn: i64,
        timeout: Duration,
    ) -> PetrelResult<()> {
        let start = Instant::now();
        let mut sleep_ms = MIN_SLEEP_MS;
        loop {
            let tracker = self.tracker(token)?;
            let seq_txn = if txn > UNINITIALIZED_TXN {
                txn
            } else {
                tracker.seq_txn()
            };
            let writer_txn = tracker.writer_txn();
            if writer_txn >= seq_txn {
                return Ok(());
            }
            if tracker.is_suspended() {
                return Err(PetrelError::TableSuspended(token.table_name().to_string()));
            }
            if start.elapsed() >= timeout {
                return Err(PetrelError::TxnTimeout {
                    table: token.table_name().to_string(),
                    expected_txn: seq_txn,
                    writer_txn,
                });
            }
            std::thread::sleep(Duration::from_millis(sleep_ms));
            sleep_ms = (sleep_ms * 2).min(MAX_SLEEP_MS);
        }
    }

    /// Drops cached txn log handles; trackers stay. True when any handle
    /// was closed.
    pub fn release_inactive(&self) -> bool {
        let before = self.txn_logs.len();
        self.txn_logs.retain(|_, log| Arc::strong_count(log) > 1);
        self.txn_logs.len() < before
    }

    pub fn release_all(&self) -> bool {
        self.txn_logs.clear();
        self.next_wal_id.clear();
        true
    }
}
