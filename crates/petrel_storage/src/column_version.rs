//! Double-buffered on-disk index mapping `(partition, column)` to
//! `(column_name_txn, column_top)`.
//!
//! The `_cv` file carries a 48-byte header (a monotonic version word whose
//! parity selects the active of two `(offset, size)` areas) followed by
//! 32-byte records sorted by `(partition_timestamp, column_index)`. The
//! single writer serializes the whole record vector to the inactive area,
//! flushes, and only then publishes the bumped version; readers run a
//! seqlock loop and never observe a torn snapshot.

use std::path::Path;
use std::time::{Duration, Instant};

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{TimestampMicros, COL_TOP_DEFAULT_PARTITION};

use crate::fs::FilesFacade;
use crate::mem::{RoMem, RwMem};

/// Longs per record: partition timestamp, column index, name txn, column top.
pub const BLOCK_SIZE: usize = 4;
pub const BLOCK_SIZE_BYTES: usize = BLOCK_SIZE * 8;

pub const COLUMN_INDEX_OFFSET: usize = 1;
pub const COLUMN_NAME_TXN_OFFSET: usize = 2;
pub const COLUMN_TOP_OFFSET: usize = 3;

pub const OFFSET_VERSION_64: usize = 0;
pub const OFFSET_OFFSET_A_64: usize = 8;
pub const OFFSET_SIZE_A_64: usize = 16;
pub const OFFSET_OFFSET_B_64: usize = 24;
pub const OFFSET_SIZE_B_64: usize = 32;
pub const HEADER_SIZE: usize = 40 + 8;

const CV_PAGE_SIZE: usize = 16 * 1024;

/// Packed record vector shared by reader and writer: `BLOCK_SIZE` longs per
/// record, sorted by `(partition_timestamp, column_index)`.
#[derive(Debug, Default, Clone)]
pub struct ColumnVersionList {
    longs: Vec<i64>,
}

impl ColumnVersionList {
    pub fn record_count(&self) -> usize {
        self.longs.len() / BLOCK_SIZE
    }

    pub fn longs(&self) -> &[i64] {
        &self.longs
    }

    pub fn clear(&mut self) {
        self.longs.clear();
    }

    /// Index (in longs) of the record for `(partition_timestamp,
    /// column_index)`: binary search locates the partition's block, then a
    /// short ordered scan finds the column. Returns -1 when absent.
    pub fn record_index(&self, partition_timestamp: TimestampMicros, column_index: i32) -> isize {
        let n = self.record_count();
        if n == 0 {
            return -1;
        }
        // Find the first block whose timestamp >= partition_timestamp.
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) >> 1;
            if self.longs[mid * BLOCK_SIZE] < partition_timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut i = lo * BLOCK_SIZE;
        while i < self.longs.len() && self.longs[i] == partition_timestamp {
            let this_index = self.longs[i + COLUMN_INDEX_OFFSET];
            if this_index == column_index as i64 {
                return i as isize;
            }
            if this_index > column_index as i64 {
                break;
            }
            i += BLOCK_SIZE;
        }
        -1
    }

    /// Inserts or updates the record, keeping the vector sorted.
    pub fn upsert(
        &mut self,
        partition_timestamp: TimestampMicros,
        column_index: i32,
        column_name_txn: i64,
        column_top: i64,
    ) {
        let at = self.record_index(partition_timestamp, column_index);
        if at >= 0 {
            let at = at as usize;
            self.longs[at + COLUMN_NAME_TXN_OFFSET] = column_name_txn;
            self.longs[at + COLUMN_TOP_OFFSET] = column_top;
            return;
        }
        let mut insert = self.longs.len();
        let mut i = 0;
        while i < self.longs.len() {
            let ts = self.longs[i];
            let ci = self.longs[i + COLUMN_INDEX_OFFSET];
            if ts > partition_timestamp || (ts == partition_timestamp && ci > column_index as i64) {
                insert = i;
                break;
            }
            i += BLOCK_SIZE;
        }
        self.longs.splice(
            insert..insert,
            [
                partition_timestamp,
                column_index as i64,
                column_name_txn,
                column_top,
            ],
        );
    }

    pub fn remove_partition(&mut self, partition_timestamp: TimestampMicros) {
        let mut i = 0;
        while i < self.longs.len() {
            if self.longs[i] == partition_timestamp {
                self.longs.drain(i..i + BLOCK_SIZE);
            } else {
                i += BLOCK_SIZE;
            }
        }
    }

    fn column_top_by_index(&self, record_index: isize) -> i64 {
        if record_index >= 0 {
            self.longs[record_index as usize + COLUMN_TOP_OFFSET]
        } else {
            0
        }
    }

    /// Column top for `(partition, column)`, or -1 when the column does not
    /// exist in the partition. Falls back to the column's introduction
    /// partition: introduced at or before the requested partition means the
    /// column is fully present (top 0).
    pub fn column_top(&self, partition_timestamp: TimestampMicros, column_index: i32) -> i64 {
        let at = self.record_index(partition_timestamp, column_index);
        if at >= 0 {
            return self.longs[at as usize + COLUMN_TOP_OFFSET];
        }
        if self.column_top_partition_timestamp(column_index) <= partition_timestamp {
            0
        } else {
            -1
        }
    }

    /// Like [`column_top`](Self::column_top) but without the existence
    /// check; absent records read as 0.
    pub fn column_top_quick(&self, partition_timestamp: TimestampMicros, column_index: i32) -> i64 {
        self.column_top_by_index(self.record_index(partition_timestamp, column_index))
    }

    /// The partition in which the column first appeared, or `i64::MIN` when
    /// it has existed since table creation. Stored in the column-top slot of
    /// the default-partition record.
    pub fn column_top_partition_timestamp(&self, column_index: i32) -> TimestampMicros {
        let at = self.record_index(COL_TOP_DEFAULT_PARTITION, column_index);
        if at >= 0 {
            self.longs[at as usize + COLUMN_TOP_OFFSET]
        } else {
            i64::MIN
        }
    }

    pub fn column_name_txn(&self, partition_timestamp: TimestampMicros, column_index: i32) -> i64 {
        let at = self.record_index(partition_timestamp, column_index);
        if at >= 0 {
            self.longs[at as usize + COLUMN_NAME_TXN_OFFSET]
        } else {
            self.default_column_name_txn(column_index)
        }
    }

    pub fn default_column_name_txn(&self, column_index: i32) -> i64 {
        let at = self.record_index(COL_TOP_DEFAULT_PARTITION, column_index);
        if at >= 0 {
            self.longs[at as usize + COLUMN_NAME_TXN_OFFSET]
        } else {
            -1
        }
    }

    /// Highest name txn among the partition's records, -1 when none.
    pub fn max_partition_version(&self, partition_timestamp: TimestampMicros) -> i64 {
        let mut max = -1i64;
        let mut i = 0;
        while i < self.longs.len() {
            if self.longs[i] == partition_timestamp {
                max = max.max(self.longs[i + COLUMN_NAME_TXN_OFFSET]);
            }
            i += BLOCK_SIZE;
        }
        max
    }
}

/// Writer half: owned by the single table writer. Mutations accumulate in
/// the cached list until [`commit`](Self::commit) publishes them.
pub struct ColumnVersionWriter {
    mem: RwMem,
    list: ColumnVersionList,
    version: i64,
}

impl ColumnVersionWriter {
    pub fn open(ff: FilesFacade, path: &Path) -> PetrelResult<Self> {
        let fresh = !ff.exists(path) || ff.file_len(path)? < HEADER_SIZE as u64;
        let mut mem = RwMem::open(ff, path, CV_PAGE_SIZE)?;
        let mut writer = if fresh {
            mem.put_i64_at(OFFSET_VERSION_64, 0)?;
            mem.put_i64_at(OFFSET_OFFSET_A_64, HEADER_SIZE as i64)?;
            mem.put_i64_at(OFFSET_SIZE_A_64, 0)?;
            mem.put_i64_at(OFFSET_OFFSET_B_64, HEADER_SIZE as i64)?;
            mem.put_i64_at(OFFSET_SIZE_B_64, 0)?;
            Self {
                mem,
                list: ColumnVersionList::default(),
                version: 0,
            }
        } else {
            let version = mem.get_i64_at(OFFSET_VERSION_64);
            let (off, size) = if version & 1 == 0 {
                (
                    mem.get_i64_at(OFFSET_OFFSET_A_64),
                    mem.get_i64_at(OFFSET_SIZE_A_64),
                )
            } else {
                (
                    mem.get_i64_at(OFFSET_OFFSET_B_64),
                    mem.get_i64_at(OFFSET_SIZE_B_64),
                )
            };
            let mut list = ColumnVersionList::default();
            read_area(&mut list, off as usize, size as usize, |o| mem.get_i64_at(o));
            Self { mem, list, version }
        };
        if fresh {
            writer.mem.sync(false)?;
        }
        Ok(writer)
    }

    pub fn list(&self) -> &ColumnVersionList {
        &self.list
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn upsert(
        &mut self,
        partition_timestamp: TimestampMicros,
        column_index: i32,
        column_name_txn: i64,
        column_top: i64,
    ) {
        self.list
            .upsert(partition_timestamp, column_index, column_name_txn, column_top);
    }

    /// Records the partition in which `column_index` was first added.
    pub fn upsert_column_added(&mut self, column_index: i32, partition_timestamp: TimestampMicros) {
        self.list
            .upsert(COL_TOP_DEFAULT_PARTITION, column_index, -1, partition_timestamp);
    }

    pub fn remove_partition(&mut self, partition_timestamp: TimestampMicros) {
        self.list.remove_partition(partition_timestamp);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    /// Serializes the record vector to the inactive area, flushes it, then
    /// publishes the flipped-parity version. Version strictly increases
    /// by 1 per successful commit.
    pub fn commit(&mut self) -> PetrelResult<()> {
        let next_version = self.version + 1;
        let area_a = next_version & 1 == 0;
        let size = self.list.longs().len() * 8;

        // The active area (current parity) must stay intact until the new
        // version is published; the same-parity slot is reused when the new
        // extent would not overlap the active one, otherwise the write
        // leapfrogs past it.
        let (same_offset, active_offset, active_size) = if area_a {
            (
                self.mem.get_i64_at(OFFSET_OFFSET_A_64) as usize,
                self.mem.get_i64_at(OFFSET_OFFSET_B_64) as usize,
                self.mem.get_i64_at(OFFSET_SIZE_B_64) as usize,
            )
        } else {
            (
                self.mem.get_i64_at(OFFSET_OFFSET_B_64) as usize,
                self.mem.get_i64_at(OFFSET_OFFSET_A_64) as usize,
                self.mem.get_i64_at(OFFSET_SIZE_A_64) as usize,
            )
        };
        let active_end = active_offset + active_size;
        let offset = if same_offset + size <= active_offset || same_offset >= active_end {
            same_offset.max(HEADER_SIZE)
        } else {
            active_end
        };

        let mut p = offset;
        for &v in self.list.longs() {
            self.mem.put_i64_at(p, v)?;
            p += 8;
        }
        if area_a {
            self.mem.put_i64_at(OFFSET_OFFSET_A_64, offset as i64)?;
            self.mem.put_i64_at(OFFSET_SIZE_A_64, size as i64)?;
        } else {
            self.mem.put_i64_at(OFFSET_OFFSET_B_64, offset as i64)?;
            self.mem.put_i64_at(OFFSET_SIZE_B_64, size as i64)?;
        }
        self.mem.sync(false)?;
        self.mem.put_i64_volatile_at(OFFSET_VERSION_64, next_version)?;
        self.mem.sync(false)?;
        self.version = next_version;
        tracing::debug!(version = next_version, records = self.list.record_count(), "column version committed");
        Ok(())
    }
}

/// Reader half: any number may exist per table. `read_safe` refreshes the
/// cached list using the seqlock protocol.
pub struct ColumnVersionReader {
    mem: RoMem,
    list: ColumnVersionList,
    version: i64,
}

impl ColumnVersionReader {
    pub fn open(ff: FilesFacade, path: &Path) -> PetrelResult<Self> {
        let mem = RoMem::open(ff, path)?;
        Ok(Self {
            mem,
            list: ColumnVersionList::default(),
            version: -1,
        })
    }

    pub fn list(&self) -> &ColumnVersionList {
        &self.list
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Seqlock read: load version, copy the parity-selected area, confirm
    /// the version did not move. Bounded by `spin_lock_timeout`; exhaustion
    /// is a critical failure.
    pub fn read_safe(&mut self, spin_lock_timeout: Duration) -> PetrelResult<()> {
        let start = Instant::now();
        loop {
            let v1 = self.mem.get_i64_volatile_at(OFFSET_VERSION_64);
            if v1 == self.version {
                return Ok(());
            }

            let (offset, size) = if v1 & 1 == 0 {
                (
                    self.mem.get_i64_at(OFFSET_OFFSET_A_64),
                    self.mem.get_i64_at(OFFSET_SIZE_A_64),
                )
            } else {
                (
                    self.mem.get_i64_at(OFFSET_OFFSET_B_64),
                    self.mem.get_i64_at(OFFSET_SIZE_B_64),
                )
            };

            if v1 == self.mem.get_i64_volatile_at(OFFSET_VERSION_64) {
                let (offset, size) = (offset as usize, size as usize);
                self.mem.resize(offset + size)?;
                if self.mem.len() >= offset + size {
                    read_area(&mut self.list, offset, size, |o| self.mem.get_i64_at(o));
                    if v1 == self.mem.get_i64_volatile_at(OFFSET_VERSION_64) {
                        self.version = v1;
                        tracing::debug!(version = v1, offset, size, "read clean column version");
                        return Ok(());
                    }
                }
            }

            if start.elapsed() > spin_lock_timeout {
                tracing::error!(timeout_ms = spin_lock_timeout.as_millis() as u64, "column version read timeout");
                return Err(PetrelError::critical(0, "column version read timeout"));
            }
            std::hint::spin_loop();
            tracing::debug!(version = v1, "read dirty column version, retrying");
        }
    }

    /// Single unguarded read; recovery paths use it when no writer can be
    /// live.
    pub fn read_unsafe(&mut self) -> PetrelResult<i64> {
        let version = self.mem.get_i64_volatile_at(OFFSET_VERSION_64);
        let (offset, size) = if version & 1 == 0 {
            (
                self.mem.get_i64_at(OFFSET_OFFSET_A_64),
                self.mem.get_i64_at(OFFSET_SIZE_A_64),
            )
        } else {
            (
                self.mem.get_i64_at(OFFSET_OFFSET_B_64),
                self.mem.get_i64_at(OFFSET_SIZE_B_64),
            )
        };
        let (offset, size) = (offset as usize, size as usize);
        self.mem.resize(offset + size)?;
        read_area(&mut self.list, offset, size, |o| self.mem.get_i64_at(o));
        self.version = version;
        Ok(version)
    }
}

fn read_area(list: &mut ColumnVersionList, offset: usize, size: usize, get: impl Fn(usize) -> i64) {
    debug_assert!(size % BLOCK_SIZE_BYTES == 0);
    list.longs.clear();
    list.longs.reserve(size / 8);
    let mut p = offset;
    let lim = offset + size;
    while p < lim {
        list.longs.push(get(p));
        p += 8;
    }
}
