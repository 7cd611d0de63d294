//! WAL event file: an append-only framed log of per-transaction events with
//! a sibling offset index.
//!
//! The `_event` file opens with a 12-byte header: highest committed txn
//! (i32), format version (i32), and the first record's length slot seeded
//! with -1. Each record is `len:i32, txn:i64, type:u8, payload` followed by
//! the next record's length slot, again seeded -1. A record only becomes
//! committed when its length slot is patched; replay treats `len <= 0` as
//! uncommitted and stops. The `_event.i` file carries one i64 per record:
//! the offset of that record's length slot.

use std::fs::File;
use std::io;
use std::path::Path;

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{CommitMode, TimestampMicros};

use crate::fs::{errno_of, FilesFacade};
use crate::mem::{RoMem, RwMem};
use crate::{EVENT_FILE_NAME, EVENT_INDEX_FILE_NAME};

use super::{
    END_OF_SYMBOL_DIFFS, END_OF_SYMBOL_ENTRIES, TXN_DATA, TXN_MAT_VIEW_DATA,
    TXN_MAT_VIEW_INVALIDATE, TXN_SQL, TXN_TRUNCATE, WALE_FORMAT_VERSION, WALE_HEADER_SIZE,
    WALE_MAT_VIEW_FORMAT_VERSION, WALE_MAX_TXN_OFFSET_32, WAL_FORMAT_OFFSET_32,
};

/// Bind-variable value, serialized with a leading type tag and one encoder
/// per tag.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    Timestamp(i64),
    Str(Option<String>),
}

impl BindValue {
    fn tag(&self) -> i32 {
        match self {
            BindValue::Bool(_) => 0,
            BindValue::Byte(_) => 1,
            BindValue::Short(_) => 2,
            BindValue::Char(_) => 3,
            BindValue::Int(_) => 4,
            BindValue::Long(_) => 5,
            BindValue::Float(_) => 6,
            BindValue::Double(_) => 7,
            BindValue::Date(_) => 8,
            BindValue::Timestamp(_) => 9,
            BindValue::Str(_) => 10,
        }
    }
}

/// Incremental dictionary diff for one symbol column: the symbols this txn
/// added on top of `initial_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMapDiff {
    pub column_index: i32,
    pub null_flag: bool,
    pub initial_count: i32,
    /// `(code, symbol)` pairs; only `code >= initial_count` entries are
    /// serialized.
    pub entries: Vec<(i32, String)>,
}

/// Fixed fields of a DATA record.
#[derive(Debug, Clone, PartialEq)]
pub struct DataInfo {
    pub start_row_id: i64,
    pub end_row_id: i64,
    pub min_timestamp: TimestampMicros,
    pub max_timestamp: TimestampMicros,
    pub out_of_order: bool,
    pub symbol_diffs: Vec<SymbolMapDiff>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalEventBody {
    Data(DataInfo),
    MatViewData {
        data: DataInfo,
        last_refresh_base_txn: i64,
        last_refresh_timestamp: TimestampMicros,
    },
    Sql {
        cmd_type: i32,
        sql: String,
        rnd_seed0: i64,
        rnd_seed1: i64,
        indexed_vars: Vec<BindValue>,
        named_vars: Vec<(String, BindValue)>,
    },
    Truncate,
    MatViewInvalidate {
        invalid: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalEventRecord {
    /// Segment-relative transaction number.
    pub txn: i64,
    pub body: WalEventBody,
}

/// Writer over one segment's `_event` and `_event.i` files.
pub struct WalEventWriter {
    ff: FilesFacade,
    mem: RwMem,
    index: File,
    commit_mode: CommitMode,
    start_offset: usize,
    txn: i32,
}

impl WalEventWriter {
    /// Opens (and resets) the event file pair in `segment_dir`: writes the
    /// header, seeds the index with the first length-slot offset, resets
    /// txn to 0.
    pub fn open(
        ff: FilesFacade,
        segment_dir: &Path,
        page_size: usize,
        commit_mode: CommitMode,
    ) -> PetrelResult<Self> {
        let mut mem = RwMem::open(ff, &segment_dir.join(EVENT_FILE_NAME), page_size)?;
        let index = ff.open_rw(&segment_dir.join(EVENT_INDEX_FILE_NAME))?;
        index.set_len(0)?;

        mem.jump_to(0);
        mem.put_i32(0)?;
        mem.put_i32(WALE_FORMAT_VERSION)?;
        mem.put_i32(-1)?;

        let mut writer = Self {
            ff,
            mem,
            index,
            commit_mode,
            start_offset: 0,
            txn: 0,
        };
        writer.append_index(WALE_HEADER_SIZE as i64)?;
        Ok(writer)
    }

    /// Bytes consumed by the event file, including any symbols.
    pub fn size(&self) -> usize {
        self.mem.append_offset()
    }

    pub fn txn(&self) -> i32 {
        self.txn
    }

    fn append_index(&mut self, value: i64) -> PetrelResult<()> {
        use std::io::Write;
        self.index.write_all(&value.to_le_bytes()).map_err(|e| {
            PetrelError::critical(
                errno_of(&e),
                format!("could not append WAL event index value [value={value}]"),
            )
        })
    }

    fn begin_record(&mut self, txn_type: u8) -> io::Result<()> {
        self.start_offset = self.mem.append_offset() - 4;
        self.mem.put_i64(self.txn as i64)?;
        self.mem.put_u8(txn_type)
    }

    /// Seals the record: appends the next length-slot placeholder, patches
    /// this record's length (the commit point), indexes it, and rewrites
    /// the header's max-txn slot. Returns the record's txn.
    fn end_record(&mut self) -> PetrelResult<i32> {
        let end_of_payload = self.mem.append_offset();
        self.mem.put_i32(-1)?;
        self.mem
            .put_i32_at(self.start_offset, (end_of_payload - self.start_offset) as i32)?;
        self.append_index(end_of_payload as i64)?;
        self.mem.put_i32_at(WALE_MAX_TXN_OFFSET_32, self.txn)?;
        let txn = self.txn;
        self.txn += 1;
        Ok(txn)
    }

    pub fn append_data(&mut self, info: &DataInfo) -> PetrelResult<i32> {
        self.append_data_record(TXN_DATA, info, None)
    }

    pub fn append_mat_view_data(
        &mut self,
        info: &DataInfo,
        last_refresh_base_txn: i64,
        last_refresh_timestamp: TimestampMicros,
    ) -> PetrelResult<i32> {
        self.append_data_record(
            TXN_MAT_VIEW_DATA,
            info,
            Some((last_refresh_base_txn, last_refresh_timestamp)),
        )
    }

    fn append_data_record(
        &mut self,
        txn_type: u8,
        info: &DataInfo,
        refresh: Option<(i64, TimestampMicros)>,
    ) -> PetrelResult<i32> {
        self.begin_record(txn_type)?;
        self.mem.put_i64(info.start_row_id)?;
        self.mem.put_i64(info.end_row_id)?;
        self.mem.put_i64(info.min_timestamp)?;
        self.mem.put_i64(info.max_timestamp)?;
        self.mem.put_bool(info.out_of_order)?;
        if let Some((base_txn, ts)) = refresh {
            self.mem.put_i64(base_txn)?;
            self.mem.put_i64(ts)?;
        }
        self.write_symbol_diffs(&info.symbol_diffs)?;
        let txn = self.end_record()?;
        if txn_type == TXN_MAT_VIEW_DATA {
            self.mem
                .put_i32_at(WAL_FORMAT_OFFSET_32, WALE_MAT_VIEW_FORMAT_VERSION)?;
        }
        Ok(txn)
    }

    pub fn append_sql(
        &mut self,
        cmd_type: i32,
        sql: &str,
        rnd_seed0: i64,
        rnd_seed1: i64,
        indexed_vars: &[BindValue],
        named_vars: &[(String, BindValue)],
    ) -> PetrelResult<i32> {
        self.begin_record(TXN_SQL)?;
        self.mem.put_i32(cmd_type)?;
        self.mem.put_str(Some(sql))?;
        self.mem.put_i64(rnd_seed0)?;
        self.mem.put_i64(rnd_seed1)?;
        self.mem.put_i32(indexed_vars.len() as i32)?;
        for v in indexed_vars {
            self.write_bind_value(v)?;
        }
        self.mem.put_i32(named_vars.len() as i32)?;
        for (name, v) in named_vars {
            self.mem.put_str(Some(name))?;
            self.write_bind_value(v)?;
        }
        self.end_record()
    }

    pub fn truncate(&mut self) -> PetrelResult<i32> {
        self.begin_record(TXN_TRUNCATE)?;
        self.end_record()
    }

    pub fn invalidate(&mut self, invalid: bool, reason: Option<&str>) -> PetrelResult<i32> {
        self.begin_record(TXN_MAT_VIEW_INVALIDATE)?;
        self.mem.put_bool(invalid)?;
        self.mem.put_str(reason)?;
        let txn = self.end_record()?;
        self.mem
            .put_i32_at(WAL_FORMAT_OFFSET_32, WALE_MAT_VIEW_FORMAT_VERSION)?;
        Ok(txn)
    }

    /// Invalidates the last record in place and rewinds the max-txn marker.
    /// The files are deliberately not truncated: an apply job may still be
    /// mmap-reading them. No further records are written after a rollback.
    pub fn rollback(&mut self) -> PetrelResult<()> {
        self.mem.put_i32_at(self.start_offset, -1)?;
        self.txn -= 1;
        self.mem.put_i32_at(WALE_MAX_TXN_OFFSET_32, self.txn - 1)?;
        Ok(())
    }

    /// Flushes per the configured commit mode: `Async` initiates writeback
    /// and fdatasyncs the index, `Sync` blocks on both.
    pub fn sync(&mut self) -> PetrelResult<()> {
        match self.commit_mode {
            CommitMode::NoSync => Ok(()),
            CommitMode::Async => {
                self.mem.sync(true)?;
                self.ff.fdatasync(&self.index)?;
                Ok(())
            }
            CommitMode::Sync => {
                self.mem.sync(false)?;
                self.ff.fdatasync(&self.index)?;
                Ok(())
            }
        }
    }

    fn write_bind_value(&mut self, v: &BindValue) -> io::Result<()> {
        self.mem.put_i32(v.tag())?;
        match v {
            BindValue::Bool(b) => self.mem.put_bool(*b),
            BindValue::Byte(b) => self.mem.put_u8(*b as u8),
            BindValue::Short(s) => self.mem.put_bytes(&s.to_le_bytes()),
            BindValue::Char(c) => self.mem.put_i32(*c as i32),
            BindValue::Int(i) => self.mem.put_i32(*i),
            BindValue::Long(l) => self.mem.put_i64(*l),
            BindValue::Float(f) => self.mem.put_f32(*f),
            BindValue::Double(d) => self.mem.put_f64(*d),
            BindValue::Date(d) => self.mem.put_i64(*d),
            BindValue::Timestamp(t) => self.mem.put_i64(*t),
            BindValue::Str(s) => self.mem.put_str(s.as_deref()),
        }
    }

    /// Emits one diff block per touched symbol column; only symbols added
    /// this txn (`code >= initial_count`) are written.
    fn write_symbol_diffs(&mut self, diffs: &[SymbolMapDiff]) -> io::Result<()> {
        for diff in diffs {
            if diff.initial_count > 0 || !diff.entries.is_empty() {
                self.mem.put_i32(diff.column_index)?;
                self.mem.put_bool(diff.null_flag)?;
                self.mem.put_i32(diff.initial_count)?;
                let count_offset = self.mem.append_offset();
                self.mem.put_i32(0)?;
                let mut written = 0;
                for (code, symbol) in &diff.entries {
                    if *code >= diff.initial_count {
                        self.mem.put_i32(*code)?;
                        self.mem.put_str(Some(symbol))?;
                        written += 1;
                    }
                }
                self.mem.put_i32_at(count_offset, written)?;
                self.mem.put_i32(END_OF_SYMBOL_ENTRIES)?;
            }
        }
        self.mem.put_i32(END_OF_SYMBOL_DIFFS)?;
        Ok(())
    }
}

/// Reader over a segment's committed event records.
pub struct WalEventReader {
    mem: RoMem,
    index: RoMem,
}

impl WalEventReader {
    pub fn open(ff: FilesFacade, segment_dir: &Path) -> PetrelResult<Self> {
        let mem = RoMem::open(ff, &segment_dir.join(EVENT_FILE_NAME))?;
        let index = RoMem::open(ff, &segment_dir.join(EVENT_INDEX_FILE_NAME))?;
        Ok(Self { mem, index })
    }

    /// Highest committed txn per the header, or -1 for an empty segment.
    pub fn max_txn(&self) -> i32 {
        if self.mem.len() < WALE_HEADER_SIZE {
            return -1;
        }
        let max = self.mem.get_i32_at(WALE_MAX_TXN_OFFSET_32);
        // A fresh header holds 0 before any record commits; disambiguate
        // via the first record's length slot.
        if max == 0 && self.mem.get_i32_at(WALE_HEADER_SIZE) <= 0 {
            -1
        } else {
            max
        }
    }

    pub fn format_version(&self) -> i32 {
        self.mem.get_i32_at(WAL_FORMAT_OFFSET_32)
    }

    /// Reads the record with segment-relative txn `segment_txn` via the
    /// index file. Returns `None` for a frame that was rolled back or never
    /// committed.
    pub fn read_record(&mut self, segment_txn: i32) -> PetrelResult<Option<WalEventRecord>> {
        let entry_offset = segment_txn as usize * 8;
        self.index.resize(entry_offset + 8)?;
        if self.index.len() < entry_offset + 8 {
            return Ok(None);
        }
        let len_slot = self.index.get_i64_at(entry_offset) as usize;
        self.mem.resize(len_slot + 4)?;
        if self.mem.len() < len_slot + 4 {
            return Ok(None);
        }
        let len = self.mem.get_i32_at(len_slot);
        if len <= 0 {
            return Ok(None);
        }
        self.mem.resize(len_slot + len as usize)?;
        self.decode_record(len_slot, len as usize).map(Some)
    }

    fn decode_record(&self, len_slot: usize, len: usize) -> PetrelResult<WalEventRecord> {
        let corrupt = |reason: &str| PetrelError::CorruptFile {
            path: self.mem.path().display().to_string(),
            reason: reason.to_string(),
        };
        let end = len_slot + len;
        let mut p = len_slot + 4;
        let txn = self.mem.get_i64_at(p);
        p += 8;
        let txn_type = self.mem.get_u8_at(p);
        p += 1;

        let body = match txn_type {
            TXN_DATA | TXN_MAT_VIEW_DATA => {
                let start_row_id = self.mem.get_i64_at(p);
                let end_row_id = self.mem.get_i64_at(p + 8);
                let min_timestamp = self.mem.get_i64_at(p + 16);
                let max_timestamp = self.mem.get_i64_at(p + 24);
                let out_of_order = self.mem.get_u8_at(p + 32) != 0;
                p += 33;
                let refresh = if txn_type == TXN_MAT_VIEW_DATA {
                    let r = (self.mem.get_i64_at(p), self.mem.get_i64_at(p + 8));
                    p += 16;
                    Some(r)
                } else {
                    None
                };
                let symbol_diffs = self.read_symbol_diffs(&mut p, end)?;
                let data = DataInfo {
                    start_row_id,
                    end_row_id,
                    min_timestamp,
                    max_timestamp,
                    out_of_order,
                    symbol_diffs,
                };
                match refresh {
                    None => WalEventBody::Data(data),
                    Some((base_txn, ts)) => WalEventBody::MatViewData {
                        data,
                        last_refresh_base_txn: base_txn,
                        last_refresh_timestamp: ts,
                    },
                }
            }
            TXN_SQL => {
                let cmd_type = self.mem.get_i32_at(p);
                p += 4;
                let (sql, consumed) = self.mem.get_str_at(p)?;
                p += consumed;
                let sql = sql.ok_or_else(|| corrupt("null SQL text"))?;
                let rnd_seed0 = self.mem.get_i64_at(p);
                let rnd_seed1 = self.mem.get_i64_at(p + 8);
                p += 16;
                let indexed_vars = self.read_bind_values(&mut p)?;
                let named_count = self.mem.get_i32_at(p);
                p += 4;
                let mut named_vars = Vec::with_capacity(named_count as usize);
                for _ in 0..named_count {
                    let (name, consumed) = self.mem.get_str_at(p)?;
                    p += consumed;
                    let name = name.ok_or_else(|| corrupt("null bind variable name"))?;
                    let value = self.read_bind_value(&mut p)?;
                    named_vars.push((name, value));
                }
                WalEventBody::Sql {
                    cmd_type,
                    sql,
                    rnd_seed0,
                    rnd_seed1,
                    indexed_vars,
                    named_vars,
                }
            }
            TXN_TRUNCATE => WalEventBody::Truncate,
            TXN_MAT_VIEW_INVALIDATE => {
                let invalid = self.mem.get_u8_at(p) != 0;
                p += 1;
                let (reason, _) = self.mem.get_str_at(p)?;
                WalEventBody::MatViewInvalidate { invalid, reason }
            }
            other => {
                return Err(corrupt(&format!("unknown txn type {other}")));
            }
        };
        Ok(WalEventRecord { txn, body })
    }

    fn read_bind_values(&self, p: &mut usize) -> PetrelResult<Vec<BindValue>> {
        let count = self.mem.get_i32_at(*p);
        *p += 4;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(self.read_bind_value(p)?);
        }
        Ok(values)
    }

    fn read_bind_value(&self, p: &mut usize) -> PetrelResult<BindValue> {
        let tag = self.mem.get_i32_at(*p);
        *p += 4;
        let v = match tag {
            0 => {
                let v = BindValue::Bool(self.mem.get_u8_at(*p) != 0);
                *p += 1;
                v
            }
            1 => {
                let v = BindValue::Byte(self.mem.get_u8_at(*p) as i8);
                *p += 1;
                v
            }
            2 => {
                let v = BindValue::Short(
                    i16::from_le_bytes([self.mem.get_u8_at(*p), self.mem.get_u8_at(*p + 1)]),
                );
                *p += 2;
                v
            }
            3 => {
                let c = char::from_u32(self.mem.get_i32_at(*p) as u32).unwrap_or('\u{fffd}');
                *p += 4;
                BindValue::Char(c)
            }
            4 => {
                let v = BindValue::Int(self.mem.get_i32_at(*p));
                *p += 4;
                v
            }
            5 => {
                let v = BindValue::Long(self.mem.get_i64_at(*p));
                *p += 8;
                v
            }
            6 => {
                let v = BindValue::Float(f32::from_bits(self.mem.get_i32_at(*p) as u32));
                *p += 4;
                v
            }
            7 => {
                let v = BindValue::Double(self.mem.get_f64_at(*p));
                *p += 8;
                v
            }
            8 => {
                let v = BindValue::Date(self.mem.get_i64_at(*p));
                *p += 8;
                v
            }
            9 => {
                let v = BindValue::Timestamp(self.mem.get_i64_at(*p));
                *p += 8;
                v
            }
            10 => {
                let (s, consumed) = self.mem.get_str_at(*p)?;
                *p += consumed;
                BindValue::Str(s)
            }
            other => {
                return Err(PetrelError::CorruptFile {
                    path: self.mem.path().display().to_string(),
                    reason: format!("unknown bind variable tag {other}"),
                });
            }
        };
        Ok(v)
    }

    fn read_symbol_diffs(&self, p: &mut usize, end: usize) -> PetrelResult<Vec<SymbolMapDiff>> {
        let mut diffs = Vec::new();
        loop {
            if *p + 4 > end {
                return Err(PetrelError::CorruptFile {
                    path: self.mem.path().display().to_string(),
                    reason: "unterminated symbol diff block".to_string(),
                });
            }
            let column_index = self.mem.get_i32_at(*p);
            *p += 4;
            if column_index == END_OF_SYMBOL_DIFFS {
                return Ok(diffs);
            }
            let null_flag = self.mem.get_u8_at(*p) != 0;
            *p += 1;
            let initial_count = self.mem.get_i32_at(*p);
            *p += 4;
            let count = self.mem.get_i32_at(*p);
            *p += 4;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let code = self.mem.get_i32_at(*p);
                *p += 4;
                let (symbol, consumed) = self.mem.get_str_at(*p)?;
                *p += consumed;
                entries.push((
                    code,
                    symbol.ok_or_else(|| PetrelError::CorruptFile {
                        path: self.mem.path().display().to_string(),
                        reason: "null symbol in diff".to_string(),
                    })?,
                ));
            }
            let terminator = self.mem.get_i32_at(*p);
            *p += 4;
            if terminator != END_OF_SYMBOL_ENTRIES {
                return Err(PetrelError::CorruptFile {
                    path: self.mem.path().display().to_string(),
                    reason: "missing end-of-symbol-entries".to_string(),
                });
            }
            diffs.push(SymbolMapDiff {
                column_index,
                null_flag,
                initial_count,
                entries,
            });
        }
    }
}
