//! WAL-backed table writer. Owns one `wal<N>/<segment>` directory: buffered
//! rows land in segment column files, each commit appends a DATA event with
//! the txn's symbol-dictionary diff, registers the txn with the sequencer
//! and publishes an apply notification.
//!
//! Symbol codes are writer-local: the dictionary is seeded from the table's
//! at segment open and new codes continue from there, never flushed to the
//! table. The apply job remaps any code that appears in a diff.

use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use petrel_common::config::EngineConfig;
use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, TableToken, TimestampMicros, Value};

use crate::colfile::{self, SymbolDict};
use crate::fs::FilesFacade;
use crate::message_bus::{publish_wal_txn, MessageBus};
use crate::metadata::TableMeta;
use crate::sequencer::{TableSequencerApi, TxnLocation};
use crate::SEQ_DIR_NAME;

use super::events::{DataInfo, SymbolMapDiff, WalEventWriter};
use super::{segment_dir_name, wal_dir_name, CMD_RENAME_TABLE};

struct SymbolColumn {
    dict: SymbolDict,
    /// Local dictionary size when the current txn began; codes at or above
    /// it go into this txn's diff.
    txn_initial_count: i32,
    null_written: bool,
}

fn load_symbol_columns(
    ff: FilesFacade,
    table_dir: &std::path::Path,
    meta: &TableMeta,
) -> PetrelResult<Vec<Option<SymbolColumn>>> {
    let mut symbols = Vec::with_capacity(meta.columns.len());
    for c in &meta.columns {
        if c.col_type == ColumnType::Symbol {
            let dict = SymbolDict::load(ff, colfile::dict_file(table_dir, &c.name))?;
            let count = dict.count();
            symbols.push(Some(SymbolColumn {
                dict,
                txn_initial_count: count,
                null_written: false,
            }));
        } else {
            symbols.push(None);
        }
    }
    Ok(symbols)
}

pub struct WalWriter {
    ff: FilesFacade,
    token: TableToken,
    config: Arc<EngineConfig>,
    sequencer: Arc<TableSequencerApi>,
    bus: Arc<MessageBus>,
    unpublished: Arc<AtomicI64>,
    wal_id: i32,
    segment_id: i32,
    segment_dir: PathBuf,
    meta: TableMeta,
    events: WalEventWriter,
    symbols: Vec<Option<SymbolColumn>>,
    pending: Vec<Vec<Value>>,
    segment_row_count: u64,
    segment_max_ts: TimestampMicros,
    distressed: bool,
}

impl WalWriter {
    pub fn open(
        ff: FilesFacade,
        config: Arc<EngineConfig>,
        sequencer: Arc<TableSequencerApi>,
        bus: Arc<MessageBus>,
        unpublished: Arc<AtomicI64>,
        token: TableToken,
    ) -> PetrelResult<Self> {
        let table_dir = config.db_root.join(token.dir_name());
        let meta = TableMeta::load(ff, &table_dir.join(SEQ_DIR_NAME))?;
        let wal_id = sequencer.next_wal_id(&token)?;
        let segment_dir = table_dir
            .join(wal_dir_name(wal_id))
            .join(segment_dir_name(0));
        ff.mkdirs(&segment_dir)?;
        let events = WalEventWriter::open(
            ff,
            &segment_dir,
            config.wal_event_append_page_size,
            config.commit_mode,
        )?;
        let symbols = load_symbol_columns(ff, &table_dir, &meta)?;
        Ok(Self {
            ff,
            token,
            config,
            sequencer,
            bus,
            unpublished,
            wal_id,
            segment_id: 0,
            segment_dir,
            meta,
            events,
            symbols,
            pending: Vec::new(),
            segment_row_count: 0,
            segment_max_ts: i64::MIN,
            distressed: false,
        })
    }

    /// Opens the next segment directory and re-seeds symbol dictionaries
    /// from the table's current state.
    pub fn roll_segment(&mut self) -> PetrelResult<()> {
        self.segment_id += 1;
        let table_dir = self.config.db_root.join(self.token.dir_name());
        self.segment_dir = table_dir
            .join(wal_dir_name(self.wal_id))
            .join(segment_dir_name(self.segment_id));
        self.ff.mkdirs(&self.segment_dir)?;
        self.events = WalEventWriter::open(
            self.ff,
            &self.segment_dir,
            self.config.wal_event_append_page_size,
            self.config.commit_mode,
        )?;
        self.meta = TableMeta::load(self.ff, &table_dir.join(SEQ_DIR_NAME))?;
        self.symbols = load_symbol_columns(self.ff, &table_dir, &self.meta)?;
        self.pending.clear();
        self.segment_row_count = 0;
        self.segment_max_ts = i64::MIN;
        Ok(())
    }

    pub fn token(&self) -> &TableToken {
        &self.token
    }

    pub fn wal_id(&self) -> i32 {
        self.wal_id
    }

    pub fn segment_id(&self) -> i32 {
        self.segment_id
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn is_distressed(&self) -> bool {
        self.distressed
    }

    pub fn append_row(&mut self, values: Vec<Value>) -> PetrelResult<()> {
        if self.distressed {
            return Err(PetrelError::entry_unavailable("distressedWalWriter"));
        }
        if self.sequencer.is_suspended(&self.token) {
            return Err(PetrelError::TableSuspended(
                self.token.table_name().to_string(),
            ));
        }
        if values.len() != self.meta.columns.len() {
            return Err(PetrelError::InvalidColumnValue {
                column: format!("row of {} values", values.len()),
                expected: format!("{} columns", self.meta.columns.len()),
            });
        }
        match values.get(self.meta.timestamp_index) {
            Some(Value::Timestamp(_)) => {}
            _ => {
                return Err(PetrelError::InvalidColumnValue {
                    column: self.meta.columns[self.meta.timestamp_index].name.clone(),
                    expected: "Timestamp".to_string(),
                })
            }
        }
        self.pending.push(values);
        Ok(())
    }

    pub fn rollback(&mut self) -> PetrelResult<()> {
        self.pending.clear();
        if self.events.txn() > 0 {
            self.events.rollback()?;
        }
        self.distressed = true;
        Ok(())
    }

    /// Commits buffered rows: segment column files, DATA event with symbol
    /// diffs, sync, seq txn allocation, apply notification. Returns the seq
    /// txn, or the current one when nothing was pending.
    pub fn commit(&mut self) -> PetrelResult<i64> {
        self.commit_with_refresh(None)
    }

    /// Commit of a mat-view refresh: the DATA event additionally records
    /// which base-table txn and timestamp the rows were computed against.
    pub fn commit_mat_view_data(
        &mut self,
        last_refresh_base_txn: i64,
        last_refresh_timestamp: TimestampMicros,
    ) -> PetrelResult<i64> {
        self.commit_with_refresh(Some((last_refresh_base_txn, last_refresh_timestamp)))
    }

    fn commit_with_refresh(
        &mut self,
        refresh: Option<(i64, TimestampMicros)>,
    ) -> PetrelResult<i64> {
        if self.distressed {
            return Err(PetrelError::entry_unavailable("distressedWalWriter"));
        }
        if self.pending.is_empty() {
            return Ok(self.sequencer.tracker(&self.token)?.seq_txn());
        }

        let rows = std::mem::take(&mut self.pending);
        let row_count = rows.len() as u64;
        let mut min_ts = i64::MAX;
        let mut max_ts = i64::MIN;
        let mut out_of_order = false;
        let mut last_ts = self.segment_max_ts;
        for row in &rows {
            let ts = match row[self.meta.timestamp_index] {
                Value::Timestamp(ts) => ts,
                _ => unreachable!("validated on append"),
            };
            min_ts = min_ts.min(ts);
            max_ts = max_ts.max(ts);
            if ts < last_ts {
                out_of_order = true;
            }
            last_ts = last_ts.max(ts);
        }

        let result =
            self.write_rows_and_event(rows, row_count, min_ts, max_ts, out_of_order, refresh);
        match result {
            Ok(seq_txn) => {
                self.segment_row_count += row_count;
                self.segment_max_ts = self.segment_max_ts.max(max_ts);
                for symbol in self.symbols.iter_mut().flatten() {
                    symbol.txn_initial_count = symbol.dict.count();
                    symbol.null_written = false;
                }
                publish_wal_txn(&self.bus, &self.unpublished, &self.token);
                Ok(seq_txn)
            }
            Err(e) => {
                self.pending.clear();
                self.distressed = true;
                Err(e)
            }
        }
    }

    fn write_rows_and_event(
        &mut self,
        rows: Vec<Vec<Value>>,
        row_count: u64,
        min_ts: TimestampMicros,
        max_ts: TimestampMicros,
        out_of_order: bool,
        refresh: Option<(i64, TimestampMicros)>,
    ) -> PetrelResult<i64> {
        let columns = self.meta.columns.clone();
        for (i, col) in columns.iter().enumerate() {
            match col.col_type {
                ColumnType::Symbol => {
                    let symbol = self.symbols[i].as_mut().expect("symbol state present");
                    let mut codes = Vec::with_capacity(rows.len());
                    for row in &rows {
                        codes.push(match &row[i] {
                            Value::Symbol(s) => symbol.dict.get_or_insert(s),
                            Value::Null => {
                                symbol.null_written = true;
                                colfile::NULL_SYMBOL_CODE
                            }
                            _ => {
                                return Err(PetrelError::InvalidColumnValue {
                                    column: col.name.clone(),
                                    expected: "Symbol".to_string(),
                                })
                            }
                        });
                    }
                    colfile::append_symbol_codes(self.ff, &self.segment_dir, &col.name, &codes)?;
                }
                other => {
                    let values: Vec<Value> = rows.iter().map(|row| row[i].clone()).collect();
                    colfile::append_values(self.ff, &self.segment_dir, &col.name, other, &values)?;
                }
            }
        }

        let symbol_diffs = self.build_symbol_diffs();
        let info = DataInfo {
            start_row_id: self.segment_row_count as i64,
            end_row_id: (self.segment_row_count + row_count) as i64,
            min_timestamp: min_ts,
            max_timestamp: max_ts,
            out_of_order,
            symbol_diffs,
        };
        let segment_txn = match refresh {
            None => self.events.append_data(&info)?,
            Some((base_txn, ts)) => self.events.append_mat_view_data(&info, base_txn, ts)?,
        };
        self.events.sync()?;
        match self.register_txn(segment_txn) {
            Ok(seq_txn) => Ok(seq_txn),
            Err(e) => {
                // the event never reached the sequencer; invalidate it in
                // place
                self.events.rollback()?;
                Err(e)
            }
        }
    }

    fn build_symbol_diffs(&self) -> Vec<SymbolMapDiff> {
        let mut diffs = Vec::new();
        for (i, symbol) in self.symbols.iter().enumerate() {
            let Some(symbol) = symbol else { continue };
            let count = symbol.dict.count();
            if count > symbol.txn_initial_count || symbol.null_written {
                let entries = (symbol.txn_initial_count..count)
                    .map(|code| {
                        (
                            code,
                            symbol
                                .dict
                                .value_of(code)
                                .expect("code within dict")
                                .to_string(),
                        )
                    })
                    .collect();
                diffs.push(SymbolMapDiff {
                    column_index: i as i32,
                    null_flag: symbol.null_written,
                    initial_count: symbol.txn_initial_count,
                    entries,
                });
            }
        }
        diffs
    }

    fn register_txn(&mut self, segment_txn: i32) -> PetrelResult<i64> {
        self.sequencer.next_txn(
            &self.token,
            TxnLocation {
                wal_id: self.wal_id,
                segment_id: self.segment_id,
                segment_txn,
            },
        )
    }

    /// Emits the rename SQL record carrying the new table name; the rename
    /// becomes durable through the WAL before the registry swings.
    pub fn rename_table(&mut self, new_name: &str) -> PetrelResult<i64> {
        let segment_txn = self
            .events
            .append_sql(CMD_RENAME_TABLE, new_name, 0, 0, &[], &[])?;
        self.events.sync()?;
        let seq_txn = self.register_txn(segment_txn)?;
        publish_wal_txn(&self.bus, &self.unpublished, &self.token);
        Ok(seq_txn)
    }

    pub fn truncate(&mut self) -> PetrelResult<i64> {
        self.pending.clear();
        let segment_txn = self.events.truncate()?;
        self.events.sync()?;
        let seq_txn = self.register_txn(segment_txn)?;
        publish_wal_txn(&self.bus, &self.unpublished, &self.token);
        Ok(seq_txn)
    }

    /// Marks the view's data validity; only meaningful on mat-view tables.
    pub fn invalidate_mat_view(
        &mut self,
        invalid: bool,
        reason: Option<&str>,
    ) -> PetrelResult<i64> {
        let segment_txn = self.events.invalidate(invalid, reason)?;
        self.events.sync()?;
        let seq_txn = self.register_txn(segment_txn)?;
        publish_wal_txn(&self.bus, &self.unpublished, &self.token);
        Ok(seq_txn)
    }
}

/// Factory for the WAL writer pool. Reused writers roll to a fresh segment
/// so an apply job can keep reading the files of the one they left behind.
pub struct WalWriterFactory {
    pub ff: FilesFacade,
    pub config: Arc<EngineConfig>,
    pub sequencer: Arc<TableSequencerApi>,
    pub bus: Arc<MessageBus>,
    pub unpublished: Arc<AtomicI64>,
}

impl crate::pool::ResourceFactory<WalWriter> for WalWriterFactory {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<WalWriter> {
        WalWriter::open(
            self.ff,
            Arc::clone(&self.config),
            Arc::clone(&self.sequencer),
            Arc::clone(&self.bus),
            Arc::clone(&self.unpublished),
            token.clone(),
        )
    }

    fn prepare_reuse(&self, resource: &mut WalWriter, token: &TableToken) -> bool {
        !resource.is_distressed()
            && resource.token().dir_name() == token.dir_name()
            && resource.roll_segment().is_ok()
    }
}
