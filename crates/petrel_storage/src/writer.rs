//! The table writer: single owner of a table directory. Appends are
//! buffered and become visible to readers only when `commit` rewrites the
//! `_txn` snapshot; the column-version file is committed first so a reader
//! acting on the new `_txn` always finds consistent column metadata.

use std::path::{Path, PathBuf};

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, TableToken, TimestampMicros, Value};

use crate::colfile::{self, SymbolDict};
use crate::column_version::ColumnVersionWriter;
use crate::fs::FilesFacade;
use crate::metadata::{ColumnMeta, PartitionInfo, TableMeta, TxnFile};
use crate::CV_FILE_NAME;

pub struct TableWriter {
    ff: FilesFacade,
    token: TableToken,
    dir: PathBuf,
    meta: TableMeta,
    txn_file: TxnFile,
    cv: ColumnVersionWriter,
    cv_dirty: bool,
    dicts: Vec<Option<SymbolDict>>,
    pending: Vec<Vec<Value>>,
}

impl TableWriter {
    pub fn open(ff: FilesFacade, db_root: &Path, token: TableToken) -> PetrelResult<Self> {
        let dir = db_root.join(token.dir_name());
        let meta = TableMeta::load(ff, &dir)?;
        let txn_file = TxnFile::load(ff, &dir)?;
        let cv = ColumnVersionWriter::open(ff, &dir.join(CV_FILE_NAME))?;
        let dicts = meta
            .columns
            .iter()
            .map(|c| {
                if c.col_type == ColumnType::Symbol {
                    Some(SymbolDict::load(ff, colfile::dict_file(&dir, &c.name)))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        let mut dicts_ok = Vec::with_capacity(dicts.len());
        for d in dicts {
            dicts_ok.push(d.transpose()?);
        }
        let mut writer = Self {
            ff,
            token,
            dir,
            meta,
            txn_file,
            cv,
            cv_dirty: false,
            dicts: dicts_ok,
            pending: Vec::new(),
        };
        writer.repair()?;
        Ok(writer)
    }

    /// Rolls back a torn commit: column files longer than the committed row
    /// counts are truncated back to the `_txn` snapshot.
    fn repair(&mut self) -> PetrelResult<()> {
        for p in &self.txn_file.partitions {
            let pdir = self.dir.join(self.meta.partition_by.dir_name(p.timestamp));
            for (i, col) in self.meta.columns.iter().enumerate() {
                let top = self.cv.list().column_top_quick(p.timestamp, i as i32);
                let file_rows = p.row_count.saturating_sub(top as u64);
                let data_path = colfile::data_file(&pdir, &col.name);
                if !self.ff.exists(&data_path) {
                    continue;
                }
                match col.col_type {
                    ColumnType::Str => {
                        let aux_path = colfile::aux_file(&pdir, &col.name);
                        let aux_expected = file_rows * 8;
                        if self.ff.file_len(&aux_path)? > aux_expected {
                            let aux = self.ff.open_rw(&aux_path)?;
                            // The would-be next entry's offset is the true
                            // data length.
                            let mut buf = [0u8; 8];
                            self.ff.read_at(&aux, &mut buf, aux_expected)?;
                            let data_len = i64::from_le_bytes(buf) as u64;
                            aux.set_len(aux_expected)?;
                            let data = self.ff.open_rw(&data_path)?;
                            data.set_len(data_len)?;
                            tracing::info!(table = %self.token, column = %col.name, "truncated torn string column");
                        }
                    }
                    other => {
                        let size = other.fixed_size().unwrap_or(4) as u64;
                        let expected = file_rows * size;
                        if self.ff.file_len(&data_path)? > expected {
                            let data = self.ff.open_rw(&data_path)?;
                            data.set_len(expected)?;
                            tracing::info!(table = %self.token, column = %col.name, "truncated torn column");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn token(&self) -> &TableToken {
        &self.token
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn metadata_version(&self) -> i64 {
        self.meta.metadata_version
    }

    pub fn txn(&self) -> i64 {
        self.txn_file.txn
    }

    pub fn seq_txn(&self) -> i64 {
        self.txn_file.seq_txn
    }

    pub fn row_count(&self) -> u64 {
        self.txn_file.row_count_total()
    }

    /// Refreshes metadata from disk; used when the writer is recycled from
    /// the pool.
    pub fn reload_meta(&mut self) -> PetrelResult<()> {
        self.meta = TableMeta::load(self.ff, &self.dir)?;
        Ok(())
    }

    fn designated_ts(&self, values: &[Value]) -> PetrelResult<TimestampMicros> {
        match values.get(self.meta.timestamp_index) {
            Some(Value::Timestamp(ts)) => Ok(*ts),
            _ => Err(PetrelError::InvalidColumnValue {
                column: self.meta.columns[self.meta.timestamp_index].name.clone(),
                expected: "Timestamp".to_string(),
            }),
        }
    }

    /// Buffers one row. Nothing is visible until `commit`.
    pub fn append_row(&mut self, values: Vec<Value>) -> PetrelResult<()> {
        if values.len() != self.meta.columns.len() {
            return Err(PetrelError::InvalidColumnValue {
                column: format!("row of {} values", values.len()),
                expected: format!("{} columns", self.meta.columns.len()),
            });
        }
        self.designated_ts(&values)?;
        self.pending.push(values);
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    pub fn commit(&mut self) -> PetrelResult<i64> {
        self.commit_inner(None)
    }

    /// Commit on the apply path, also advancing the applied seq txn.
    pub fn commit_applied(&mut self, seq_txn: i64) -> PetrelResult<i64> {
        self.commit_inner(Some(seq_txn))
    }

    /// Records a structural (row-less) WAL txn as applied.
    pub fn mark_seq_applied(&mut self, seq_txn: i64) -> PetrelResult<i64> {
        debug_assert!(self.pending.is_empty());
        self.commit_inner(Some(seq_txn))
    }

    fn commit_inner(&mut self, seq_txn: Option<i64>) -> PetrelResult<i64> {
        if self.pending.is_empty() && seq_txn.is_none() {
            return Ok(self.txn_file.txn);
        }
        // Group pending rows by partition, preserving append order within
        // each.
        let mut by_partition: Vec<(TimestampMicros, Vec<Vec<Value>>)> = Vec::new();
        for row in self.pending.drain(..) {
            let ts = match row[self.meta.timestamp_index] {
                Value::Timestamp(ts) => ts,
                _ => unreachable!("validated on append"),
            };
            let pts = self.meta.partition_by.floor(ts);
            match by_partition.iter_mut().find(|(t, _)| *t == pts) {
                Some((_, rows)) => rows.push(row),
                None => by_partition.push((pts, vec![row])),
            }
        }
        by_partition.sort_by_key(|(ts, _)| *ts);

        for (pts, rows) in by_partition {
            self.commit_partition(pts, rows)?;
        }

        for dict in self.dicts.iter_mut().flatten() {
            dict.flush(self.ff)?;
        }
        if self.cv_dirty {
            self.cv.commit()?;
            self.cv_dirty = false;
        }
        self.txn_file.txn += 1;
        if let Some(seq) = seq_txn {
            self.txn_file.seq_txn = seq;
        }
        self.txn_file.store(self.ff, &self.dir)?;
        tracing::debug!(table = %self.token, txn = self.txn_file.txn, "committed");
        Ok(self.txn_file.txn)
    }

    fn commit_partition(
        &mut self,
        pts: TimestampMicros,
        rows: Vec<Vec<Value>>,
    ) -> PetrelResult<()> {
        let pdir = self.dir.join(self.meta.partition_by.dir_name(pts));
        self.ff.mkdirs(&pdir)?;
        let existing = match self.txn_file.partition_index(pts) {
            Some(i) => self.txn_file.partitions[i].row_count,
            None => {
                let at = self
                    .txn_file
                    .partitions
                    .partition_point(|p| p.timestamp < pts);
                self.txn_file.partitions.insert(
                    at,
                    PartitionInfo {
                        timestamp: pts,
                        row_count: 0,
                    },
                );
                0
            }
        };

        let columns = self.meta.columns.clone();
        for (i, col) in columns.iter().enumerate() {
            let data_path = colfile::data_file(&pdir, &col.name);
            // First write of a late-added column into a partition that
            // already has rows: record the column top.
            if existing > 0 && !self.ff.exists(&data_path) {
                self.cv.upsert(pts, i as i32, -1, existing as i64);
                self.cv_dirty = true;
            }
            match col.col_type {
                ColumnType::Symbol => {
                    let dict = self.dicts[i].as_mut().expect("symbol dict present");
                    let mut codes = Vec::with_capacity(rows.len());
                    for row in &rows {
                        codes.push(match &row[i] {
                            Value::Symbol(s) => dict.get_or_insert(s),
                            Value::Null => colfile::NULL_SYMBOL_CODE,
                            _ => {
                                return Err(PetrelError::InvalidColumnValue {
                                    column: col.name.clone(),
                                    expected: "Symbol".to_string(),
                                })
                            }
                        });
                    }
                    colfile::append_symbol_codes(self.ff, &pdir, &col.name, &codes)?;
                }
                other => {
                    let values: Vec<Value> = rows.iter().map(|row| row[i].clone()).collect();
                    colfile::append_values(self.ff, &pdir, &col.name, other, &values)?;
                }
            }
        }

        let idx = self.txn_file.partition_index(pts).expect("partition added");
        self.txn_file.partitions[idx].row_count = existing + rows.len() as u64;
        Ok(())
    }

    /// Adds a column, bumping the metadata version and recording the
    /// column's introduction partition so earlier partitions read it as
    /// absent and the current one carries an explicit column top.
    pub fn add_column(&mut self, name: &str, col_type: ColumnType) -> PetrelResult<()> {
        if self.meta.column_index(name).is_some() {
            return Err(PetrelError::InvalidName(format!(
                "column already exists [column={name}]"
            )));
        }
        let col_index = self.meta.columns.len() as i32;

        // Column-version records go first: a reader must never see the new
        // column in `_meta` without its introduction partition on record.
        if let Some(last) = self.txn_file.partitions.last() {
            let pts = last.timestamp;
            self.cv.upsert_column_added(col_index, pts);
            if last.row_count > 0 {
                self.cv.upsert(pts, col_index, -1, last.row_count as i64);
            }
            self.cv.commit()?;
        }

        self.meta.columns.push(ColumnMeta {
            name: name.to_string(),
            col_type,
        });
        self.meta.metadata_version += 1;
        self.meta.store(self.ff, &self.dir)?;
        self.dicts.push(if col_type == ColumnType::Symbol {
            Some(SymbolDict::load(
                self.ff,
                colfile::dict_file(&self.dir, name),
            )?)
        } else {
            None
        });
        self.txn_file.txn += 1;
        self.txn_file.store(self.ff, &self.dir)?;
        tracing::info!(table = %self.token, column = name, "column added");
        Ok(())
    }

    pub fn truncate(&mut self) -> PetrelResult<i64> {
        self.truncate_inner(None)
    }

    pub fn truncate_applied(&mut self, seq_txn: i64) -> PetrelResult<i64> {
        self.truncate_inner(Some(seq_txn))
    }

    fn truncate_inner(&mut self, seq_txn: Option<i64>) -> PetrelResult<i64> {
        self.pending.clear();
        for p in std::mem::take(&mut self.txn_file.partitions) {
            let pdir = self.dir.join(self.meta.partition_by.dir_name(p.timestamp));
            if self.ff.exists(&pdir) {
                self.ff.unlink_or_remove(&pdir)?;
            }
        }
        for (i, col) in self.meta.columns.iter().enumerate() {
            if col.col_type == ColumnType::Symbol {
                let path = colfile::dict_file(&self.dir, &col.name);
                if self.ff.exists(&path) {
                    self.ff.remove_file(&path)?;
                }
                self.dicts[i] = Some(SymbolDict::load(self.ff, path)?);
            }
        }
        self.cv.clear();
        self.cv.commit()?;
        self.cv_dirty = false;
        self.txn_file.txn += 1;
        if let Some(seq) = seq_txn {
            self.txn_file.seq_txn = seq;
        }
        self.txn_file.store(self.ff, &self.dir)?;
        tracing::info!(table = %self.token, "table truncated");
        Ok(self.txn_file.txn)
    }

    /// Resolves a symbol code through the table dictionary.
    pub fn symbol_value(&self, col_index: usize, code: i32) -> Option<&str> {
        self.dicts
            .get(col_index)
            .and_then(|d| d.as_ref())
            .and_then(|d| d.value_of(code))
    }

    /// Folds a WAL symbol diff into the table dictionary. Returns the
    /// writer-local → table code translation for the diff's entries;
    /// interning by string keeps replay idempotent.
    pub fn apply_symbol_diff(
        &mut self,
        col_index: usize,
        entries: &[(i32, String)],
    ) -> PetrelResult<std::collections::HashMap<i32, i32>> {
        let dict = self.dicts[col_index]
            .as_mut()
            .ok_or_else(|| PetrelError::InvalidColumnValue {
                column: format!("column {col_index}"),
                expected: "Symbol".to_string(),
            })?;
        let mut translation = std::collections::HashMap::with_capacity(entries.len());
        for (code, symbol) in entries {
            translation.insert(*code, dict.get_or_insert(symbol));
        }
        dict.flush(self.ff)?;
        Ok(translation)
    }
}

/// Creates a table's on-disk structure: directory, `_meta`, empty `_txn`,
/// empty `_cv`. Registration and locking happen in the engine.
pub fn create_table_files(
    ff: FilesFacade,
    db_root: &Path,
    token: &TableToken,
    meta: &TableMeta,
) -> PetrelResult<()> {
    let dir = db_root.join(token.dir_name());
    ff.mkdirs(&dir)?;
    meta.store(ff, &dir)?;
    TxnFile::default().store(ff, &dir)?;
    let mut cv = ColumnVersionWriter::open(ff, &dir.join(CV_FILE_NAME))?;
    cv.commit()?;
    crate::metadata::overwrite_table_name_file(ff, &dir, token.table_name())?;
    Ok(())
}

/// Factory for the writer pool.
pub struct TableWriterFactory {
    pub ff: FilesFacade,
    pub db_root: PathBuf,
}

impl crate::pool::ResourceFactory<TableWriter> for TableWriterFactory {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<TableWriter> {
        TableWriter::open(self.ff, &self.db_root, token.clone())
    }

    fn prepare_reuse(&self, resource: &mut TableWriter, token: &TableToken) -> bool {
        resource.token.dir_name() == token.dir_name() && resource.reload_meta().is_ok()
    }
}
