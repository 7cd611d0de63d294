//! Read-only table snapshot. A reader trusts exactly the row counts of the
//! `_txn` file it loaded and resolves column identities through the
//! column-version store's seqlock read, so it never blocks the writer and
//! never observes a torn commit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, TableId, TableToken, TimestampMicros, Value};

use crate::colfile::{self, SymbolDict};
use crate::column_version::ColumnVersionReader;
use crate::fs::FilesFacade;
use crate::metadata::{PartitionInfo, TableMeta, TxnFile};
use crate::CV_FILE_NAME;

pub struct TableReader {
    ff: FilesFacade,
    token: TableToken,
    dir: PathBuf,
    spin_lock_timeout: Duration,
    meta: TableMeta,
    txn_file: TxnFile,
    cv: ColumnVersionReader,
    dicts: Vec<Option<SymbolDict>>,
}

impl TableReader {
    pub fn open(
        ff: FilesFacade,
        db_root: &Path,
        token: TableToken,
        spin_lock_timeout: Duration,
    ) -> PetrelResult<Self> {
        let dir = db_root.join(token.dir_name());
        let meta = TableMeta::load(ff, &dir)?;
        let txn_file = TxnFile::load(ff, &dir)?;
        let mut cv = ColumnVersionReader::open(ff, &dir.join(CV_FILE_NAME))?;
        cv.read_safe(spin_lock_timeout)?;
        let mut reader = Self {
            ff,
            token,
            dir,
            spin_lock_timeout,
            meta,
            txn_file,
            cv,
            dicts: Vec::new(),
        };
        reader.reload_dicts()?;
        Ok(reader)
    }

    fn reload_dicts(&mut self) -> PetrelResult<()> {
        let mut dicts = Vec::with_capacity(self.meta.columns.len());
        for c in &self.meta.columns {
            if c.col_type == ColumnType::Symbol {
                dicts.push(Some(SymbolDict::load(
                    self.ff,
                    colfile::dict_file(&self.dir, &c.name),
                )?));
            } else {
                dicts.push(None);
            }
        }
        self.dicts = dicts;
        Ok(())
    }

    /// Refreshes the snapshot to the latest committed state.
    pub fn reload(&mut self) -> PetrelResult<()> {
        self.meta = TableMeta::load(self.ff, &self.dir)?;
        self.txn_file = TxnFile::load(self.ff, &self.dir)?;
        self.cv.read_safe(self.spin_lock_timeout)?;
        self.reload_dicts()
    }

    pub fn token(&self) -> &TableToken {
        &self.token
    }

    pub fn table_id(&self) -> TableId {
        self.meta.table_id
    }

    pub fn metadata_version(&self) -> i64 {
        self.meta.metadata_version
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn txn(&self) -> i64 {
        self.txn_file.txn
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.txn_file.partitions
    }

    pub fn row_count(&self) -> u64 {
        self.txn_file.row_count_total()
    }

    /// Column top of `(partition, column)`: leading null rows, or -1 when
    /// the column is absent from the partition.
    pub fn column_top(&self, partition_ts: TimestampMicros, col_index: usize) -> i64 {
        self.cv.list().column_top(partition_ts, col_index as i32)
    }

    /// Reads one value of the snapshot. Rows above the column top read as
    /// null; symbol codes resolve through the dictionary.
    pub fn value_at(
        &self,
        partition_ts: TimestampMicros,
        col_index: usize,
        row: u64,
    ) -> PetrelResult<Value> {
        let p = self
            .txn_file
            .partition_index(partition_ts)
            .ok_or_else(|| {
                PetrelError::TableDoesNotExist(format!(
                    "partition {partition_ts} of {}",
                    self.token.table_name()
                ))
            })?;
        let info = &self.txn_file.partitions[p];
        if row >= info.row_count {
            return Err(PetrelError::InvalidColumnValue {
                column: format!("row {row}"),
                expected: format!("row < {}", info.row_count),
            });
        }
        let col = &self.meta.columns[col_index];
        let top = self.cv.list().column_top(partition_ts, col_index as i32);
        if top < 0 {
            // column absent from this partition entirely
            return Ok(Value::Null);
        }
        if (row as i64) < top {
            return Ok(Value::Null);
        }
        let pdir = self.dir.join(self.meta.partition_by.dir_name(partition_ts));
        let file_row = row - top as u64;
        let raw = colfile::read_value(self.ff, &pdir, &col.name, col.col_type, file_row)?;
        if col.col_type == ColumnType::Symbol {
            return match raw {
                Value::Null => Ok(Value::Null),
                Value::Int(code) => {
                    let dict = self.dicts[col_index].as_ref().expect("symbol dict present");
                    match dict.value_of(code) {
                        Some(s) => Ok(Value::Symbol(s.to_string())),
                        None => Err(PetrelError::CorruptFile {
                            path: colfile::data_file(&pdir, &col.name).display().to_string(),
                            reason: format!("unmapped symbol code {code}"),
                        }),
                    }
                }
                _ => unreachable!("symbol columns read as codes"),
            };
        }
        Ok(raw)
    }

    /// All committed values of one column, partition by partition. Test and
    /// scan convenience.
    pub fn column_values(&self, col_index: usize) -> PetrelResult<Vec<Value>> {
        let mut out = Vec::with_capacity(self.row_count() as usize);
        for p in &self.txn_file.partitions {
            for row in 0..p.row_count {
                out.push(self.value_at(p.timestamp, col_index, row)?);
            }
        }
        Ok(out)
    }
}

/// Factory for the reader pool.
pub struct TableReaderFactory {
    pub ff: FilesFacade,
    pub db_root: PathBuf,
    pub spin_lock_timeout: Duration,
}

impl crate::pool::ResourceFactory<TableReader> for TableReaderFactory {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<TableReader> {
        TableReader::open(self.ff, &self.db_root, token.clone(), self.spin_lock_timeout)
    }

    fn prepare_reuse(&self, resource: &mut TableReader, token: &TableToken) -> bool {
        resource.token.dir_name() == token.dir_name() && resource.reload().is_ok()
    }
}
