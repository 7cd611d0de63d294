//! Table metadata (`_meta`), the transaction/partition index (`_txn`) and
//! the cheap read-only metadata views handed out by the metadata pools.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, PartitionBy, TableId, TableToken, TimestampMicros};

use crate::fs::FilesFacade;
use crate::{META_FILE_NAME, NAME_FILE_NAME, SEQ_DIR_NAME, TXN_FILE_NAME};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
}

/// On-disk table metadata, serialized as JSON so a half-broken table can be
/// inspected during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub table_id: TableId,
    pub metadata_version: i64,
    pub partition_by: PartitionBy,
    /// Index of the designated timestamp column.
    pub timestamp_index: usize,
    pub is_wal: bool,
    pub is_mat_view: bool,
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn load(ff: FilesFacade, table_dir: &Path) -> PetrelResult<Self> {
        let path = table_dir.join(META_FILE_NAME);
        let bytes = ff.read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| PetrelError::CorruptFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn store(&self, ff: FilesFacade, table_dir: &Path) -> PetrelResult<()> {
        let bytes = serde_json::to_vec_pretty(self).expect("meta serializes");
        ff.write_atomic(&table_dir.join(META_FILE_NAME), &bytes)?;
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// One partition's entry in the `_txn` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub timestamp: TimestampMicros,
    pub row_count: u64,
}

/// Binary `_txn` file: committed txn, highest applied seq txn (WAL tables)
/// and the partition row counts readers trust. Rewritten atomically on
/// every commit, so a torn commit rolls back to the previous snapshot on
/// reopen.
#[derive(Debug, Clone, Default)]
pub struct TxnFile {
    pub txn: i64,
    pub seq_txn: i64,
    pub partitions: Vec<PartitionInfo>,
}

impl TxnFile {
    pub fn load(ff: FilesFacade, table_dir: &Path) -> PetrelResult<Self> {
        let path = table_dir.join(TXN_FILE_NAME);
        let bytes = ff.read(&path)?;
        let corrupt = |reason: &str| PetrelError::CorruptFile {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        if bytes.len() < 20 {
            return Err(corrupt("short header"));
        }
        let txn = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let seq_txn = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let count = i32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        if bytes.len() < 20 + count * 16 {
            return Err(corrupt("short partition table"));
        }
        let mut partitions = Vec::with_capacity(count);
        for i in 0..count {
            let p = 20 + i * 16;
            partitions.push(PartitionInfo {
                timestamp: i64::from_le_bytes(bytes[p..p + 8].try_into().unwrap()),
                row_count: u64::from_le_bytes(bytes[p + 8..p + 16].try_into().unwrap()),
            });
        }
        Ok(Self {
            txn,
            seq_txn,
            partitions,
        })
    }

    pub fn store(&self, ff: FilesFacade, table_dir: &Path) -> PetrelResult<()> {
        let mut bytes = Vec::with_capacity(20 + self.partitions.len() * 16);
        bytes.write_all(&self.txn.to_le_bytes())?;
        bytes.write_all(&self.seq_txn.to_le_bytes())?;
        bytes.write_all(&(self.partitions.len() as i32).to_le_bytes())?;
        for p in &self.partitions {
            bytes.write_all(&p.timestamp.to_le_bytes())?;
            bytes.write_all(&p.row_count.to_le_bytes())?;
        }
        ff.write_atomic(&table_dir.join(TXN_FILE_NAME), &bytes)?;
        Ok(())
    }

    pub fn partition_index(&self, timestamp: TimestampMicros) -> Option<usize> {
        self.partitions.iter().position(|p| p.timestamp == timestamp)
    }

    pub fn row_count_total(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }
}

/// Writes the `_name` file: the current logical name of the directory's
/// table, overwritten during rename and consulted by registry
/// reconciliation as the deterministic winner.
pub fn overwrite_table_name_file(
    ff: FilesFacade,
    table_dir: &Path,
    table_name: &str,
) -> PetrelResult<()> {
    ff.write_atomic(&table_dir.join(NAME_FILE_NAME), table_name.as_bytes())?;
    Ok(())
}

pub fn read_table_name_file(ff: FilesFacade, table_dir: &Path) -> Option<String> {
    ff.read(&table_dir.join(NAME_FILE_NAME))
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
}

/// Read-only metadata view of the table as last applied to table storage.
/// Pooled in the table metadata pool.
pub struct TableMetadata {
    token: TableToken,
    meta: TableMeta,
    dir: PathBuf,
    ff: FilesFacade,
}

impl TableMetadata {
    pub fn open(ff: FilesFacade, db_root: &Path, token: TableToken) -> PetrelResult<Self> {
        let dir = db_root.join(token.dir_name());
        let meta = TableMeta::load(ff, &dir)?;
        Ok(Self {
            token,
            meta,
            dir,
            ff,
        })
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

    pub fn reload(&mut self) -> PetrelResult<()> {
        self.meta = TableMeta::load(self.ff, &self.dir)?;
        Ok(())
    }
}

/// Factory for the table metadata pool.
pub struct TableMetadataFactory {
    pub ff: FilesFacade,
    pub db_root: PathBuf,
}

impl crate::pool::ResourceFactory<TableMetadata> for TableMetadataFactory {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<TableMetadata> {
        TableMetadata::open(self.ff, &self.db_root, token.clone())
    }

    fn prepare_reuse(&self, resource: &mut TableMetadata, token: &TableToken) -> bool {
        resource.token.dir_name() == token.dir_name() && resource.reload().is_ok()
    }
}

/// Metadata as seen by the sequencer: the most up-to-date schema of a WAL
/// table, read from `seq/_meta`. Pooled in the sequencer metadata pool.
pub struct SequencerMetadata {
    token: TableToken,
    meta: TableMeta,
    dir: PathBuf,
    ff: FilesFacade,
}

impl SequencerMetadata {
    pub fn open(ff: FilesFacade, db_root: &Path, token: TableToken) -> PetrelResult<Self> {
        debug_assert!(token.is_wal());
        let dir = db_root.join(token.dir_name()).join(SEQ_DIR_NAME);
        let meta = TableMeta::load(ff, &dir)?;
        Ok(Self {
            token,
            meta,
            dir,
            ff,
        })
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

    pub fn reload(&mut self) -> PetrelResult<()> {
        self.meta = TableMeta::load(self.ff, &self.dir)?;
        Ok(())
    }
}

/// Factory for the sequencer metadata pool.
pub struct SequencerMetadataFactory {
    pub ff: FilesFacade,
    pub db_root: PathBuf,
}

impl crate::pool::ResourceFactory<SequencerMetadata> for SequencerMetadataFactory {
    fn new_resource(&self, token: &TableToken) -> PetrelResult<SequencerMetadata> {
        SequencerMetadata::open(self.ff, &self.db_root, token.clone())
    }

    fn prepare_reuse(&self, resource: &mut SequencerMetadata, token: &TableToken) -> bool {
        resource.token.dir_name() == token.dir_name() && resource.reload().is_ok()
    }
}
