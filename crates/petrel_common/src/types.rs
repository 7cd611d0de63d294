use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch. Designated timestamps, partition
/// boundaries and WAL min/max timestamps are all expressed in this unit.
pub type TimestampMicros = i64;

/// Partition timestamp sentinel: the column-version record applies to all
/// partitions (it records when the column was first added to the table).
pub const COL_TOP_DEFAULT_PARTITION: TimestampMicros = i64::MIN;

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_HOUR: i64 = 3_600 * MICROS_PER_SECOND;
pub const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Engine-wide table identifier, allocated once at CREATE and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub i32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable identity of a table.
///
/// The token pins `dir_name`, the on-disk directory, which never changes
/// across a rename; only the logical `table_name` does. Tokens compare by
/// value on all fields, so two tokens with the same `table_id` but different
/// names indicate a stale reference held by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct TokenInner {
    table_name: String,
    dir_name: String,
    table_id: TableId,
    is_wal: bool,
    is_mat_view: bool,
}

impl TableToken {
    pub fn new(
        table_name: impl Into<String>,
        dir_name: impl Into<String>,
        table_id: TableId,
        is_wal: bool,
        is_mat_view: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                table_name: table_name.into(),
                dir_name: dir_name.into(),
                table_id,
                is_wal,
                is_mat_view,
            }),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table_name
    }

    pub fn dir_name(&self) -> &str {
        &self.inner.dir_name
    }

    pub fn table_id(&self) -> TableId {
        self.inner.table_id
    }

    pub fn is_wal(&self) -> bool {
        self.inner.is_wal
    }

    pub fn is_mat_view(&self) -> bool {
        self.inner.is_mat_view
    }

    /// A copy of this token carrying a different logical name. Used by
    /// rename: the directory and table id survive, the name swings.
    pub fn renamed(&self, new_name: impl Into<String>) -> Self {
        Self::new(
            new_name,
            self.inner.dir_name.clone(),
            self.inner.table_id,
            self.inner.is_wal,
            self.inner.is_mat_view,
        )
    }
}

impl fmt::Display for TableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.inner.table_name, self.inner.table_id)
    }
}

/// Durability mode applied when a WAL commit syncs its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// Leave flushing to the OS.
    NoSync,
    /// Initiate writeback without waiting for it (`MS_ASYNC` + fdatasync on
    /// the index file).
    #[default]
    Async,
    /// Block until data is on stable storage.
    Sync,
}

/// Partitioning interval of a table's designated timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionBy {
    Hour,
    Day,
    /// Single-partition table; all rows land in the "default" partition.
    None,
}

impl PartitionBy {
    /// Truncates a timestamp down to its partition boundary.
    pub fn floor(self, ts: TimestampMicros) -> TimestampMicros {
        match self {
            PartitionBy::Hour => ts.div_euclid(MICROS_PER_HOUR) * MICROS_PER_HOUR,
            PartitionBy::Day => ts.div_euclid(MICROS_PER_DAY) * MICROS_PER_DAY,
            PartitionBy::None => 0,
        }
    }

    /// Directory name for the partition holding `ts`, e.g. `2024-01-01`
    /// for daily partitions.
    pub fn dir_name(self, ts: TimestampMicros) -> String {
        let floor = self.floor(ts);
        match self {
            PartitionBy::None => "default".to_string(),
            PartitionBy::Day => {
                let (y, m, d) = civil_from_days(floor.div_euclid(MICROS_PER_DAY));
                format!("{y:04}-{m:02}-{d:02}")
            }
            PartitionBy::Hour => {
                let days = floor.div_euclid(MICROS_PER_DAY);
                let (y, m, d) = civil_from_days(days);
                let hour = (floor - days * MICROS_PER_DAY) / MICROS_PER_HOUR;
                format!("{y:04}-{m:02}-{d:02}T{hour:02}")
            }
        }
    }
}

/// Days-since-epoch to (year, month, day), civil calendar.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Date,
    Timestamp,
    Str,
    /// Interned string; stored as i32 codes mapped through a per-column
    /// dictionary.
    Symbol,
}

impl ColumnType {
    /// Fixed on-disk width in bytes, or `None` for variable-length columns.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ColumnType::Bool | ColumnType::Byte => Some(1),
            ColumnType::Short | ColumnType::Char => Some(2),
            ColumnType::Int | ColumnType::Float | ColumnType::Symbol => Some(4),
            ColumnType::Long
            | ColumnType::Double
            | ColumnType::Date
            | ColumnType::Timestamp => Some(8),
            ColumnType::Str => None,
        }
    }
}

/// A single column value as accepted by the row-append paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    Timestamp(TimestampMicros),
    Str(String),
    Symbol(String),
}
