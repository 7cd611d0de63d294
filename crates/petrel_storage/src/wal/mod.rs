//! Per-table write-ahead log: framed event records, segment row storage and
//! the writer resource that owns a segment.

pub mod events;
pub mod writer;

pub use events::{
    BindValue, DataInfo, SymbolMapDiff, WalEventBody, WalEventReader, WalEventRecord,
    WalEventWriter,
};
pub use writer::WalWriter;

/// Offset of the highest-committed-txn header slot.
pub const WALE_MAX_TXN_OFFSET_32: usize = 0;
/// Offset of the format-version header slot.
pub const WAL_FORMAT_OFFSET_32: usize = 4;
/// Offset of the first record's length slot; also the initial entry of the
/// event index file.
pub const WALE_HEADER_SIZE: usize = 8;

pub const WALE_FORMAT_VERSION: i32 = 3;
/// Format stamped into the header once the first mat-view record appears.
pub const WALE_MAT_VIEW_FORMAT_VERSION: i32 = 4;

/// Transaction record kinds.
pub const TXN_DATA: u8 = 0;
pub const TXN_SQL: u8 = 1;
pub const TXN_TRUNCATE: u8 = 2;
pub const TXN_MAT_VIEW_DATA: u8 = 3;
pub const TXN_MAT_VIEW_INVALIDATE: u8 = 4;

/// Terminates the symbol-diff block of a DATA record.
pub const END_OF_SYMBOL_DIFFS: i32 = -1;
/// Terminates one column's symbol entries within the block.
pub const END_OF_SYMBOL_ENTRIES: i32 = -2;

/// SQL command tags carried by SQL records.
pub const CMD_ALTER_TABLE: i32 = 1;
pub const CMD_UPDATE_TABLE: i32 = 2;
pub const CMD_RENAME_TABLE: i32 = 3;

/// Directory name of WAL `id` under a table directory.
pub fn wal_dir_name(wal_id: i32) -> String {
    format!("wal{wal_id}")
}

/// Directory name of a segment under a WAL directory.
pub fn segment_dir_name(segment_id: i32) -> String {
    format!("{segment_id}")
}
