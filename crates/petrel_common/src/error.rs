use thiserror::Error;

use crate::types::TableId;

/// Convenience alias for `Result<T, PetrelError>`.
pub type PetrelResult<T> = Result<T, PetrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `NonCritical` — user error or transient condition; safe to retry or
///   report to the client.
/// - `Critical`    — data-integrity or filesystem failure; logged and
///   surfaced, the affected table may become suspended.
/// - `Contention`  — pool/lock contention; the caller chooses retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NonCritical,
    Critical,
    Contention,
}

/// Top-level error type of the storage engine core.
#[derive(Error, Debug)]
pub enum PetrelError {
    #[error("table does not exist [table={0}]")]
    TableDoesNotExist(String),

    #[error("table name is reserved [table={0}]")]
    NameReserved(String),

    #[error("table is dropped [table={0}]")]
    TableDropped(String),

    #[error("invalid table name [table={0}]")]
    InvalidName(String),

    #[error("invalid column value [column={column}, expected={expected}]")]
    InvalidColumnValue { column: String, expected: String },

    /// Pool/lock contention. `reason` names the busy resource, e.g.
    /// `busyReader` or `checkpointInProgress`.
    #[error("entry unavailable [reason={reason}]")]
    EntryUnavailable { reason: String },

    /// The caller's `(table_id, metadata_version)` no longer matches
    /// reality; the caller must recompile against fresh metadata and retry.
    #[error(
        "table reference is out of date [table={table}, expectedId={expected_id}, actualId={actual_id}, expectedVersion={expected_version}, actualVersion={actual_version}]"
    )]
    TableReferenceOutOfDate {
        table: String,
        expected_id: TableId,
        actual_id: TableId,
        expected_version: i64,
        actual_version: i64,
    },

    #[error("table is suspended [table={0}]")]
    TableSuspended(String),

    #[error("txn timed out [table={table}, expectedTxn={expected_txn}, writerTxn={writer_txn}]")]
    TxnTimeout {
        table: String,
        expected_txn: i64,
        writer_txn: i64,
    },

    /// Data-integrity or filesystem failure with the OS errno when one was
    /// captured.
    #[error("{message} [errno={errno}]")]
    Critical { errno: i32, message: String },

    #[error("corrupt file [path={path}, reason={reason}]")]
    CorruptFile { path: String, reason: String },

    #[error("checkpoint already in progress")]
    CheckpointInProgress,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PetrelError {
    /// A critical failure carrying the OS errno from the failed syscall.
    pub fn critical(errno: i32, message: impl Into<String>) -> Self {
        PetrelError::Critical {
            errno,
            message: message.into(),
        }
    }

    pub fn entry_unavailable(reason: impl Into<String>) -> Self {
        PetrelError::EntryUnavailable {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PetrelError::Critical { .. } | PetrelError::CorruptFile { .. } => ErrorKind::Critical,
            PetrelError::Io(_) => ErrorKind::Critical,
            PetrelError::EntryUnavailable { .. } => ErrorKind::Contention,
            _ => ErrorKind::NonCritical,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::Critical
    }

    /// OS errno attached to this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            PetrelError::Critical { errno, .. } => Some(*errno),
            PetrelError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
