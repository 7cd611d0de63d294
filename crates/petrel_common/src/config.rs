use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::CommitMode;

/// Engine configuration. The engine reads no environment directly; an
/// instance of this struct is handed in by whoever hosts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Database root; every table directory and `tables.d` live under it.
    pub db_root: PathBuf,
    /// Durability mode for WAL event syncs.
    #[serde(default)]
    pub commit_mode: CommitMode,
    /// Interval between idle-resource sweeps of the maintenance job.
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    /// Resources idle longer than this are closed by the sweep.
    #[serde(default = "default_inactive_ttl_ms")]
    pub inactive_ttl_ms: u64,
    /// Bound on the column-version seqlock retry loop.
    #[serde(default = "default_spin_lock_timeout_ms")]
    pub spin_lock_timeout_ms: u64,
    #[serde(default = "default_max_file_name_len")]
    pub max_file_name_len: usize,
    /// Growth quantum of the `_event` mapping.
    #[serde(default = "default_wal_event_append_page_size")]
    pub wal_event_append_page_size: usize,
    #[serde(default = "default_reader_pool_capacity")]
    pub reader_pool_capacity: usize,
    #[serde(default = "default_metadata_pool_capacity")]
    pub metadata_pool_capacity: usize,
    #[serde(default = "default_wal_writer_pool_capacity")]
    pub wal_writer_pool_capacity: usize,
    #[serde(default = "default_notification_queue_capacity")]
    pub wal_txn_notification_queue_capacity: usize,
    #[serde(default = "default_writer_command_queue_capacity")]
    pub writer_command_queue_capacity: usize,
    #[serde(default = "default_mat_views_enabled")]
    pub mat_views_enabled: bool,
}

fn default_idle_check_interval_ms() -> u64 {
    300_000
}

fn default_inactive_ttl_ms() -> u64 {
    600_000
}

fn default_spin_lock_timeout_ms() -> u64 {
    1_000
}

fn default_max_file_name_len() -> usize {
    127
}

fn default_wal_event_append_page_size() -> usize {
    16 * 1024
}

fn default_reader_pool_capacity() -> usize {
    8
}

fn default_metadata_pool_capacity() -> usize {
    8
}

fn default_wal_writer_pool_capacity() -> usize {
    4
}

fn default_notification_queue_capacity() -> usize {
    256
}

fn default_writer_command_queue_capacity() -> usize {
    64
}

fn default_mat_views_enabled() -> bool {
    true
}

impl EngineConfig {
    /// A configuration rooted at `db_root` with every other knob at its
    /// default.
    pub fn new(db_root: impl Into<PathBuf>) -> Self {
        Self {
            db_root: db_root.into(),
            commit_mode: CommitMode::default(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            inactive_ttl_ms: default_inactive_ttl_ms(),
            spin_lock_timeout_ms: default_spin_lock_timeout_ms(),
            max_file_name_len: default_max_file_name_len(),
            wal_event_append_page_size: default_wal_event_append_page_size(),
            reader_pool_capacity: default_reader_pool_capacity(),
            metadata_pool_capacity: default_metadata_pool_capacity(),
            wal_writer_pool_capacity: default_wal_writer_pool_capacity(),
            wal_txn_notification_queue_capacity: default_notification_queue_capacity(),
            writer_command_queue_capacity: default_writer_command_queue_capacity(),
            mat_views_enabled: default_mat_views_enabled(),
        }
    }

    /// Validates a table name against length and character constraints.
    pub fn is_valid_table_name(&self, name: &str) -> bool {
        if name.is_empty() || name.len() > self.max_file_name_len {
            return false;
        }
        if name.starts_with('.') || name.ends_with('.') {
            return false;
        }
        !name.chars().any(|c| {
            matches!(
                c,
                '/' | '\\' | '?' | '*' | ':' | '"' | '\'' | '~' | '\0' | '\n' | '\r'
            )
        })
    }
}
