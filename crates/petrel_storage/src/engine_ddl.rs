//! DDL orchestration on the engine: CREATE/DROP/RENAME for tables and
//! materialized views.
//!
//! Every path acquires the same lock ordering: the per-name create lock,
//! then the registry, then `table_metadata_pool → sequencer_metadata_pool →
//! writer_pool → reader_pool`, all released in reverse. No other code path
//! acquires these in a different order, so DDL callers cannot deadlock.

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{PartitionBy, TableToken};

use crate::checkpoint::REASON_CHECKPOINT_IN_PROGRESS;
use crate::engine::{
    Engine, REASON_BUSY_READER, REASON_BUSY_SEQUENCER_METADATA_POOL,
    REASON_BUSY_TABLE_READER_METADATA_POOL,
};
use crate::mat_view::MatViewDefinition;
use crate::metadata::{overwrite_table_name_file, ColumnMeta, TableMeta};
use crate::registry::table_dir_name;
use crate::writer::create_table_files;

/// What CREATE builds. The SQL layer compiles into this; tests construct it
/// directly.
#[derive(Debug, Clone)]
pub struct TableStructure {
    pub table_name: String,
    pub partition_by: PartitionBy,
    pub timestamp_index: usize,
    pub columns: Vec<ColumnMeta>,
    pub is_wal: bool,
    pub is_mat_view: bool,
    /// Mat views only: the base table and the defining query.
    pub base_table_name: Option<String>,
    pub query: Option<String>,
}

impl Engine {
    fn valid_name_or_throw(&self, table_name: &str) -> PetrelResult<()> {
        if !self.config().is_valid_table_name(table_name) {
            return Err(PetrelError::InvalidName(table_name.to_string()));
        }
        Ok(())
    }

    fn lock_table_create(&self, token: &TableToken) -> bool {
        self.create_table_lock
            .insert(token.table_name().to_string(), token.clone())
            .is_none()
    }

    fn unlock_table_create(&self, token: &TableToken) {
        self.create_table_lock
            .remove_if(token.table_name(), |_, t| t == token);
    }

    /// Locks the full per-table pool bundle in the global order. `None`
    /// means locked; otherwise the reason naming the busy resource.
    pub fn lock_all(
        &self,
        token: &TableToken,
        lock_reason: &str,
        ignore_in_progress_checkpoint: bool,
    ) -> Option<String> {
        if !ignore_in_progress_checkpoint && self.checkpoint_in_progress() {
            return Some(REASON_CHECKPOINT_IN_PROGRESS.to_string());
        }
        // busy metadata is the same as a busy reader from the user's
        // perspective, but the reasons stay distinct for diagnostics
        if self.table_metadata_pool().lock(token, lock_reason).is_err() {
            return Some(REASON_BUSY_TABLE_READER_METADATA_POOL.to_string());
        }
        if self.sequencer_metadata_pool().lock(token, lock_reason).is_err() {
            self.table_metadata_pool().unlock(token);
            return Some(REASON_BUSY_SEQUENCER_METADATA_POOL.to_string());
        }
        if let Err(reason) = self.writer_pool().lock(token, lock_reason) {
            self.sequencer_metadata_pool().unlock(token);
            self.table_metadata_pool().unlock(token);
            return Some(reason);
        }
        if self.reader_pool().lock(token, REASON_BUSY_READER).is_err() {
            self.writer_pool().unlock(token);
            self.sequencer_metadata_pool().unlock(token);
            self.table_metadata_pool().unlock(token);
            return Some(REASON_BUSY_READER.to_string());
        }
        tracing::info!(table = %token, "locked all pools");
        None
    }

    pub fn unlock_table_unsafe(&self, token: &TableToken) {
        self.reader_pool().unlock(token);
        self.writer_pool().unlock(token);
        self.sequencer_metadata_pool().unlock(token);
        self.table_metadata_pool().unlock(token);
    }

    // ── CREATE ───────────────────────────────────────────────────────

    pub fn create_table(
        &self,
        structure: &TableStructure,
        if_not_exists: bool,
    ) -> PetrelResult<TableToken> {
        debug_assert!(!structure.is_mat_view);
        self.create_table_or_mat_view(structure, if_not_exists)
    }

    pub fn create_mat_view(
        &self,
        structure: &TableStructure,
        if_not_exists: bool,
    ) -> PetrelResult<TableToken> {
        debug_assert!(structure.is_mat_view && structure.is_wal);
        let base_name = structure.base_table_name.as_deref().ok_or_else(|| {
            PetrelError::InvalidName("mat view requires a base table".to_string())
        })?;
        let base = self.verify_table_name(base_name)?;
        let token = self.create_table_or_mat_view(structure, if_not_exists)?;
        self.mat_view_graph().add_view(
            token.clone(),
            &base,
            MatViewDefinition {
                base_table_name: base_name.to_string(),
                query: structure.query.clone().unwrap_or_default(),
            },
        );
        Ok(token)
    }

    fn create_table_or_mat_view(
        &self,
        structure: &TableStructure,
        if_not_exists: bool,
    ) -> PetrelResult<TableToken> {
        let table_name = structure.table_name.as_str();
        self.valid_name_or_throw(table_name)?;
        if structure.timestamp_index >= structure.columns.len() {
            return Err(PetrelError::InvalidName(format!(
                "designated timestamp out of range [table={table_name}]"
            )));
        }
        let table_id = self.next_table_id()?;
        let dir_name = table_dir_name(table_name, table_id, structure.is_wal);

        loop {
            let token = match self.registry().lock_table_name(
                table_name,
                &dir_name,
                table_id,
                structure.is_mat_view,
                structure.is_wal,
            ) {
                Some(token) => token,
                None => {
                    if if_not_exists {
                        if let Some(existing) = self.get_table_token_if_exists(table_name) {
                            return Ok(existing);
                        }
                        // a concurrent create holds the name; wait it out
                        std::thread::yield_now();
                        continue;
                    }
                    return Err(PetrelError::entry_unavailable("table exists"));
                }
            };

            while !self.lock_table_create(&token) {
                std::thread::yield_now();
            }

            let result = self.create_locked(structure, &token, if_not_exists);

            self.registry().unlock_table_name(&token);
            self.unlock_table_create(&token);

            return match result {
                Ok(()) => Ok(token),
                Err(e) => {
                    if structure.is_wal {
                        let _ = self.sequencer().drop_table(&token, true);
                    }
                    Err(e)
                }
            };
        }
    }

    fn create_locked(
        &self,
        structure: &TableStructure,
        token: &TableToken,
        if_not_exists: bool,
    ) -> PetrelResult<()> {
        match self.lock_all(token, "createTable", true) {
            Some(reason) => {
                if if_not_exists {
                    Ok(())
                } else {
                    Err(PetrelError::entry_unavailable(reason))
                }
            }
            None => {
                let result = (|| {
                    let dir = self.config().db_root.join(token.dir_name());
                    if self.files().exists(&dir) {
                        return Err(PetrelError::NameReserved(
                            token.table_name().to_string(),
                        ));
                    }
                    let meta = TableMeta {
                        table_id: token.table_id(),
                        metadata_version: 0,
                        partition_by: structure.partition_by,
                        timestamp_index: structure.timestamp_index,
                        is_wal: structure.is_wal,
                        is_mat_view: structure.is_mat_view,
                        columns: structure.columns.clone(),
                    };
                    create_table_files(self.files(), &self.config().db_root, token, &meta)?;
                    if structure.is_wal {
                        self.sequencer().register_table(token, &meta)?;
                    }
                    self.registry().register_name(token)?;
                    tracing::info!(table = %token, wal = structure.is_wal, "table created");
                    Ok(())
                })();
                self.unlock_table_unsafe(token);
                tracing::info!(table = %token, "unlocked all pools");
                result
            }
        }
    }

    // ── DROP ─────────────────────────────────────────────────────────

    pub fn drop_table_or_mat_view(&self, token: &TableToken) -> PetrelResult<()> {
        self.verify_table_token(token)?;
        if token.is_wal() {
            if self.registry().drop_table(token)? {
                self.sequencer().drop_table(token, false)?;
                self.mat_view_graph().drop_view_if_exists(token);
                self.purge_dropped_table(token);
            } else {
                tracing::info!(table = %token, dir = token.dir_name(), "table is already dropped");
            }
            Ok(())
        } else {
            match self.lock_all(token, "removeTable", false) {
                None => {
                    let path = self.config().db_root.join(token.dir_name());
                    let result = self.files().unlink_or_remove(&path).map_err(|e| {
                        PetrelError::critical(
                            e.errno().unwrap_or(0),
                            format!(
                                "could not remove table [name={}, dirName={}]",
                                token.table_name(),
                                token.dir_name()
                            ),
                        )
                    });
                    self.unlock_table_unsafe(token);
                    result?;
                    self.registry().drop_table(token)?;
                    self.registry().purge_token(token);
                    self.writer_pool().purge(token);
                    self.reader_pool().purge(token);
                    Ok(())
                }
                Some(reason) => Err(PetrelError::entry_unavailable(format!(
                    "could not lock '{}' [reason={reason}]",
                    token.table_name()
                ))),
            }
        }
    }

    /// Removes a dropped WAL table's directory once no pool holds it.
    /// Called on the drop path and again by the maintenance sweep for
    /// tables that were busy at drop time.
    pub fn purge_dropped_table(&self, token: &TableToken) {
        if self.lock_all(token, "purgeDropped", true).is_some() {
            return;
        }
        let path = self.config().db_root.join(token.dir_name());
        let result = if self.files().exists(&path) {
            self.files().unlink_or_remove(&path)
        } else {
            Ok(())
        };
        self.unlock_table_unsafe(token);
        match result {
            Ok(()) => {
                self.registry().purge_token(token);
                self.sequencer().purge_txn_tracker(token.dir_name());
                self.writer_pool().purge(token);
                self.reader_pool().purge(token);
                tracing::info!(table = %token, "dropped table purged");
            }
            Err(e) => {
                tracing::error!(table = %token, error = %e, "could not purge dropped table");
            }
        }
    }

    // ── RENAME ───────────────────────────────────────────────────────

    pub fn rename_table(&self, from_name: &str, to_name: &str) -> PetrelResult<TableToken> {
        self.valid_name_or_throw(from_name)?;
        self.valid_name_or_throw(to_name)?;

        let from_token = self.verify_table_name(from_name)?;
        if from_name == to_name {
            return Ok(from_token);
        }

        if from_token.is_wal() {
            let to_token = self
                .registry()
                .add_table_alias(to_name, &from_token)
                .ok_or_else(|| {
                    PetrelError::entry_unavailable(format!(
                        "cannot rename table, new name is already in use [table={from_name}, toTableName={to_name}]"
                    ))
                })?;
            let mut renamed = false;
            let result = (|| -> PetrelResult<()> {
                {
                    let mut wal_writer = self.get_wal_writer(&from_token)?;
                    let seq_txn = wal_writer.rename_table(to_name)?;
                    tracing::info!(
                        from = from_name,
                        to = to_name,
                        wal = wal_writer.wal_id(),
                        seq_txn,
                        "renaming table"
                    );
                }
                renamed = true;
                overwrite_table_name_file(
                    self.files(),
                    &self.config().db_root.join(to_token.dir_name()),
                    to_name,
                )?;
                Ok(())
            })();
            if renamed {
                self.registry().rename(&from_token, &to_token)?;
            } else {
                tracing::info!(from = from_name, to = to_name, "failed to rename table");
                self.registry().remove_alias(&to_token);
            }
            result?;
            Ok(to_token)
        } else {
            match self.lock_all(&from_token, "renameTable", false) {
                None => {
                    let result = self.rename_non_wal(&from_token, to_name);
                    self.unlock_table_unsafe(&from_token);
                    let to_token = result?;
                    self.registry().drop_table(&from_token)?;
                    self.registry().purge_token(&from_token);
                    Ok(to_token)
                }
                Some(reason) => {
                    tracing::error!(from = from_name, to = to_name, reason = %reason, "could not lock and rename");
                    Err(PetrelError::entry_unavailable(reason))
                }
            }
        }
    }

    /// Non-WAL rename: filesystem move of the table directory, then the
    /// registry swing. The caller holds all pools.
    fn rename_non_wal(
        &self,
        from_token: &TableToken,
        to_name: &str,
    ) -> PetrelResult<TableToken> {
        let to_dir = table_dir_name(to_name, from_token.table_id(), false);
        let to_token = self
            .registry()
            .lock_table_name(
                to_name,
                &to_dir,
                from_token.table_id(),
                from_token.is_mat_view(),
                false,
            )
            .ok_or_else(|| PetrelError::entry_unavailable("rename target exists"))?;

        while !self.lock_table_create(&to_token) {
            std::thread::yield_now();
        }

        let result = (|| -> PetrelResult<()> {
            let from_path = self.config().db_root.join(from_token.dir_name());
            let to_path = self.config().db_root.join(to_token.dir_name());
            self.files().rename(&from_path, &to_path).map_err(|e| {
                PetrelError::critical(
                    crate::fs::errno_of(&e),
                    format!(
                        "could not rename [from={}, to={}]",
                        from_path.display(),
                        to_path.display()
                    ),
                )
            })?;
            overwrite_table_name_file(self.files(), &to_path, to_name)?;
            self.registry().register_name(&to_token)?;
            Ok(())
        })();

        self.registry().unlock_table_name(&to_token);
        self.unlock_table_create(&to_token);
        result.map(|()| to_token)
    }

    /// Applies a rename observed in the WAL (recovery or the apply job):
    /// swings the registry to whatever the event log says, keeping the
    /// directory.
    pub fn apply_table_rename(&self, token: &TableToken, new_name: &str) -> PetrelResult<()> {
        let Some(current) = self.registry().get_token_by_dir_name(token.dir_name()) else {
            return Ok(());
        };
        if current.table_name() == new_name {
            return Ok(());
        }
        let new_token = current.renamed(new_name);
        overwrite_table_name_file(
            self.files(),
            &self.config().db_root.join(current.dir_name()),
            new_name,
        )?;
        self.registry().rename(&current, &new_token)?;
        tracing::info!(from = current.table_name(), to = new_name, "applied WAL rename");
        Ok(())
    }
}
