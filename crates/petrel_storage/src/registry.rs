//! Authoritative table name ↔ token mapping with lock/rename/drop states,
//! persisted in an append-then-compact `tables.d` file under the database
//! root.
//!
//! An entry is in exactly one state: absent (free), `Locked` (create in
//! flight), `Live`, or `LockedDrop` (drop in flight). Concurrent lookups
//! always see a definite answer, never a race between "free" and "exists".

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use dashmap::DashMap;
use parking_lot::Mutex;

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{TableId, TableToken};

use crate::fs::FilesFacade;
use crate::metadata::read_table_name_file;
use crate::TABLES_FILE_NAME;

/// Directory name for a new table. WAL table directories are mangled with
/// the table id so a dropped-and-recreated table never collides with its
/// own WAL directories pending purge.
pub fn table_dir_name(table_name: &str, table_id: TableId, is_wal: bool) -> String {
    if is_wal {
        format!("{table_name}~{}", table_id.0)
    } else {
        table_name.to_string()
    }
}

#[derive(Debug, Clone)]
pub enum RegistryEntry {
    /// Reserved by an in-flight create; resolves but is not usable.
    Locked(TableToken),
    Live(TableToken),
    /// Dropped, directories pending purge.
    LockedDrop(TableToken),
}

impl RegistryEntry {
    pub fn token(&self) -> &TableToken {
        match self {
            RegistryEntry::Locked(t) | RegistryEntry::Live(t) | RegistryEntry::LockedDrop(t) => t,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RegistryEntry::Live(_))
    }
}

struct RegistryLog {
    file: File,
}

impl RegistryLog {
    fn append(&mut self, ff: FilesFacade, line: &str) -> PetrelResult<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        ff.fdatasync(&self.file)?;
        Ok(())
    }
}

pub struct TableNameRegistry {
    ff: FilesFacade,
    db_root: PathBuf,
    names: DashMap<String, RegistryEntry>,
    by_dir: DashMap<String, TableToken>,
    log: Mutex<RegistryLog>,
}

fn add_line(token: &TableToken) -> String {
    format!(
        "add\t{}\t{}\t{}\t{}\t{}",
        token.dir_name(),
        token.table_id(),
        token.is_wal() as u8,
        token.is_mat_view() as u8,
        token.table_name()
    )
}

fn drop_line(token: &TableToken) -> String {
    format!("drop\t{}\t{}", token.dir_name(), token.table_name())
}

impl TableNameRegistry {
    pub fn open(ff: FilesFacade, db_root: PathBuf) -> PetrelResult<Self> {
        let file = ff.open_append(&db_root.join(TABLES_FILE_NAME))?;
        let registry = Self {
            ff,
            db_root,
            names: DashMap::new(),
            by_dir: DashMap::new(),
            log: Mutex::new(RegistryLog { file }),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Rebuilds the in-memory maps from `tables.d`.
    pub fn reload(&self) -> PetrelResult<()> {
        self.names.clear();
        self.by_dir.clear();
        let path = self.db_root.join(TABLES_FILE_NAME);
        let bytes = self.ff.read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                ["add", dir, id, wal, mv, name] => {
                    let id: i32 = id.parse().map_err(|_| PetrelError::CorruptFile {
                        path: path.display().to_string(),
                        reason: format!("bad table id in line '{line}'"),
                    })?;
                    let token =
                        TableToken::new(*name, *dir, TableId(id), *wal == "1", *mv == "1");
                    self.by_dir.insert(dir.to_string(), token.clone());
                    self.names
                        .insert(name.to_string(), RegistryEntry::Live(token));
                }
                ["drop", dir, name] => {
                    if let Some(entry) = self.names.get(*name) {
                        if entry.token().dir_name() == *dir {
                            drop(entry);
                            self.names.remove(*name);
                        }
                    }
                    self.by_dir.remove(*dir);
                }
                _ => {
                    tracing::warn!(line, "skipping malformed registry line");
                }
            }
        }
        tracing::info!(tables = self.names.len(), "table name registry reloaded");
        Ok(())
    }

    /// Inserts a `Locked` placeholder when `name` is free. Returns a fresh
    /// token on success, `None` on conflict.
    pub fn lock_table_name(
        &self,
        name: &str,
        dir_name: &str,
        table_id: TableId,
        is_mat_view: bool,
        is_wal: bool,
    ) -> Option<TableToken> {
        if self.by_dir.contains_key(dir_name) {
            return None;
        }
        let token = TableToken::new(name, dir_name, table_id, is_wal, is_mat_view);
        match self.names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(RegistryEntry::Locked(token.clone()));
                Some(token)
            }
        }
    }

    /// Promotes `Locked` → `Live` and persists the entry.
    pub fn register_name(&self, token: &TableToken) -> PetrelResult<()> {
        let mut entry = self
            .names
            .get_mut(token.table_name())
            .ok_or_else(|| PetrelError::TableDoesNotExist(token.table_name().to_string()))?;
        match &*entry {
            RegistryEntry::Locked(t) if t == token => {
                *entry = RegistryEntry::Live(token.clone());
            }
            _ => {
                return Err(PetrelError::NameReserved(token.table_name().to_string()));
            }
        }
        drop(entry);
        self.by_dir
            .insert(token.dir_name().to_string(), token.clone());
        self.log.lock().append(self.ff, &add_line(token))
    }

    /// Rolls back a failed create. A no-op unless the entry is still this
    /// token's `Locked` placeholder.
    pub fn unlock_table_name(&self, token: &TableToken) {
        self.names.remove_if(token.table_name(), |_, entry| {
            matches!(entry, RegistryEntry::Locked(t) if t == token)
        });
    }

    /// Installs `new_name` as a second live name for the token's directory.
    /// The old name stays resolvable so a crash mid-rename leaves both
    /// pointing at the same directory for reconciliation to settle.
    pub fn add_table_alias(&self, new_name: &str, token: &TableToken) -> Option<TableToken> {
        let aliased = token.renamed(new_name);
        match self.names.entry(new_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(RegistryEntry::Live(aliased.clone()));
                Some(aliased)
            }
        }
    }

    /// Removes an alias installed by [`add_table_alias`] after a failed
    /// rename.
    pub fn remove_alias(&self, token: &TableToken) {
        self.names.remove_if(token.table_name(), |_, entry| {
            entry.token().dir_name() == token.dir_name()
        });
    }

    /// Atomically swings `old` → `new` (same directory) and persists both
    /// sides of the move.
    pub fn rename(&self, old: &TableToken, new: &TableToken) -> PetrelResult<()> {
        debug_assert_eq!(old.dir_name(), new.dir_name());
        self.names
            .insert(new.table_name().to_string(), RegistryEntry::Live(new.clone()));
        self.names.remove_if(old.table_name(), |_, entry| {
            entry.token().dir_name() == old.dir_name()
        });
        self.by_dir
            .insert(new.dir_name().to_string(), new.clone());
        let mut log = self.log.lock();
        log.append(self.ff, &drop_line(old))?;
        log.append(self.ff, &add_line(new))
    }

    /// `Live` → `LockedDrop`. True when this token was the current owner.
    pub fn drop_table(&self, token: &TableToken) -> PetrelResult<bool> {
        let mut owned = false;
        if let Some(mut entry) = self.names.get_mut(token.table_name()) {
            if let RegistryEntry::Live(t) = &*entry {
                if t == token {
                    *entry = RegistryEntry::LockedDrop(token.clone());
                    owned = true;
                }
            }
        }
        if owned {
            self.log.lock().append(self.ff, &drop_line(token))?;
        }
        Ok(owned)
    }

    /// Final removal once the table's directories are purged.
    pub fn purge_token(&self, token: &TableToken) {
        self.names.remove_if(token.table_name(), |_, entry| {
            matches!(entry, RegistryEntry::LockedDrop(t) if t == token)
        });
        self.by_dir
            .remove_if(token.dir_name(), |_, t| t == token);
    }

    pub fn get_entry(&self, name: &str) -> Option<RegistryEntry> {
        self.names.get(name).map(|e| e.clone())
    }

    /// The live token for `name`, hiding locked and dropped entries.
    pub fn get_token(&self, name: &str) -> Option<TableToken> {
        self.names.get(name).and_then(|e| match &*e {
            RegistryEntry::Live(t) => Some(t.clone()),
            _ => None,
        })
    }

    pub fn get_token_by_dir_name(&self, dir_name: &str) -> Option<TableToken> {
        self.by_dir.get(dir_name).map(|t| t.clone())
    }

    pub fn is_table_dropped(&self, token: &TableToken) -> bool {
        self.names
            .get(token.table_name())
            .map(|e| {
                matches!(&*e, RegistryEntry::LockedDrop(t) if t.dir_name() == token.dir_name())
            })
            .unwrap_or(false)
    }

    pub fn table_tokens(&self, include_dropped: bool) -> Vec<TableToken> {
        self.names
            .iter()
            .filter_map(|e| match e.value() {
                RegistryEntry::Live(t) => Some(t.clone()),
                RegistryEntry::LockedDrop(t) if include_dropped => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn table_count(&self, include_dropped: bool) -> usize {
        self.table_tokens(include_dropped).len()
    }

    /// Settles post-crash state and compacts `tables.d`.
    ///
    /// When two live names point at one directory (a crash between
    /// `add_table_alias` and rename finalization), the winner is the name
    /// recorded in the directory's `_name` file; with no `_name` file the
    /// lexicographically smaller name wins so recovery is deterministic.
    /// The compacted file holds exactly the surviving live entries.
    pub fn reconcile(&self) -> PetrelResult<()> {
        let mut log = self.log.lock();

        let mut by_dir: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for e in self.names.iter() {
            if e.value().is_live() {
                by_dir
                    .entry(e.value().token().dir_name().to_string())
                    .or_default()
                    .push(e.key().clone());
            }
        }
        for (dir, mut names) in by_dir {
            if names.len() < 2 {
                continue;
            }
            names.sort();
            let on_disk = read_table_name_file(self.ff, &self.db_root.join(&dir));
            let winner = on_disk
                .filter(|n| names.contains(n))
                .unwrap_or_else(|| names[0].clone());
            for name in names {
                if name != winner {
                    tracing::info!(dir = %dir, loser = %name, winner = %winner, "dropping stale rename alias");
                    self.names.remove(&name);
                }
            }
            if let Some(entry) = self.names.get(&winner) {
                self.by_dir.insert(dir, entry.token().clone());
            }
        }

        let mut compacted = String::new();
        for e in self.names.iter() {
            if let RegistryEntry::Live(token) = e.value() {
                compacted.push_str(&add_line(token));
                compacted.push('\n');
            }
        }
        let path = self.db_root.join(TABLES_FILE_NAME);
        self.ff.write_atomic(&path, compacted.as_bytes())?;
        log.file = self.ff.open_append(&path)?;
        tracing::info!("table name registry reconciled");
        Ok(())
    }
}
