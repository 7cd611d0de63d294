//! Checkpoint barrier: while a checkpoint is in progress no new reader
//! locks may be taken, so the reader set stays frozen for the snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use petrel_common::error::{PetrelError, PetrelResult};

use crate::fs::FilesFacade;

pub const REASON_CHECKPOINT_IN_PROGRESS: &str = "checkpointInProgress";

const CHECKPOINT_DIR_NAME: &str = ".checkpoint";
const MANIFEST_FILE_NAME: &str = "manifest.json";

/// One table captured by the checkpoint manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointTableEntry {
    pub table_name: String,
    pub dir_name: String,
    pub txn: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointManifest {
    pub tables: Vec<CheckpointTableEntry>,
}

pub struct CheckpointAgent {
    ff: FilesFacade,
    db_root: PathBuf,
    in_progress: AtomicBool,
}

impl CheckpointAgent {
    pub fn new(ff: FilesFacade, db_root: PathBuf) -> Self {
        Self {
            ff,
            db_root,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn manifest_path(&self) -> PathBuf {
        self.db_root.join(CHECKPOINT_DIR_NAME).join(MANIFEST_FILE_NAME)
    }

    /// Raises the barrier and persists the manifest. Fails when a
    /// checkpoint is already running.
    pub fn checkpoint_create(&self, manifest: &CheckpointManifest) -> PetrelResult<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PetrelError::CheckpointInProgress);
        }
        let result = (|| -> PetrelResult<()> {
            self.ff.mkdirs(&self.db_root.join(CHECKPOINT_DIR_NAME))?;
            let bytes = serde_json::to_vec_pretty(manifest).expect("manifest serializes");
            self.ff.write_atomic(&self.manifest_path(), &bytes)?;
            Ok(())
        })();
        if result.is_err() {
            self.in_progress.store(false, Ordering::Release);
        } else {
            tracing::info!(tables = manifest.tables.len(), "checkpoint created");
        }
        result
    }

    /// Lowers the barrier and removes the manifest.
    pub fn checkpoint_release(&self) -> PetrelResult<()> {
        let dir = self.db_root.join(CHECKPOINT_DIR_NAME);
        if self.ff.exists(&dir) {
            self.ff.unlink_or_remove(&dir)?;
        }
        self.in_progress.store(false, Ordering::Release);
        tracing::info!("checkpoint released");
        Ok(())
    }

    /// Startup reconciliation of a half-completed checkpoint: a manifest
    /// left on disk means the process died inside the barrier; the engine
    /// was never restored from the snapshot, so the manifest is discarded.
    pub fn recover(&self) -> PetrelResult<()> {
        let path = self.manifest_path();
        if self.ff.exists(&path) {
            tracing::info!("recovering from incomplete checkpoint, discarding manifest");
            self.ff.unlink_or_remove(&self.db_root.join(CHECKPOINT_DIR_NAME))?;
        }
        self.in_progress.store(false, Ordering::Release);
        Ok(())
    }

    /// The manifest on disk, if a checkpoint is active or was interrupted.
    pub fn read_manifest(&self) -> PetrelResult<Option<CheckpointManifest>> {
        let path = self.manifest_path();
        if !self.ff.exists(&path) {
            return Ok(None);
        }
        let bytes = self.ff.read(&path)?;
        let manifest =
            serde_json::from_slice(&bytes).map_err(|e| PetrelError::CorruptFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(manifest))
    }
}
