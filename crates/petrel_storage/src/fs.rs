//! Thin abstraction over filesystem syscalls. Everything the engine does to
//! disk goes through here so errors carry the OS errno and tests can observe
//! a single choke point.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use petrel_common::error::PetrelError;

/// Captures the errno of an `io::Error`, defaulting to 0 when the error has
/// no OS code (e.g. unexpected EOF).
pub fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(0)
}

/// Stateless facade; cheap to clone into any component that touches disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesFacade;

impl FilesFacade {
    pub fn open_rw(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
    }

    pub fn open_ro(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    pub fn open_append(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub fn mkdirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    pub fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    /// Atomic overwrite: write to a sibling temp file, fsync, rename over.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = self.open_rw(&tmp)?;
            file.set_len(0)?;
            file.write_all_at(data, 0)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, path)
    }

    pub fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }

    pub fn fdatasync(&self, file: &File) -> io::Result<()> {
        file.sync_data()
    }

    pub fn fsync(&self, file: &File) -> io::Result<()> {
        file.sync_all()
    }

    pub fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    /// Removes `path` whether it is a file or a directory tree. Used by the
    /// drop path; failure there is critical.
    pub fn unlink_or_remove(&self, path: &Path) -> Result<(), PetrelError> {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| {
            PetrelError::critical(
                errno_of(&e),
                format!("could not remove [path={}]", path.display()),
            )
        })
    }

    /// Directory entries of `path`, names only. Missing directory reads as
    /// empty.
    pub fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        match fs::read_dir(path) {
            Ok(entries) => {
                let mut names = Vec::new();
                for entry in entries.flatten() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(names)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}
