//! Memory-mapped file primitives: an append-oriented read-write mapping used
//! by the WAL event writer and the column-version writer, and a resizable
//! read-only mapping used by readers.
//!
//! Multi-byte integers are little-endian. Strings are i32-length-prefixed
//! UTF-8; a length of -1 encodes null.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::fs::FilesFacade;

/// Null marker in length-prefixed string encoding.
pub const NULL_STR_LEN: i32 = -1;

/// Append-oriented read-write mapping. The file grows in `page_size`
/// quanta; the logical append offset trails the mapped length.
pub struct RwMem {
    file: File,
    map: MmapMut,
    path: PathBuf,
    append: usize,
    page_size: usize,
}

impl RwMem {
    pub fn open(ff: FilesFacade, path: &Path, page_size: usize) -> io::Result<Self> {
        let file = ff.open_rw(path)?;
        let len = file.metadata()?.len() as usize;
        let mapped = len.max(page_size);
        file.set_len(mapped as u64)?;
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            append: 0,
            page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_offset(&self) -> usize {
        self.append
    }

    /// Repositions the append cursor. Data past the cursor is left in place
    /// and overwritten by subsequent puts.
    pub fn jump_to(&mut self, offset: usize) {
        self.append = offset;
    }

    fn ensure(&mut self, needed: usize) -> io::Result<()> {
        if needed <= self.map.len() {
            return Ok(());
        }
        let new_len = needed.div_ceil(self.page_size) * self.page_size;
        self.file.set_len(new_len as u64)?;
        self.map = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let end = self.append + bytes.len();
        self.ensure(end)?;
        self.map[self.append..end].copy_from_slice(bytes);
        self.append = end;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> io::Result<()> {
        self.put_bytes(&[v])
    }

    pub fn put_bool(&mut self, v: bool) -> io::Result<()> {
        self.put_u8(v as u8)
    }

    pub fn put_i32(&mut self, v: i32) -> io::Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> io::Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_f32(&mut self, v: f32) -> io::Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_f64(&mut self, v: f64) -> io::Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_str(&mut self, v: Option<&str>) -> io::Result<()> {
        match v {
            None => self.put_i32(NULL_STR_LEN),
            Some(s) => {
                self.put_i32(s.len() as i32)?;
                self.put_bytes(s.as_bytes())
            }
        }
    }

    /// Patches a previously written i32 without moving the append cursor.
    pub fn put_i32_at(&mut self, offset: usize, v: i32) -> io::Result<()> {
        self.ensure(offset + 4)?;
        self.map[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn put_i64_at(&mut self, offset: usize, v: i64) -> io::Result<()> {
        self.ensure(offset + 8)?;
        self.map[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn get_i32_at(&self, offset: usize) -> i32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[offset..offset + 4]);
        i32::from_le_bytes(buf)
    }

    pub fn get_i64_at(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        i64::from_le_bytes(buf)
    }

    /// Volatile i64 store with a preceding release fence. The seqlock
    /// version word is published through this so a concurrent mapping of
    /// the same file never observes it ahead of the payload.
    pub fn put_i64_volatile_at(&mut self, offset: usize, v: i64) -> io::Result<()> {
        self.ensure(offset + 8)?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        unsafe {
            let ptr = self.map.as_mut_ptr().add(offset) as *mut i64;
            std::ptr::write_volatile(ptr, v.to_le());
        }
        Ok(())
    }

    /// Initiates or completes writeback of the mapped range.
    pub fn sync(&self, async_flush: bool) -> io::Result<()> {
        if async_flush {
            self.map.flush_async()
        } else {
            self.map.flush()
        }
    }

}

/// Resizable read-only mapping.
pub struct RoMem {
    file: File,
    map: Mmap,
    path: PathBuf,
}

impl RoMem {
    pub fn open(ff: FilesFacade, path: &Path) -> io::Result<Self> {
        let file = ff.open_ro(path)?;
        let map = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Remaps if the file has grown past the current mapping.
    pub fn resize(&mut self, needed: usize) -> io::Result<()> {
        if needed <= self.map.len() {
            return Ok(());
        }
        self.map = unsafe { MmapOptions::new().map(&self.file)? };
        Ok(())
    }

    pub fn get_u8_at(&self, offset: usize) -> u8 {
        self.map[offset]
    }

    pub fn get_i32_at(&self, offset: usize) -> i32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[offset..offset + 4]);
        i32::from_le_bytes(buf)
    }

    pub fn get_i64_at(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        i64::from_le_bytes(buf)
    }

    pub fn get_f64_at(&self, offset: usize) -> f64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        f64::from_le_bytes(buf)
    }

    /// Volatile i64 load with a following acquire fence; the seqlock
    /// version word is read through this.
    pub fn get_i64_volatile_at(&self, offset: usize) -> i64 {
        let v = unsafe {
            let ptr = self.map.as_ptr().add(offset) as *const i64;
            std::ptr::read_volatile(ptr)
        };
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        i64::from_le(v)
    }

    /// Reads a length-prefixed string at `offset`; returns the value and the
    /// number of bytes consumed.
    pub fn get_str_at(&self, offset: usize) -> io::Result<(Option<String>, usize)> {
        let len = self.get_i32_at(offset);
        if len == NULL_STR_LEN {
            return Ok((None, 4));
        }
        let len = len as usize;
        let start = offset + 4;
        let bytes = &self.map[start..start + len];
        let s = std::str::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_string();
        Ok((Some(s), 4 + len))
    }
}
