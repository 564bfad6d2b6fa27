//! Memory-mapped offset index.
//!
//! The index maps a record's offset relative to its segment base to the
//! position of its frame in the store file. Entries are fixed width:
//!
//! ```text
//! ┌─────────────────┬───────────────┐
//! │ rel_off (u32 BE)│ pos (u64 BE)  │  = 12 bytes
//! └─────────────────┴───────────────┘
//! ```
//!
//! The file is grown to its configured maximum on open and memory-mapped
//! read/write; `size` tracks the bytes holding valid entries. Closing
//! truncates the file back to `size` so a reopen recovers exactly the
//! entries that were written.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Width of one index entry in bytes.
pub const ENTRY_WIDTH: u64 = 12;

const OFF_WIDTH: usize = 4;

/// Fixed-width offset → store-position table over a memory-mapped file.
pub struct Index {
    file: File,
    mmap: MmapMut,
    size: u64,
    path: PathBuf,
}

impl Index {
    /// Open (or create) the index at `path`, sizing the mapping to
    /// `max_index_bytes`.
    ///
    /// The valid-entry count is recovered from the file's pre-truncate
    /// length, which relies on [`Index::close`] having truncated the file
    /// on the previous shutdown.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            size,
            path,
        })
    }

    /// Read the entry at relative offset `rel`, or the last entry when
    /// `rel` is `-1`. Returns `(relative_offset, store_position)`.
    pub fn read(&self, rel: i64) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Ok((0, 0));
        }

        let entry = if rel == -1 {
            (self.size / ENTRY_WIDTH) - 1
        } else {
            rel as u64
        };

        let pos = entry * ENTRY_WIDTH;
        if pos + ENTRY_WIDTH > self.size {
            return Err(Error::EndOfIndex);
        }

        let pos = pos as usize;
        let off = u32::from_be_bytes(self.mmap[pos..pos + OFF_WIDTH].try_into().unwrap());
        let store_pos = u64::from_be_bytes(
            self.mmap[pos + OFF_WIDTH..pos + ENTRY_WIDTH as usize]
                .try_into()
                .unwrap(),
        );
        Ok((off, store_pos))
    }

    /// Append an entry. Fails with [`Error::EndOfIndex`] once the mapping
    /// is full, which the log treats as the segment rotation trigger.
    pub fn write(&mut self, rel: u32, store_pos: u64) -> Result<()> {
        if (self.mmap.len() as u64) < self.size + ENTRY_WIDTH {
            return Err(Error::EndOfIndex);
        }

        let pos = self.size as usize;
        self.mmap[pos..pos + OFF_WIDTH].copy_from_slice(&rel.to_be_bytes());
        self.mmap[pos + OFF_WIDTH..pos + ENTRY_WIDTH as usize]
            .copy_from_slice(&store_pos.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// True when no entries have been written.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes holding valid entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flush the mapping and the file, then truncate the file to the valid
    /// entry region so the next open recovers it.
    pub fn close(&mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
