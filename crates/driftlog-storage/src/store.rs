//! Append-only record store.
//!
//! A store is a single file holding a concatenation of length-prefixed
//! frames:
//!
//! ```text
//! ┌──────────────┬──────────────┐
//! │ len (u64 BE) │ bytes (len)  │ ...repeated...
//! └──────────────┴──────────────┘
//! ```
//!
//! Appends go through a buffered writer to amortize syscalls; any read
//! flushes the buffer first so file-visible state never lags an observed
//! append. A half-written trailing frame left by an unclean shutdown is
//! truncated away when the store is reopened.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::warn;

use crate::error::Result;

/// Width of the frame length prefix in bytes.
pub const LEN_WIDTH: u64 = 8;

struct Inner {
    buf: BufWriter<File>,
    size: u64,
}

/// Append-only, length-prefixed byte log over a single file.
pub struct Store {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store file at `path`.
    ///
    /// The logical size is recovered from the file length after discarding
    /// any torn trailing frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let size = recover_size(&file, &path)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                buf: BufWriter::new(file),
                size,
            }),
            path,
        })
    }

    /// Append a record frame, returning the number of bytes written
    /// (including the length prefix) and the position the frame starts at.
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.size;

        inner.buf.write_all(&(p.len() as u64).to_be_bytes())?;
        inner.buf.write_all(p)?;

        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the record frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.flush()?;

        let file = inner.buf.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;

        let len = u64::from_be_bytes(len_buf);
        let mut data = vec![0u8; len as usize];
        file.read_exact_at(&mut data, pos + LEN_WIDTH)?;
        Ok(Bytes::from(data))
    }

    /// Positional read into `buf` at `off`, used by snapshot streaming.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.flush()?;
        inner.buf.get_ref().read_exact_at(buf, off)?;
        Ok(buf.len())
    }

    /// Flush buffered appends through to the file.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.flush()?;
        Ok(())
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    /// Flush and release the store. The file handle closes on drop.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.flush()?;
        inner.buf.get_ref().sync_all()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Walk the frame stream and truncate a torn trailing frame, returning the
/// recovered logical size.
fn recover_size(file: &File, path: &Path) -> Result<u64> {
    let file_len = file.metadata()?.len();
    let mut pos = 0u64;

    while pos < file_len {
        if pos + LEN_WIDTH > file_len {
            break;
        }
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;
        let len = u64::from_be_bytes(len_buf);
        if pos + LEN_WIDTH + len > file_len {
            break;
        }
        pos += LEN_WIDTH + len;
    }

    if pos < file_len {
        warn!(
            path = %path.display(),
            file_len,
            recovered = pos,
            "discarding torn trailing frame"
        );
        file.set_len(pos)?;
    }
    Ok(pos)
}
