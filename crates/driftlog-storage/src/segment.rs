//! Segment: one store file plus one index file sharing a base offset.
//!
//! Files are named `<base_offset>.store` and `<base_offset>.index`. Record
//! offsets in a segment range over `[base_offset, next_offset)`; a record's
//! index entry holds its offset relative to the base, which must fit in a
//! u32.

use std::fs;
use std::path::{Path, PathBuf};

use driftlog_proto::Record;
use prost::Message;

use crate::config::SegmentConfig;
use crate::error::Result;
use crate::index::Index;
use crate::store::Store;

pub struct Segment {
    store: Store,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    max_store_bytes: u64,
    max_index_bytes: u64,
}

impl Segment {
    /// Open (or create) the segment with the given base offset under `dir`.
    ///
    /// `next_offset` is recovered from the last index entry, so a reopened
    /// segment continues exactly where it left off.
    pub fn open(dir: impl AsRef<Path>, base_offset: u64, config: &SegmentConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Store::open(store_path(dir, base_offset))?;
        let index = Index::open(index_path(dir, base_offset), config.max_index_bytes)?;

        let next_offset = if index.is_empty() {
            base_offset
        } else {
            let (last_rel, _) = index.read(-1)?;
            base_offset + last_rel as u64 + 1
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            max_store_bytes: config.max_store_bytes,
            max_index_bytes: config.max_index_bytes,
        })
    }

    /// Append a record, assigning it this segment's next offset.
    pub fn append(&mut self, mut record: Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;

        let mut buf = Vec::with_capacity(record.encoded_len());
        record.encode(&mut buf)?;

        let (_, pos) = self.store.append(&buf)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at the given absolute offset.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let data = self.store.read(pos)?;
        Ok(Record::decode(data)?)
    }

    /// True when this segment covers `offset`.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.next_offset
    }

    /// Whether the store or the index has reached its size ceiling.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.max_store_bytes || self.index.size() >= self.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Size of the store file in bytes, for snapshot streaming.
    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Flush the store and hand back its file path, for snapshot streaming.
    pub fn store_snapshot_source(&self) -> Result<(PathBuf, u64)> {
        self.store.flush()?;
        Ok((self.store.path().to_path_buf(), self.store.size()))
    }

    /// Close both files; the index truncates itself to its valid entries.
    pub fn close(&mut self) -> Result<()> {
        self.store.close()?;
        self.index.close()?;
        Ok(())
    }

    /// Close the segment and delete its files.
    pub fn remove(&mut self) -> Result<()> {
        self.close()?;
        fs::remove_file(self.store.path())?;
        fs::remove_file(self.index.path())?;
        Ok(())
    }
}

pub(crate) fn store_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{}.store", base_offset))
}

pub(crate) fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{}.index", base_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ENTRY_WIDTH;
    use crate::store::LEN_WIDTH;
    use tempfile::TempDir;

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn append_read_assigns_offsets() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            initial_offset: 16,
            ..Default::default()
        };
        let mut segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 16);

        for i in 0..3u64 {
            let off = segment.append(record("hello world")).unwrap();
            assert_eq!(off, 16 + i);
            let got = segment.read(off).unwrap();
            assert_eq!(got.value, b"hello world");
            assert_eq!(got.offset, off);
        }
    }

    #[test]
    fn maxed_by_index() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENTRY_WIDTH * 3,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();

        for _ in 0..3 {
            assert!(!segment.is_maxed());
            segment.append(record("hi")).unwrap();
        }
        assert!(segment.is_maxed());
    }

    #[test]
    fn maxed_by_store() {
        let dir = TempDir::new().unwrap();
        let value = "hello world";
        let encoded_len = record(value).encoded_len() as u64;
        let config = SegmentConfig {
            // Room for two frames, not three.
            max_store_bytes: 2 * (encoded_len + LEN_WIDTH),
            max_index_bytes: 1024,
            initial_offset: 0,
        };
        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();

        segment.append(record(value)).unwrap();
        assert!(!segment.is_maxed());
        segment.append(record(value)).unwrap();
        assert!(segment.is_maxed());
    }

    #[test]
    fn reopen_recovers_next_offset() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig::default();

        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();
        segment.append(record("a")).unwrap();
        segment.append(record("b")).unwrap();
        segment.close().unwrap();
        drop(segment);

        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();
        assert_eq!(segment.next_offset(), 2);
        assert_eq!(segment.append(record("c")).unwrap(), 2);
        assert_eq!(segment.read(0).unwrap().value, b"a");
    }

    #[test]
    fn remove_deletes_files() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig::default();
        let mut segment = Segment::open(dir.path(), 0, &config).unwrap();
        segment.append(record("a")).unwrap();
        segment.remove().unwrap();

        assert!(!store_path(dir.path(), 0).exists());
        assert!(!index_path(dir.path(), 0).exists());
    }
}
