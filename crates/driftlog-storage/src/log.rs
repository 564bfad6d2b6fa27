//! The segmented log: an ordered set of segments under one directory.
//!
//! Exactly one segment (the last) is active and receives appends; the rest
//! are immutable. The sequence is contiguous: each non-initial segment's
//! base offset equals the previous segment's next offset. A read-write lock
//! serializes segment mutation against concurrent reads.

use std::cmp;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use driftlog_proto::Record;
use tracing::debug;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::segment::Segment;

pub struct Log {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    config: LogConfig,
    // Sorted by base offset; the last segment is active.
    segments: Vec<Segment>,
}

impl Log {
    /// Open the log rooted at `dir`, recovering any existing segments.
    pub fn open(dir: impl AsRef<Path>, mut config: LogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        config.segment = config.segment.validated();

        let mut base_offsets = scan_base_offsets(&dir)?;
        base_offsets.sort_unstable();

        let mut segments = Vec::with_capacity(cmp::max(base_offsets.len(), 1));
        for base in &base_offsets {
            segments.push(Segment::open(&dir, *base, &config.segment)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(&dir, config.segment.initial_offset, &config.segment)?);
        }

        debug!(dir = %dir.display(), segments = segments.len(), "log opened");
        Ok(Self {
            dir,
            inner: RwLock::new(Inner { config, segments }),
        })
    }

    /// Append a record to the active segment, rolling a new segment when
    /// the active one maxes out. Returns the assigned offset.
    pub fn append(&self, record: Record) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let last = inner.segments.len() - 1;
        let offset = inner.segments[last].append(record)?;

        if inner.segments[last].is_maxed() {
            let base = inner.segments[last].next_offset();
            let segment = Segment::open(&self.dir, base, &inner.config.segment)?;
            debug!(base, "rolled new active segment");
            inner.segments.push(segment);
        }
        Ok(offset)
    }

    /// Read the record at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let inner = self.inner.read().unwrap();
        let segment = inner
            .segments
            .iter()
            .find(|s| s.contains(offset))
            .ok_or(Error::OffsetOutOfRange(offset))?;
        segment.read(offset)
    }

    /// Offset of the oldest record still held.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.segments[0].base_offset()
    }

    /// Offset of the newest record, or 0 when nothing has been appended.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.segments[inner.segments.len() - 1]
            .next_offset()
            .saturating_sub(1)
    }

    /// Offset the next append will be assigned. Equal to `lowest_offset`
    /// only when the log holds no records.
    pub fn next_offset(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.segments[inner.segments.len() - 1].next_offset()
    }

    /// Remove every segment whose records all sit at or below `lowest`.
    /// Used for retention and after snapshot compaction.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let next = inner.segments[inner.segments.len() - 1].next_offset();

        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.next_offset() <= lowest {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        // Keep an active segment so appends continue at the next offset.
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, next, &inner.config.segment)?);
        }
        inner.segments = kept;
        Ok(())
    }

    /// A reader over the concatenated store files of every segment, in
    /// order. The stream is the length-prefixed frame sequence and is what
    /// snapshots persist.
    pub fn reader(&self) -> Result<LogReader> {
        let inner = self.inner.read().unwrap();
        let mut sources = VecDeque::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            let (path, size) = segment.store_snapshot_source()?;
            if size > 0 {
                sources.push_back((File::open(path)?, size));
            }
        }
        Ok(LogReader { sources })
    }

    /// Close all segments, delete every file, and start over at
    /// `initial_offset`. Snapshot restore uses this with the snapshot's
    /// first offset.
    pub fn reset_to(&self, initial_offset: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for segment in &mut inner.segments {
            segment.remove()?;
        }
        inner.config.segment.initial_offset = initial_offset;
        inner.segments = vec![Segment::open(&self.dir, initial_offset, &inner.config.segment)?];
        Ok(())
    }

    /// Close all segments and reopen from scratch with the current config.
    pub fn reset(&self) -> Result<()> {
        let initial = {
            let inner = self.inner.read().unwrap();
            inner.config.segment.initial_offset
        };
        self.reset_to(initial)
    }

    /// Close every segment. The index close path truncates index files to
    /// their valid entries.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for segment in &mut inner.segments {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Streams every segment's store from position 0 to its size, in segment
/// order.
pub struct LogReader {
    sources: VecDeque<(File, u64)>,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some((file, remaining)) = self.sources.front_mut() else {
                return Ok(0);
            };
            if *remaining == 0 {
                self.sources.pop_front();
                continue;
            }
            let want = cmp::min(buf.len() as u64, *remaining) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                self.sources.pop_front();
                continue;
            }
            *remaining -= n as u64;
            return Ok(n);
        }
    }
}

fn scan_base_offsets(dir: &Path) -> Result<Vec<u64>> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("store") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::MalformedSegmentName(path.display().to_string()))?;
        let base = stem
            .parse::<u64>()
            .map_err(|_| Error::MalformedSegmentName(path.display().to_string()))?;
        bases.push(base);
    }
    Ok(bases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::store::LEN_WIDTH;
    use prost::Message;
    use tempfile::TempDir;

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn open_log(dir: &Path, config: LogConfig) -> Log {
        Log::open(dir, config).unwrap()
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), LogConfig::default());

        let off = log.append(record("hello world")).unwrap();
        assert_eq!(off, 0);
        let got = log.read(off).unwrap();
        assert_eq!(got.value, b"hello world");
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn offsets_are_monotonic_without_gaps() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), LogConfig::default());

        for want in 0..64u64 {
            assert_eq!(log.append(record("r")).unwrap(), want);
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 63);
    }

    #[test]
    fn out_of_range_read_fails() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), LogConfig::default());
        log.append(record("hello world")).unwrap();

        match log.read(1) {
            Err(Error::OffsetOutOfRange(off)) => assert_eq!(off, 1),
            other => panic!("expected OffsetOutOfRange, got {:?}", other.map(|r| r.offset)),
        }
    }

    #[test]
    fn rollover_at_store_ceiling() {
        // Two framed "hello world" records overflow a 32-byte store, so
        // the third append lands in a fresh segment.
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            segment: SegmentConfig {
                max_store_bytes: 32,
                ..Default::default()
            },
        };
        let log = open_log(dir.path(), config);

        for _ in 0..3 {
            log.append(record("hello world")).unwrap();
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        for off in 0..3 {
            assert_eq!(log.read(off).unwrap().value, b"hello world");
        }

        let stores = scan_base_offsets(dir.path()).unwrap();
        assert_eq!(stores.len(), 2);
    }

    #[test]
    fn reopen_preserves_range_and_bytes() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            segment: SegmentConfig {
                max_store_bytes: 64,
                ..Default::default()
            },
        };

        let log = open_log(dir.path(), config.clone());
        for i in 0..10 {
            log.append(record(&format!("record-{}", i))).unwrap();
        }
        log.close().unwrap();
        drop(log);

        let log = open_log(dir.path(), config);
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 9);
        for i in 0..10u64 {
            assert_eq!(log.read(i).unwrap().value, format!("record-{}", i).as_bytes());
        }
        // And appends continue with no gap.
        assert_eq!(log.append(record("next")).unwrap(), 10);
    }

    #[test]
    fn truncate_drops_whole_segments() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            segment: SegmentConfig {
                max_store_bytes: 32,
                ..Default::default()
            },
        };
        let log = open_log(dir.path(), config);

        for _ in 0..6 {
            log.append(record("hello world")).unwrap();
        }
        // Segments cover [0,2), [2,4), [4,6); drop the first two.
        log.truncate(4).unwrap();

        assert!(log.lowest_offset() >= 4);
        assert!(matches!(log.read(1), Err(Error::OffsetOutOfRange(1))));
        for off in log.lowest_offset()..=log.highest_offset() {
            assert_eq!(log.read(off).unwrap().value, b"hello world");
        }
    }

    #[test]
    fn reader_streams_all_frames() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), LogConfig::default());
        for i in 0..3 {
            log.append(record(&format!("r{}", i))).unwrap();
        }

        let mut data = Vec::new();
        log.reader().unwrap().read_to_end(&mut data).unwrap();

        // Parse the frame stream back into records.
        let mut cursor = 0usize;
        let mut decoded = Vec::new();
        while cursor < data.len() {
            let len =
                u64::from_be_bytes(data[cursor..cursor + LEN_WIDTH as usize].try_into().unwrap())
                    as usize;
            cursor += LEN_WIDTH as usize;
            decoded.push(Record::decode(&data[cursor..cursor + len]).unwrap());
            cursor += len;
        }
        assert_eq!(decoded.len(), 3);
        for (i, rec) in decoded.iter().enumerate() {
            assert_eq!(rec.offset, i as u64);
            assert_eq!(rec.value, format!("r{}", i).as_bytes());
        }
    }

    #[test]
    fn reset_to_restarts_at_offset() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path(), LogConfig::default());
        for _ in 0..5 {
            log.append(record("x")).unwrap();
        }

        log.reset_to(100).unwrap();
        assert_eq!(log.lowest_offset(), 100);
        assert_eq!(log.append(record("y")).unwrap(), 100);
        assert!(log.read(0).is_err());
    }

    #[test]
    fn initial_offset_shifts_first_segment() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            segment: SegmentConfig {
                initial_offset: 1,
                ..Default::default()
            },
        };
        let log = open_log(dir.path(), config);
        assert_eq!(log.append(record("first")).unwrap(), 1);
        assert_eq!(log.lowest_offset(), 1);
        assert_eq!(log.highest_offset(), 1);
    }
}
