//! Consensus log persisted in a segmented log of its own.
//!
//! The same storage engine that holds user records also holds the Raft
//! protocol log, under `raft/log` with an initial offset of 1 (Raft indices
//! are 1-based; index 0 means "nothing"). A protocol entry maps onto a
//! record as `{ offset ← index, term ← term, kind ← kind, value ← data }`.

use std::path::Path;

use driftlog_proto::Record;
use driftlog_storage::{Log, LogConfig};

use crate::error::Result;
use crate::message::{EntryKind, LogEntry};

pub struct RaftLogStore {
    log: Log,
}

impl RaftLogStore {
    pub fn open(dir: impl AsRef<Path>, mut config: LogConfig) -> Result<Self> {
        config.segment.initial_offset = 1;
        Ok(Self {
            log: Log::open(dir, config)?,
        })
    }

    /// Index of the oldest retained entry.
    pub fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    /// Index of the newest entry, 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.log.highest_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.log.next_offset() == self.log.lowest_offset()
    }

    pub fn entry(&self, index: u64) -> Result<LogEntry> {
        let record = self.log.read(index)?;
        Ok(LogEntry {
            index: record.offset,
            term: record.term,
            kind: EntryKind::from_u32(record.kind),
            data: record.value,
        })
    }

    /// Term of the entry at `index`, 0 when the entry is not present.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Append entries in order; indices must continue the log contiguously.
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.log.append(Record {
                value: entry.data.clone(),
                offset: 0, // assigned by the log; equals entry.index by construction
                term: entry.term,
                kind: entry.kind.as_u32(),
            })?;
        }
        Ok(())
    }

    /// Entries in `[from, through]`, capped at `limit`.
    pub fn entries(&self, from: u64, through: u64, limit: usize) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut index = from;
        while index <= through && out.len() < limit {
            out.push(self.entry(index)?);
            index += 1;
        }
        Ok(out)
    }

    /// Drop entries covered by a snapshot. Truncation happens at segment
    /// granularity from the front; `min` mirrors the retention contract of
    /// the underlying log.
    pub fn delete_range(&self, min: u64, _max: u64) -> Result<()> {
        self.log.truncate(min)?;
        Ok(())
    }

    /// Remove every entry at or above `from`, keeping the prefix. Used
    /// when a follower's log conflicts with the leader's: the kept prefix
    /// is read back, the log is reset, and the prefix re-appended.
    pub fn truncate_suffix(&self, from: u64) -> Result<()> {
        let first = self.first_index();
        if from <= first {
            self.log.reset_to(first)?;
            return Ok(());
        }
        let keep = self.entries(first, from - 1, usize::MAX)?;
        self.log.reset_to(first)?;
        self.append(&keep)?;
        Ok(())
    }

    /// Restart the log after the given index (snapshot install).
    pub fn reset_to(&self, next_index: u64) -> Result<()> {
        self.log.reset_to(next_index)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, EntryKind::Command, format!("e{}", index).into_bytes())
    }

    #[test]
    fn empty_log_indices() {
        let dir = TempDir::new().unwrap();
        let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.term_at(0), 0);
    }

    #[test]
    fn append_assigns_matching_indices() {
        let dir = TempDir::new().unwrap();
        let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();

        store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(store.last_index(), 3);

        let got = store.entry(2).unwrap();
        assert_eq!(got.index, 2);
        assert_eq!(got.term, 1);
        assert_eq!(got.data, b"e2");
        assert_eq!(store.term_at(3), 2);
    }

    #[test]
    fn entries_respects_limit() {
        let dir = TempDir::new().unwrap();
        let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();
        store
            .append(&(1..=10).map(|i| entry(i, 1)).collect::<Vec<_>>())
            .unwrap();

        let batch = store.entries(3, 10, 4).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].index, 3);
        assert_eq!(batch[3].index, 6);
    }

    #[test]
    fn truncate_suffix_keeps_prefix() {
        let dir = TempDir::new().unwrap();
        let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();

        store.truncate_suffix(3).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(2).unwrap().data, b"e2");

        // The log continues contiguously with new entries.
        store.append(&[entry(3, 2)]).unwrap();
        assert_eq!(store.entry(3).unwrap().term, 2);
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        {
            let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();
            store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
            store.close().unwrap();
        }
        let store = RaftLogStore::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(1).unwrap().data, b"e1");
    }
}
