//! Snapshot store.
//!
//! A snapshot is the FSM's full state at a commit point: the data file is
//! the raw log reader stream (length-prefixed record frames) and the
//! sidecar JSON holds the last included index/term plus the membership at
//! that point. Only the most recent snapshot is retained.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::ServerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Term of the last entry covered by the snapshot.
    pub term: u64,
    /// Index of the last entry covered by the snapshot.
    pub index: u64,
    /// Cluster membership as of the snapshot.
    pub members: Vec<ServerConfig>,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Write a snapshot from `reader`, then drop any older snapshots.
    pub fn create(&self, meta: &SnapshotMeta, mut reader: impl Read) -> Result<()> {
        let data_path = self.data_path(meta.index);
        let meta_path = self.meta_path(meta.index);

        let mut data = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&data_path)?;
        io::copy(&mut reader, &mut data)?;
        data.sync_all()?;

        let mut meta_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&meta_path)?;
        meta_file.write_all(&serde_json::to_vec(meta)?)?;
        meta_file.sync_all()?;

        debug!(index = meta.index, term = meta.term, "snapshot written");
        self.retain(meta.index)?;
        Ok(())
    }

    /// Metadata and data reader for the most recent snapshot, if any.
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, File)>> {
        let Some(index) = self.latest_index()? else {
            return Ok(None);
        };
        let meta: SnapshotMeta = serde_json::from_slice(&fs::read(self.meta_path(index))?)?;
        let data = File::open(self.data_path(index))?;
        Ok(Some((meta, data)))
    }

    /// Read the most recent snapshot fully into memory, for shipping to a
    /// lagging follower.
    pub fn latest_bytes(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        match self.latest()? {
            Some((meta, mut file)) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    fn latest_index(&self) -> Result<Option<u64>> {
        let mut latest = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(index) = name
                .strip_prefix("snapshot-")
                .and_then(|rest| rest.strip_suffix(".meta.json"))
                .and_then(|i| i.parse::<u64>().ok())
            else {
                continue;
            };
            if latest.map_or(true, |cur| index > cur) {
                latest = Some(index);
            }
        }
        Ok(latest)
    }

    fn retain(&self, keep_index: u64) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(index) = name
                .strip_prefix("snapshot-")
                .and_then(|rest| rest.split('.').next())
                .and_then(|i| i.parse::<u64>().ok())
            else {
                continue;
            };
            if index != keep_index {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to drop old snapshot file");
                }
            }
        }
        Ok(())
    }

    fn data_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{}.bin", index))
    }

    fn meta_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{}.meta.json", index))
    }
}
