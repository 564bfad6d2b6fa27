//! Stable store: the term and vote that must survive restarts.
//!
//! Persisted as a small JSON file under `raft/stable/`, rewritten and
//! fsynced on every change. Losing this file would let a node vote twice
//! in one term.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

pub struct StableStore {
    path: PathBuf,
}

impl StableStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("state.json"),
        })
    }

    /// Load the persisted state; a missing file is a fresh node.
    pub fn load(&self) -> Result<PersistedState> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist and fsync the state.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&serde_json::to_vec(state)?)?;
        file.sync_all()?;
        Ok(())
    }

    /// True when nothing has ever been persisted.
    pub fn is_fresh(&self) -> bool {
        !self.path.exists()
    }
}
