use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use super::StableStore;
use crate::error::Result;

/// Everything besides log entries that raft needs after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    /// Index and term of the last entry folded into a snapshot and removed
    /// from the log.
    pub compacted_index: u64,
    pub compacted_term: u64,
    /// Raft id to advertised address.
    pub peers: BTreeMap<u64, String>,
}

/// Stable state persisted as one bincode file, replaced atomically on save.
#[derive(Debug)]
pub struct FileStableStore {
    path: PathBuf,
    state: StableState,
}

impl FileStableStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize(&bytes)?
        } else {
            StableState::default()
        };
        Ok(FileStableStore { path, state })
    }
}

impl StableStore for FileStableStore {
    fn load(&self) -> Result<StableState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &StableState) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let bytes = bincode::serialize(state)?;

        // Write to temporary file first
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        // Rename temp file to actual state file
        fs::rename(&temp_path, &self.path)?;
        self.state = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.state");

        let mut state = StableState {
            term: 3,
            vote: 7,
            commit: 12,
            voters: vec![7, 9],
            ..Default::default()
        };
        state.peers.insert(7, "127.0.0.1:5000".into());
        {
            let mut store = FileStableStore::open(&path).unwrap();
            assert_eq!(store.load().unwrap(), StableState::default());
            store.save(&state).unwrap();
        }

        let store = FileStableStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap(), state);
        assert!(!path.with_extension("tmp").exists());
    }
}
