//! Snapshot stores.
//!
//! On disk every snapshot is a directory `<term>-<index>-<millis>` holding
//! `meta.json` and `state.bin`. It is written under a `.tmp` name and renamed
//! into place once complete, so a crash never leaves a half written snapshot
//! visible. Only the newest `retain` snapshots are kept.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};
use slog::{info, warn, Logger};

use super::SnapshotStore;
use crate::error::{Error, Result};

const SNAPSHOT_DIR: &str = "snapshots";
const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub peers: BTreeMap<u64, String>,
    pub size: u64,
}

impl SnapshotMeta {
    pub fn new(
        index: u64,
        term: u64,
        voters: Vec<u64>,
        learners: Vec<u64>,
        peers: BTreeMap<u64, String>,
    ) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        SnapshotMeta {
            id: format!("{}-{}-{}", term, index, millis),
            index,
            term,
            voters,
            learners,
            peers,
            size: 0,
        }
    }
}

fn newest_first(metas: &mut [SnapshotMeta]) {
    metas.sort_by(|a, b| (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id)));
}

pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
    logger: Logger,
}

impl FileSnapshotStore {
    pub fn open<P: AsRef<Path>>(data_path: P, retain: usize, logger: Logger) -> Result<Self> {
        if retain == 0 {
            return Err(Error::Config("must retain at least one snapshot".into()));
        }
        let dir = data_path.as_ref().join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir).map_err(|source| Error::Path {
            path: dir.clone(),
            source,
        })?;

        // Leftovers of snapshots that were being written when we crashed.
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(logger, "removing incomplete snapshot"; "path" => path.display().to_string());
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(FileSnapshotStore {
            dir,
            retain,
            logger,
        })
    }

    fn read_meta(path: &Path) -> Result<SnapshotMeta> {
        let bytes = fs::read(path.join(META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn reap(&self) -> Result<()> {
        let metas = self.list()?;
        for meta in metas.iter().skip(self.retain) {
            info!(self.logger, "reaping snapshot"; "id" => &meta.id);
            fs::remove_dir_all(self.dir.join(&meta.id))?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        info!(self.logger, "creating snapshot";
            "id" => &meta.id, "index" => meta.index, "term" => meta.term, "size" => data.len());

        let final_dir = self.dir.join(&meta.id);
        let temp_dir = self.dir.join(format!("{}{}", meta.id, TMP_SUFFIX));
        fs::create_dir_all(&temp_dir)?;

        let mut meta = meta.clone();
        meta.size = data.len() as u64;
        {
            let mut state = File::create(temp_dir.join(STATE_FILE))?;
            state.write_all(data)?;
            state.sync_all()?;
            let mut meta_file = File::create(temp_dir.join(META_FILE))?;
            meta_file.write_all(&serde_json::to_vec_pretty(&meta)?)?;
            meta_file.sync_all()?;
        }
        fs::rename(&temp_dir, &final_dir)?;

        self.reap()
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || path.to_string_lossy().ends_with(TMP_SUFFIX) {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    warn!(self.logger, "skipping unreadable snapshot";
                        "path" => path.display().to_string(), "error" => e.to_string());
                }
            }
        }
        newest_first(&mut metas);
        Ok(metas)
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Vec<u8>)> {
        let path = self.dir.join(id);
        let meta = Self::read_meta(&path)?;
        let data = fs::read(path.join(STATE_FILE))?;
        if data.len() as u64 != meta.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "snapshot {} is {} bytes, expected {}",
                    id,
                    data.len(),
                    meta.size
                ),
            )
            .into());
        }
        info!(self.logger, "opened snapshot"; "id" => id, "index" => meta.index);
        Ok((meta, data))
    }
}

/// Keeps only the latest snapshot, in memory.
#[derive(Debug, Default)]
pub struct MemSnapshotStore {
    latest: Option<(SnapshotMeta, Vec<u8>)>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        MemSnapshotStore::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn create(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        let mut meta = meta.clone();
        meta.size = data.len() as u64;
        self.latest = Some((meta, data.to_vec()));
        Ok(())
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        Ok(self.latest.iter().map(|(meta, _)| meta.clone()).collect())
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Vec<u8>)> {
        match &self.latest {
            Some((meta, data)) if meta.id == id => Ok((meta.clone(), data.clone())),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("snapshot {} not found", id),
            )
            .into()),
        }
    }
}
