//! Raft log, stable and snapshot stores.
//!
//! Dev mode uses the in-memory stores; otherwise the log and stable state
//! live under the data directory (`raft.log`, `raft.state`) with the log
//! fronted by a [`LogCache`], and snapshots are kept by a
//! [`FileSnapshotStore`]. [`RaftStorage`] combines the three and is what the
//! raft node reads through `raft::Storage`.

use std::path::Path;

use raft::prelude::Entry;

mod cache;
mod log_store;
mod memory;
mod segment;
mod snapshot;
mod stable;
mod storage;

pub use self::cache::LogCache;
pub use self::log_store::FileLogStore;
pub use self::memory::{MemLogStore, MemStableStore};
pub use self::snapshot::{FileSnapshotStore, MemSnapshotStore, SnapshotMeta};
pub use self::stable::{FileStableStore, StableState};
pub use self::storage::{RaftStorage, SnapshotPayload};

use crate::error::Result;

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft.state";

/// Ordered raft entries `[first_index, last_index]`.
///
/// An empty store has `last_index == first_index - 1`.
pub trait LogStore: Send {
    fn first_index(&self) -> u64;
    fn last_index(&self) -> u64;
    fn entry(&self, index: u64) -> Result<Option<Entry>>;
    /// Appends entries that must start at `last_index + 1`.
    fn append(&mut self, entries: &[Entry]) -> Result<()>;
    /// Drops every entry after `index`.
    fn truncate_after(&mut self, index: u64) -> Result<()>;
    /// Drops every entry before `index`.
    fn compact_to(&mut self, index: u64) -> Result<()>;
    /// Drops everything; the next append starts at `next_index`.
    fn reset(&mut self, next_index: u64) -> Result<()>;
}

/// Raft metadata that must survive restarts.
pub trait StableStore: Send {
    fn load(&self) -> Result<StableState>;
    fn save(&mut self, state: &StableState) -> Result<()>;
}

pub trait SnapshotStore: Send {
    fn create(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()>;
    /// Retained snapshots, newest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>>;
    fn open(&self, id: &str) -> Result<(SnapshotMeta, Vec<u8>)>;
}

/// Opens the durable log and stable store kept under `data_path`.
pub fn open_durable(
    data_path: &Path,
    cache_size: usize,
) -> Result<(LogCache<FileLogStore>, FileStableStore)> {
    let log = FileLogStore::open(data_path.join(LOG_FILE))?;
    let log = LogCache::new(cache_size, log)?;
    let stable = FileStableStore::open(data_path.join(STATE_FILE))?;
    Ok((log, stable))
}
