use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use protobuf::Message as PbMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use serde_derive::{Deserialize, Serialize};

use super::{
    LogStore, MemLogStore, MemSnapshotStore, MemStableStore, SnapshotMeta, SnapshotStore,
    StableState, StableStore,
};
use crate::error::{Error, Result};

/// What travels inside a raft snapshot: the address book as of the snapshot
/// and the serialized state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub peers: BTreeMap<u64, String>,
    pub state: Vec<u8>,
}

impl SnapshotPayload {
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// The log, stable and snapshot stores of one server, seen by raft-rs as a
/// single `raft::Storage`.
///
/// Reads go through the trait; the node loop writes through the inherent
/// methods while it handles a `Ready`.
pub struct RaftStorage {
    log: Box<dyn LogStore>,
    stable: Box<dyn StableStore>,
    snapshots: Box<dyn SnapshotStore>,
    state: StableState,
    /// Set when raft asked for a snapshot we cannot hand out: none is recent
    /// enough or the latest predates the current membership.
    snapshot_requested: AtomicBool,
}

fn unavailable() -> raft::Error {
    raft::Error::Store(StorageError::Unavailable)
}

fn same_members(a: &[u64], b: &[u64]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

impl RaftStorage {
    pub fn new(
        log: Box<dyn LogStore>,
        stable: Box<dyn StableStore>,
        snapshots: Box<dyn SnapshotStore>,
    ) -> Result<Self> {
        let state = stable.load()?;
        Ok(RaftStorage {
            log,
            stable,
            snapshots,
            state,
            snapshot_requested: AtomicBool::new(false),
        })
    }

    /// Storage that lives and dies with the process.
    pub fn in_memory() -> Result<Self> {
        RaftStorage::new(
            Box::new(MemLogStore::new()),
            Box::new(MemStableStore::new()),
            Box::new(MemSnapshotStore::new()),
        )
    }

    /// True if anything was ever persisted: log entries, a term or a
    /// snapshot.
    pub fn has_existing_state(&self) -> Result<bool> {
        Ok(self.log.last_index() > 0
            || self.state.term > 0
            || !self.snapshots.list()?.is_empty())
    }

    pub fn stable_state(&self) -> &StableState {
        &self.state
    }

    pub fn conf_state(&self) -> ConfState {
        ConfState::from((self.state.voters.clone(), self.state.learners.clone()))
    }

    pub fn peers(&self) -> &BTreeMap<u64, String> {
        &self.state.peers
    }

    fn save(&mut self) -> Result<()> {
        self.stable.save(&self.state)
    }

    /// Persists entries coming out of a `Ready`. Entries that conflict with
    /// the stored tail replace it.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let compacted = self.state.compacted_index;
        let entries: Vec<Entry> = entries
            .iter()
            .filter(|e| e.index > compacted)
            .cloned()
            .collect();
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let first_new = first.index;
        let last = self.log.last_index();
        if first_new > last + 1 {
            if first_new != compacted + 1 {
                return Err(unavailable().into());
            }
            self.log.reset(first_new)?;
        } else if first_new <= last {
            self.log.truncate_after(first_new - 1)?;
        }
        self.log.append(&entries)
    }

    pub fn set_hardstate(&mut self, hs: &HardState) -> Result<()> {
        self.state.term = hs.term;
        self.state.vote = hs.vote;
        self.state.commit = hs.commit;
        self.save()
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        self.state.commit = commit;
        self.save()
    }

    pub fn set_conf_state(&mut self, cs: &ConfState) -> Result<()> {
        self.state.voters = cs.voters.clone();
        self.state.learners = cs.learners.clone();
        self.save()
    }

    pub fn set_peer(&mut self, id: u64, address: &str) -> Result<()> {
        if self.state.peers.get(&id).map(String::as_str) == Some(address) {
            return Ok(());
        }
        self.state.peers.insert(id, address.to_string());
        self.save()
    }

    pub fn remove_peer(&mut self, id: u64) -> Result<()> {
        if self.state.peers.remove(&id).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Installs a snapshot received from the leader and returns what it
    /// carries. The snapshot store is written before the stable state, and
    /// the log is only dropped once both are durable.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<SnapshotPayload> {
        let metadata = snapshot.get_metadata();
        let payload = SnapshotPayload::decode(snapshot.get_data())?;
        let cs = metadata.get_conf_state();

        let meta = SnapshotMeta::new(
            metadata.index,
            metadata.term,
            cs.voters.clone(),
            cs.learners.clone(),
            payload.peers.clone(),
        );
        self.snapshots.create(&meta, snapshot.get_data())?;

        self.state.compacted_index = metadata.index;
        self.state.compacted_term = metadata.term;
        self.state.commit = self.state.commit.max(metadata.index);
        self.state.term = self.state.term.max(metadata.term);
        self.state.voters = cs.voters.clone();
        self.state.learners = cs.learners.clone();
        self.state.peers = payload.peers.clone();
        self.save()?;

        self.log.reset(metadata.index + 1)?;
        self.snapshot_requested.store(false, Ordering::SeqCst);
        Ok(payload)
    }

    /// Stores a snapshot of the state machine as of `index`, which must
    /// already be applied, along with the current membership.
    pub fn create_snapshot(&mut self, index: u64, state: Vec<u8>) -> Result<SnapshotMeta> {
        let term = self.term(index).map_err(Error::from)?;
        let payload = SnapshotPayload {
            peers: self.state.peers.clone(),
            state,
        };
        let mut meta = SnapshotMeta::new(
            index,
            term,
            self.state.voters.clone(),
            self.state.learners.clone(),
            self.state.peers.clone(),
        );
        let data = payload.encode()?;
        self.snapshots.create(&meta, &data)?;
        meta.size = data.len() as u64;
        self.snapshot_requested.store(false, Ordering::SeqCst);
        Ok(meta)
    }

    /// Drops log entries up to and including `index`. The stable state moves
    /// first so a crash in between leaves extra entries, never a hole.
    pub fn compact(&mut self, index: u64) -> Result<()> {
        if index <= self.state.compacted_index {
            return Ok(());
        }
        if index > self.log.last_index() {
            return Err(unavailable().into());
        }
        let term = self.term(index).map_err(Error::from)?;
        self.state.compacted_index = index;
        self.state.compacted_term = term;
        self.save()?;
        self.log.compact_to(index + 1)
    }

    pub fn latest_snapshot(&self) -> Result<Option<(SnapshotMeta, SnapshotPayload)>> {
        let Some(meta) = self.snapshots.list()?.into_iter().next() else {
            return Ok(None);
        };
        let (meta, data) = self.snapshots.open(&meta.id)?;
        Ok(Some((meta, SnapshotPayload::decode(&data)?)))
    }

    pub fn snapshot_requested(&self) -> bool {
        self.snapshot_requested.load(Ordering::SeqCst)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let mut hs = HardState::default();
        hs.term = self.state.term;
        hs.vote = self.state.vote;
        hs.commit = self.state.commit;
        Ok(RaftState::new(hs, self.conf_state()))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        if low <= self.state.compacted_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index()? + 1 {
            return Err(unavailable());
        }

        let max_size = max_size.into();
        let mut entries = Vec::with_capacity((high - low) as usize);
        let mut size = 0u64;
        for index in low..high {
            let entry = self
                .log
                .entry(index)
                .map_err(Error::into_raft)?
                .ok_or_else(unavailable)?;
            size += u64::from(entry.compute_size());
            // Always hand back at least one entry.
            if !entries.is_empty() && max_size.map_or(false, |max| size > max) {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.state.compacted_index {
            return Ok(self.state.compacted_term);
        }
        if idx < self.state.compacted_index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        match self.log.entry(idx).map_err(Error::into_raft)? {
            Some(entry) => Ok(entry.term),
            None => Err(unavailable()),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.state.compacted_index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.log.last_index().max(self.state.compacted_index))
    }

    /// Hands out the latest snapshot only if it is recent enough and was
    /// taken under the current membership, which includes `to`. Otherwise
    /// the node is asked for a fresh one.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let latest = self.snapshots.list().map_err(Error::into_raft)?;
        let usable = |m: &SnapshotMeta| {
            m.index >= request_index
                && same_members(&m.voters, &self.state.voters)
                && same_members(&m.learners, &self.state.learners)
                && (m.voters.contains(&to) || m.learners.contains(&to))
        };
        let Some(meta) = latest.into_iter().next().filter(usable) else {
            self.snapshot_requested.store(true, Ordering::SeqCst);
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        };

        let (meta, data) = self.snapshots.open(&meta.id).map_err(Error::into_raft)?;
        let mut snapshot = Snapshot::default();
        snapshot.set_data(data.into());
        let metadata = snapshot.mut_metadata();
        metadata.index = meta.index;
        metadata.term = meta.term;
        metadata.set_conf_state(ConfState::from((meta.voters, meta.learners)));
        Ok(snapshot)
    }
}
