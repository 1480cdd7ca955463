//! First start of a brand new cluster.
//!
//! The initial membership is written as ordinary configuration change
//! entries at term 1 and marked committed. Every server therefore learns the
//! founding members (and their addresses) by replaying the log, the same way
//! it learns later membership changes.

use protobuf::Message as PbMessage;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState};

use super::Member;
use crate::error::{Error, Result};
use crate::store::RaftStorage;

const BOOTSTRAP_TERM: u64 = 1;

pub fn has_existing_state(storage: &RaftStorage) -> Result<bool> {
    storage.has_existing_state()
}

/// Writes the initial configuration into empty storage.
///
/// Returns [`Error::ExistingState`] without touching anything if the storage
/// already holds raft state.
pub fn bootstrap_cluster(storage: &mut RaftStorage, members: &[Member]) -> Result<()> {
    if members.is_empty() {
        return Err(Error::Config("bootstrap needs at least one member".into()));
    }
    if has_existing_state(storage)? {
        return Err(Error::ExistingState);
    }

    let mut entries = Vec::with_capacity(members.len());
    for (i, member) in members.iter().enumerate() {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = member.raft_id();
        cc.context = member.encode()?.into();

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.index = i as u64 + 1;
        entry.term = BOOTSTRAP_TERM;
        entry.data = cc.write_to_bytes()?.into();
        entries.push(entry);
    }

    storage.append(&entries)?;
    for member in members {
        storage.set_peer(member.raft_id(), &member.address)?;
    }
    let voters: Vec<u64> = members.iter().map(Member::raft_id).collect();
    storage.set_conf_state(&ConfState::from((voters, Vec::<u64>::new())))?;

    let mut hs = HardState::default();
    hs.term = BOOTSTRAP_TERM;
    hs.commit = entries.len() as u64;
    storage.set_hardstate(&hs)
}
