use std::collections::VecDeque;

use raft::prelude::Entry;

use super::{LogStore, StableState, StableStore};
use crate::error::Result;

/// Raft log held in memory, for dev mode.
#[derive(Debug)]
pub struct MemLogStore {
    first_index: u64,
    entries: VecDeque<Entry>,
}

impl Default for MemLogStore {
    fn default() -> Self {
        MemLogStore {
            first_index: 1,
            entries: VecDeque::new(),
        }
    }
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore::default()
    }
}

impl LogStore for MemLogStore {
    fn first_index(&self) -> u64 {
        self.first_index
    }

    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn entry(&self, index: u64) -> Result<Option<Entry>> {
        if index < self.first_index {
            return Ok(None);
        }
        Ok(self.entries.get((index - self.first_index) as usize).cloned())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if let Some(first) = entries.first() {
            if first.index != self.last_index() + 1 {
                return Err(raft::Error::Store(raft::StorageError::Unavailable).into());
            }
        }
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<()> {
        let keep = index.saturating_sub(self.first_index - 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn compact_to(&mut self, index: u64) -> Result<()> {
        if index > self.last_index() {
            return self.reset(index);
        }
        while self.first_index < index {
            self.entries.pop_front();
            self.first_index += 1;
        }
        Ok(())
    }

    fn reset(&mut self, next_index: u64) -> Result<()> {
        self.entries.clear();
        self.first_index = next_index;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemStableStore {
    state: StableState,
}

impl MemStableStore {
    pub fn new() -> Self {
        MemStableStore::default()
    }
}

impl StableStore for MemStableStore {
    fn load(&self) -> Result<StableState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &StableState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }
}
