//! Key-value state machine.
//!
//! The replicated state is a sorted map so that snapshots serialize
//! identically on every node.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_derive::{Deserialize, Serialize};

use super::{Command, CommandResult, LogEntry, StateMachine, StateSnapshot};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvState {
    /// Index of the last entry folded into `data`.
    pub applied_index: u64,
    pub data: BTreeMap<String, String>,
}

/// State machine over a sorted string map.
///
/// Clones share the same state, so a handle kept by the caller can read
/// what the raft node has applied.
#[derive(Debug, Clone, Default)]
pub struct KvStateMachine {
    state: Arc<RwLock<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> KvStateMachine {
        KvStateMachine::default()
    }

    /// Local read; returns whatever this node has applied so far.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read().data.get(key).cloned()
    }

    pub fn applied_index(&self) -> u64 {
        self.read().applied_index
    }

    pub fn state(&self) -> KvState {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, KvState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, KvState>> {
        self.state
            .write()
            .map_err(|_| Error::StateMachine("state lock poisoned".into()))
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> Result<CommandResult> {
        let mut state = self.write()?;
        if entry.index <= state.applied_index {
            return Err(Error::StateMachine(format!(
                "entry {} already applied (at {})",
                entry.index, state.applied_index
            )));
        }
        state.applied_index = entry.index;

        let result = match &entry.command {
            Command::Set { key, value } => {
                CommandResult::Previous(state.data.insert(key.clone(), value.clone()))
            }
            Command::Delete { key } => CommandResult::Previous(state.data.remove(key)),
            Command::CompareAndSwap {
                key,
                expected,
                value,
            } => {
                let swapped = state.data.get(key) == expected.as_ref();
                if swapped {
                    state.data.insert(key.clone(), value.clone());
                }
                CommandResult::Swapped {
                    swapped,
                    current: state.data.get(key).cloned(),
                }
            }
        };
        Ok(result)
    }

    fn snapshot(&self) -> Result<Box<dyn StateSnapshot>> {
        Ok(Box::new(KvSnapshot(self.read().clone())))
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<()> {
        let restored: KvState = bincode::deserialize_from(reader)?;
        *self.write()? = restored;
        Ok(())
    }
}

struct KvSnapshot(KvState);

impl StateSnapshot for KvSnapshot {
    fn persist(&self, sink: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(sink, &self.0)?;
        Ok(())
    }
}
