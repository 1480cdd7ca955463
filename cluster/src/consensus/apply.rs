//! Delivery of committed entries to the state machine.

use std::time::Instant;

use protobuf::Message as PbMessage;
use raft::prelude::{ConfChange, ConfChangeV2, Entry, EntryType};

use crate::error::{Error, Result};
use crate::fsm::{Command, CommandResult, LogEntry, StateMachine};
use crate::metrics;

/// What a committed entry turned out to be.
#[derive(Debug)]
pub enum Applied {
    /// Already applied; replays after a restart or a snapshot install.
    Skipped,
    /// Empty entry a new leader appends at the start of its term.
    Noop,
    Command(CommandResult),
    ConfChange(ConfChange),
    ConfChangeV2(ConfChangeV2),
}

/// Feeds committed entries to a [`StateMachine`] in strict index order.
///
/// Entries at or below the applied index are skipped; an entry that does not
/// directly follow it is an [`Error::ApplyGap`]. Configuration changes are
/// decoded and handed back, since applying them needs the raft node.
pub struct Applier<S> {
    state_machine: S,
    applied_index: u64,
}

impl<S: StateMachine> Applier<S> {
    pub fn new(state_machine: S, applied_index: u64) -> Self {
        Applier {
            state_machine,
            applied_index,
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn apply(&mut self, entry: &Entry) -> Result<Applied> {
        if entry.index <= self.applied_index {
            return Ok(Applied::Skipped);
        }
        if entry.index != self.applied_index + 1 {
            return Err(Error::ApplyGap {
                expected: self.applied_index + 1,
                got: entry.index,
            });
        }

        let applied = match entry.get_entry_type() {
            EntryType::EntryNormal if entry.get_data().is_empty() => Applied::Noop,
            EntryType::EntryNormal => {
                let command = Command::decode(entry.get_data())?;
                let log_entry = LogEntry {
                    index: entry.index,
                    term: entry.term,
                    command,
                };
                let start = Instant::now();
                let result = self.state_machine.apply(&log_entry)?;
                metrics::APPLY_HISTOGRAM.observe(start.elapsed().as_secs_f64());
                Applied::Command(result)
            }
            EntryType::EntryConfChange => {
                Applied::ConfChange(ConfChange::parse_from_bytes(entry.get_data())?)
            }
            EntryType::EntryConfChangeV2 => {
                Applied::ConfChangeV2(ConfChangeV2::parse_from_bytes(entry.get_data())?)
            }
        };

        self.applied_index = entry.index;
        metrics::APPLIED_COUNTER.inc();
        metrics::APPLIED_INDEX_GAUGE.set(entry.index as i64);
        Ok(applied)
    }

    /// Serializes the state machine as of the applied index.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = self.state_machine.snapshot()?;
        let mut data = Vec::new();
        snapshot.persist(&mut data)?;
        Ok(data)
    }

    /// Replaces the state machine with a snapshot taken at `index`.
    pub fn restore(&mut self, index: u64, mut data: &[u8]) -> Result<()> {
        self.state_machine.restore(&mut data)?;
        self.applied_index = index;
        metrics::APPLIED_INDEX_GAUGE.set(index as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::KvStateMachine;
    use raft::prelude::ConfChangeType;

    fn command_entry(index: u64, key: &str, value: &str) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = 1;
        let command = Command::Set {
            key: key.into(),
            value: value.into(),
        };
        e.data = command.encode().unwrap().into();
        e
    }

    #[test]
    fn test_applies_in_order() {
        let kv = KvStateMachine::new();
        let mut applier = Applier::new(kv.clone(), 0);

        let mut noop = Entry::default();
        noop.index = 1;
        noop.term = 1;
        assert!(matches!(applier.apply(&noop).unwrap(), Applied::Noop));

        for i in 2..=5 {
            let applied = applier.apply(&command_entry(i, "k", &i.to_string())).unwrap();
            assert!(matches!(applied, Applied::Command(_)));
        }
        assert_eq!(applier.applied_index(), 5);
        assert_eq!(kv.get("k").as_deref(), Some("5"));
        assert_eq!(kv.applied_index(), 5);
    }

    #[test]
    fn test_replay_skipped_and_gap_rejected() {
        let kv = KvStateMachine::new();
        let mut applier = Applier::new(kv.clone(), 0);
        applier.apply(&command_entry(1, "a", "1")).unwrap();

        let replay = applier.apply(&command_entry(1, "a", "other")).unwrap();
        assert!(matches!(replay, Applied::Skipped));
        assert_eq!(kv.get("a").as_deref(), Some("1"));

        match applier.apply(&command_entry(3, "a", "3")) {
            Err(Error::ApplyGap { expected, got }) => assert_eq!((expected, got), (2, 3)),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(applier.applied_index(), 1);
    }

    #[test]
    fn test_conf_change_is_decoded() {
        let mut applier = Applier::new(KvStateMachine::new(), 0);
        let mut cc = ConfChange::default();
        cc.node_id = 7;
        cc.set_change_type(ConfChangeType::AddNode);
        let mut e = Entry::default();
        e.index = 1;
        e.term = 1;
        e.set_entry_type(EntryType::EntryConfChange);
        e.data = cc.write_to_bytes().unwrap().into();

        match applier.apply(&e).unwrap() {
            Applied::ConfChange(decoded) => assert_eq!(decoded.node_id, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_restore() {
        let mut source = Applier::new(KvStateMachine::new(), 0);
        source.apply(&command_entry(1, "a", "1")).unwrap();
        source.apply(&command_entry(2, "b", "2")).unwrap();
        let data = source.snapshot().unwrap();

        let kv = KvStateMachine::new();
        let mut target = Applier::new(kv.clone(), 0);
        target.restore(2, &data).unwrap();
        assert_eq!(target.applied_index(), 2);
        assert_eq!(kv.get("b").as_deref(), Some("2"));
        assert!(matches!(
            target.apply(&command_entry(2, "b", "x")).unwrap(),
            Applied::Skipped
        ));
    }
}
