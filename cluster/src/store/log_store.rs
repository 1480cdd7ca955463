use std::path::Path;

use protobuf::Message as PbMessage;
use raft::prelude::Entry;

use super::segment::Segment;
use super::LogStore;
use crate::error::{Error, Result};

/// Durable raft log kept in a single [`Segment`] file.
#[derive(Debug)]
pub struct FileLogStore {
    segment: Segment,
}

impl FileLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let segment = Segment::open(path, 1)?;
        Ok(FileLogStore { segment })
    }
}

impl LogStore for FileLogStore {
    fn first_index(&self) -> u64 {
        self.segment.first_index()
    }

    fn last_index(&self) -> u64 {
        self.segment.last_index()
    }

    fn entry(&self, index: u64) -> Result<Option<Entry>> {
        if index < self.segment.first_index() || index > self.segment.last_index() {
            return Ok(None);
        }
        let bytes = self.segment.read_entry(index)?;
        let entry = Entry::parse_from_bytes(&bytes)?;
        Ok(Some(entry))
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.segment.last_index() + 1 {
            return Err(raft::Error::Store(raft::StorageError::Unavailable).into());
        }
        let records = entries
            .iter()
            .map(|e| e.write_to_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.segment.append(&records)?;
        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<()> {
        self.segment.truncate_after(index).map_err(Error::from)
    }

    fn compact_to(&mut self, index: u64) -> Result<()> {
        self.segment.compact_to(index).map_err(Error::from)
    }

    fn reset(&mut self, next_index: u64) -> Result<()> {
        self.segment.reset(next_index).map_err(Error::from)
    }
}
