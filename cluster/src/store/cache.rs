use raft::prelude::Entry;

use super::LogStore;
use crate::error::{Error, Result};

/// Keeps the most recently appended entries in memory in front of another
/// [`LogStore`]. Followers and the leader's replication path mostly read what
/// was just written, so those reads never reach the disk.
///
/// Any removal from the underlying store drops the whole cache.
pub struct LogCache<L> {
    store: L,
    cache: Vec<Option<Entry>>,
}

impl<L: LogStore> LogCache<L> {
    pub fn new(capacity: usize, store: L) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("log cache capacity must be positive".into()));
        }
        Ok(LogCache {
            store,
            cache: vec![None; capacity],
        })
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.cache.len() as u64) as usize
    }

    fn cached(&self, index: u64) -> Option<&Entry> {
        self.cache[self.slot(index)]
            .as_ref()
            .filter(|e| e.index == index)
    }

    fn clear(&mut self) {
        self.cache.iter_mut().for_each(|slot| *slot = None);
    }
}

impl<L: LogStore> LogStore for LogCache<L> {
    fn first_index(&self) -> u64 {
        self.store.first_index()
    }

    fn last_index(&self) -> u64 {
        self.store.last_index()
    }

    fn entry(&self, index: u64) -> Result<Option<Entry>> {
        if let Some(entry) = self.cached(index) {
            return Ok(Some(entry.clone()));
        }
        self.store.entry(index)
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        self.store.append(entries)?;
        for entry in entries {
            let slot = self.slot(entry.index);
            self.cache[slot] = Some(entry.clone());
        }
        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<()> {
        self.clear();
        self.store.truncate_after(index)
    }

    fn compact_to(&mut self, index: u64) -> Result<()> {
        self.clear();
        self.store.compact_to(index)
    }

    fn reset(&mut self, next_index: u64) -> Result<()> {
        self.clear();
        self.store.reset(next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemLogStore;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    #[test]
    fn test_serves_recent_entries() {
        let mut log = LogCache::new(4, MemLogStore::new()).unwrap();
        log.append(&(1..=6).map(|i| entry(i, 1)).collect::<Vec<_>>())
            .unwrap();

        assert!(log.cached(2).is_none());
        assert_eq!(log.cached(6).unwrap().index, 6);
        // Evicted entries still come from the backing store.
        assert_eq!(log.entry(1).unwrap().unwrap().index, 1);
    }

    #[test]
    fn test_truncate_invalidates() {
        let mut log = LogCache::new(8, MemLogStore::new()).unwrap();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        log.truncate_after(1).unwrap();
        assert!(log.entry(2).unwrap().is_none());

        log.append(&[entry(2, 2)]).unwrap();
        assert_eq!(log.entry(2).unwrap().unwrap().term, 2);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(LogCache::new(0, MemLogStore::new()).is_err());
    }
}
