//! Append-only file of length-prefixed records.
//!
//! Layout: a 16 byte header `{first_index, last_index}` followed by records
//! of `u64` little endian length + payload. Record `i` holds the entry with
//! index `first_index + i`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

const HEADER_SIZE: u64 = 16; // 8 bytes for first_index + 8 bytes for last_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    first_index: u64,
    last_index: u64,
    /// File offset of each record, position `i` is index `first_index + i`.
    offsets: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    first_index: u64,
    last_index: u64,
}

impl Segment {
    /// Opens or creates the segment at `path`. A new segment starts at `first_index`.
    pub fn open<P: AsRef<Path>>(path: P, first_index: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path,
            first_index,
            last_index: first_index - 1,
            offsets: Vec::new(),
        };

        // Initialize header if file is empty
        if segment.file.metadata()?.len() < HEADER_SIZE {
            segment.file.set_len(0)?;
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_offsets()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            first_index: self.first_index,
            last_index: self.last_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.first_index = header.first_index;
        self.last_index = header.last_index;
        Ok(())
    }

    fn read_entry_header(&self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        (&self.file).read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Scans the records on disk. The record count, not the header, decides
    /// `last_index`; a torn record at the tail is cut off.
    fn rebuild_offsets(&mut self) -> io::Result<()> {
        self.offsets.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            let end = pos + ENTRY_HEADER_SIZE + entry_size;
            if end > len {
                break;
            }
            self.offsets.push(pos);
            pos = end;
        }

        if pos != len {
            self.file.set_len(pos)?;
        }
        let scanned_last = self.first_index + self.offsets.len() as u64 - 1;
        if scanned_last != self.last_index {
            self.last_index = scanned_last;
            self.write_header()?;
        }
        Ok(())
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let pos = self.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::new();
        for entry in entries {
            self.offsets.push(pos + buf.len() as u64);
            buf.extend_from_slice(&(entry.len() as u64).to_le_bytes());
            buf.extend_from_slice(entry);
        }
        self.file.write_all(&buf)?;

        self.last_index += entries.len() as u64;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_entry(&self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.first_index || index > self.last_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = self.offsets[(index - self.first_index) as usize];
        (&self.file).seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        (&self.file).read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Keeps entries up to and including `index`.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if index >= self.last_index {
            return Ok(());
        }
        if index + 1 < self.first_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let keep = (index + 1 - self.first_index) as usize;
        let cut = self.offsets[keep];
        self.file.set_len(cut)?;
        self.offsets.truncate(keep);
        self.last_index = index;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Drops every record before `index` by rewriting the file.
    pub fn compact_to(&mut self, index: u64) -> io::Result<()> {
        if index <= self.first_index {
            return Ok(());
        }
        if index > self.last_index {
            return self.reset(index);
        }

        let temp_path = self.path.with_extension("compact");
        if temp_path.exists() {
            fs::remove_file(&temp_path)?;
        }
        {
            let mut rewritten = Segment::open(&temp_path, index)?;
            let mut records = Vec::new();
            for i in index..=self.last_index {
                records.push(self.read_entry(i)?);
            }
            rewritten.append(&records)?;
        }
        fs::rename(&temp_path, &self.path)?;

        *self = Segment::open(&self.path, index)?;
        Ok(())
    }

    /// Drops every record; the next append gets `first_index`.
    pub fn reset(&mut self, first_index: u64) -> io::Result<()> {
        self.file.set_len(HEADER_SIZE)?;
        self.offsets.clear();
        self.first_index = first_index;
        self.last_index = first_index - 1;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.last_index < self.first_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    fn records(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|r| r.to_vec()).collect()
    }

    #[test]
    fn test_segment_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let segment = Segment::open(temp_file.path(), 1).unwrap();

        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp_file.path(), 1).unwrap();

        segment
            .append(&records(&[b"first entry", b"second entry"]))
            .unwrap();

        assert_eq!(segment.last_index(), 2);
        assert!(!segment.is_empty());

        let first_entry = segment.read_entry(1).unwrap();
        assert_eq!(first_entry, b"first entry");

        let second_entry = segment.read_entry(2).unwrap();
        assert_eq!(second_entry, b"second entry");
        assert!(segment.read_entry(3).is_err());
    }

    #[test]
    fn test_segment_truncate() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp_file.path(), 1).unwrap();

        segment
            .append(&records(&[b"first entry", b"second entry", b"third entry"]))
            .unwrap();

        segment.truncate_after(2).unwrap();
        assert_eq!(segment.last_index(), 2);
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
        assert!(segment.read_entry(3).is_err());

        segment.append(&records(&[b"replacement"])).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"replacement");
    }

    #[test]
    fn test_segment_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut segment = Segment::open(&path, 1).unwrap();
            segment.append(&records(&[b"a", b"bb", b"ccc"])).unwrap();
        }

        let segment = Segment::open(&path, 1).unwrap();
        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), 3);
        assert_eq!(segment.read_entry(2).unwrap(), b"bb");
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut segment = Segment::open(&path, 1).unwrap();
            segment.append(&records(&[b"a", b"bb"])).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u64.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let mut segment = Segment::open(&path, 1).unwrap();
        assert_eq!(segment.last_index(), 2);
        segment.append(&records(&[b"c"])).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"c");
    }

    #[test]
    fn test_compact_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.log");
        let mut segment = Segment::open(&path, 1).unwrap();
        segment
            .append(&records(&[b"1", b"2", b"3", b"4"]))
            .unwrap();

        segment.compact_to(3).unwrap();
        assert_eq!(segment.first_index(), 3);
        assert_eq!(segment.last_index(), 4);
        assert!(segment.read_entry(2).is_err());
        assert_eq!(segment.read_entry(3).unwrap(), b"3");

        let reopened = Segment::open(&path, 1).unwrap();
        assert_eq!(reopened.first_index(), 3);
        assert_eq!(reopened.read_entry(4).unwrap(), b"4");

        segment.reset(10).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.last_index(), 9);
        segment.append(&records(&[b"10"])).unwrap();
        assert_eq!(segment.read_entry(10).unwrap(), b"10");
    }
}
