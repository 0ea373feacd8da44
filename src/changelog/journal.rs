//! Changelog journal file
//!
//! Durable append-only backing store for one replica changelog. Every index
//! mutation (put, delete) is framed and appended; opening a journal replays
//! it to rebuild the in-memory index. Heavily trimmed journals are compacted
//! by rewriting the live records into a fresh file.
//!
//! Frame format: [length: u32][compressed: u8][data: bytes][checksum: u32]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::csn::Csn;
use crate::error::{Error, Result};

use super::record::JournalOp;

/// Magic bytes at the start of each journal file
const JOURNAL_MAGIC: &[u8; 8] = b"DIRREPLC";

/// Journal file version
const JOURNAL_VERSION: u32 = 1;

/// Header size in bytes (magic + version + reserved)
const HEADER_SIZE: usize = 16;

/// A single replica changelog journal file
pub struct Journal {
    /// File path
    path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Whether compression is enabled
    compression: bool,
    /// Operations appended since the journal was created or compacted
    op_count: u64,
    /// Fault injection for failure-path tests
    #[cfg(test)]
    fail_next_append: bool,
}

impl Journal {
    /// Create a fresh journal file, truncating any existing one
    pub fn create(path: PathBuf, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(JOURNAL_MAGIC);
        header[8..12].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        file.write_all(&header)?;

        Ok(Self {
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            compression,
            op_count: 0,
            #[cfg(test)]
            fail_next_append: false,
        })
    }

    /// Open an existing journal, or create it if absent
    pub fn open(path: PathBuf, compression: bool) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, compression);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[0..8] != JOURNAL_MAGIC {
            return Err(Error::Changelog(format!(
                "Invalid journal magic in {}",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().map_err(|_| {
            Error::Changelog("Journal header too short".into())
        })?);
        if version != JOURNAL_VERSION {
            return Err(Error::Changelog(format!(
                "Unsupported journal version: {}",
                version
            )));
        }

        let write_pos = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            file,
            write_pos,
            compression,
            op_count: 0,
            #[cfg(test)]
            fail_next_append: false,
        })
    }

    /// Append one operation frame
    pub fn append(&mut self, op: &JournalOp) -> Result<()> {
        #[cfg(test)]
        if self.fail_next_append {
            self.fail_next_append = false;
            return Err(Error::Io(std::io::Error::other("injected append fault")));
        }

        let serialized = bincode::serialize(op)?;

        let data = if self.compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        let frame_len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&frame_len.to_le_bytes())?;
        self.file.write_all(&[self.compression as u8])?;
        self.file.write_all(&data)?;
        self.file.write_all(&checksum.to_le_bytes())?;

        self.write_pos += 4 + 1 + data.len() as u64 + 4;
        self.op_count += 1;
        Ok(())
    }

    /// Replay every operation frame, in append order
    pub fn replay(&mut self) -> Result<Vec<JournalOp>> {
        let mut ops = Vec::new();
        let mut pos = HEADER_SIZE as u64;

        while pos < self.write_pos {
            let (op, next_pos) = self.read_frame(pos)?;
            ops.push(op);
            pos = next_pos;
        }

        self.op_count = ops.len() as u64;
        Ok(ops)
    }

    /// Read one frame at a position, returning the op and the next position
    fn read_frame(&mut self, pos: u64) -> Result<(JournalOp, u64)> {
        self.file.seek(SeekFrom::Start(pos))?;

        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let frame_len = u32::from_le_bytes(len_bytes) as usize;

        let mut compressed_flag = [0u8; 1];
        self.file.read_exact(&mut compressed_flag)?;
        let is_compressed = compressed_flag[0] != 0;

        let mut data = vec![0u8; frame_len];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        if crc32fast::hash(&data) != stored_checksum {
            return Err(Error::Corrupted {
                csn: Csn::default(),
                reason: format!("Journal checksum mismatch at offset {}", pos),
            });
        }

        let serialized = if is_compressed {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| Error::Changelog(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        let op: JournalOp = bincode::deserialize(&serialized)?;
        Ok((op, pos + 4 + 1 + frame_len as u64 + 4))
    }

    /// Rewrite the journal from a set of live operations, dropping dead
    /// frames. The new file is written beside the old one and swapped in.
    pub fn compact(&mut self, live_ops: impl Iterator<Item = JournalOp>) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut fresh = Journal::create(tmp_path.clone(), self.compression)?;
        for op in live_ops {
            fresh.append(&op)?;
        }
        fresh.sync()?;

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = fresh.file;
        self.write_pos = fresh.write_pos;
        self.op_count = fresh.op_count;
        Ok(())
    }

    /// Truncate the journal back to an empty header
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(JOURNAL_MAGIC);
        header[8..12].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        self.file.write_all(&header)?;

        self.write_pos = HEADER_SIZE as u64;
        self.op_count = 0;
        self.sync()
    }

    /// Sync journal contents to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Operations appended since creation or the last compaction
    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    /// Make the next append fail with an I/O error
    #[cfg(test)]
    pub(crate) fn inject_append_error(&mut self) {
        self.fail_next_append = true;
    }

    /// Journal size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.write_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::record::{ChangeRecord, LogValue};
    use tempfile::tempdir;

    fn put(time: u64, seq: u32, id: u32) -> JournalOp {
        let csn = Csn::new(time, seq, id);
        JournalOp::Put {
            key: csn,
            value: LogValue::Change(ChangeRecord::new(csn, vec![seq as u8; 16])),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica_1.chl");

        let mut journal = Journal::create(path.clone(), true).unwrap();
        for seq in 1..=10 {
            journal.append(&put(100, seq, 1)).unwrap();
        }
        journal.sync().unwrap();
        drop(journal);

        let mut reopened = Journal::open(path, true).unwrap();
        let ops = reopened.replay().unwrap();
        assert_eq!(ops.len(), 10);
        match &ops[4] {
            JournalOp::Put { key, .. } => assert_eq!(key.seq, 5),
            _ => panic!("Expected a put"),
        }
    }

    #[test]
    fn test_replay_mixed_ops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica_2.chl");

        let mut journal = Journal::create(path, false).unwrap();
        journal.append(&put(100, 1, 2)).unwrap();
        journal
            .append(&JournalOp::Delete {
                key: Csn::new(100, 1, 2),
            })
            .unwrap();

        let ops = journal.replay().unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[1], JournalOp::Delete { .. }));
    }

    #[test]
    fn test_clear_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica_3.chl");

        let mut journal = Journal::create(path, true).unwrap();
        for seq in 1..=5 {
            journal.append(&put(50, seq, 3)).unwrap();
        }
        journal.clear().unwrap();
        assert_eq!(journal.replay().unwrap().len(), 0);
        assert_eq!(journal.size_bytes(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_compact_drops_dead_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica_4.chl");

        let mut journal = Journal::create(path.clone(), true).unwrap();
        for seq in 1..=100 {
            journal.append(&put(10, seq, 4)).unwrap();
        }
        for seq in 1..=90 {
            journal
                .append(&JournalOp::Delete {
                    key: Csn::new(10, seq, 4),
                })
                .unwrap();
        }

        let live: Vec<JournalOp> = (91..=100).map(|seq| put(10, seq, 4)).collect();
        journal.compact(live.into_iter()).unwrap();
        drop(journal);

        let mut reopened = Journal::open(path, true).unwrap();
        let ops = reopened.replay().unwrap();
        assert_eq!(ops.len(), 10);
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica_5.chl");

        let mut journal = Journal::create(path.clone(), false).unwrap();
        journal.append(&put(7, 1, 5)).unwrap();
        journal.sync().unwrap();
        drop(journal);

        // Flip a payload byte past the frame header
        let mut contents = std::fs::read(&path).unwrap();
        let idx = contents.len() - 6;
        contents[idx] ^= 0xff;
        std::fs::write(&path, contents).unwrap();

        let mut reopened = Journal::open(path, false).unwrap();
        let err = reopened.replay().unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }
}
