//! Changelog record types
//!
//! Defines the records stored in a replica changelog: real change records
//! keyed by their CSN, and synthetic counter records that amortize range
//! counting. The key space is ordered by CSN; the counter sentinel uses
//! replica id 0 and sequence 0 at a given timestamp, which sorts before any
//! real record sharing that timestamp.

use serde::{Deserialize, Serialize};

use crate::csn::Csn;

/// Reserved counter-record key at the given timestamp
pub fn counter_key(time_ms: u64) -> Csn {
    Csn::new(time_ms, 0, 0)
}

/// Whether a key is the counter-record sentinel
pub fn is_counter_key(csn: &Csn) -> bool {
    csn.server_id == 0 && csn.seq == 0
}

/// A replicated change: opaque serialized update payload keyed by its CSN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Change identifier and storage key
    pub csn: Csn,
    /// Opaque serialized update payload
    pub payload: Vec<u8>,
}

impl ChangeRecord {
    /// Create a new change record
    pub fn new(csn: Csn, payload: Vec<u8>) -> Self {
        Self { csn, payload }
    }

    /// In-memory size used for queue byte accounting
    pub fn byte_size(&self) -> usize {
        Csn::SIZE + self.payload.len()
    }
}

/// A stored changelog value: a real change or a counter checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogValue {
    /// Real change record
    Change(ChangeRecord),
    /// Running count of real records written before this checkpoint
    Counter(u64),
}

impl LogValue {
    /// Whether this value is a real change
    pub fn is_change(&self) -> bool {
        matches!(self, LogValue::Change(_))
    }

    /// The change record, if this is one
    pub fn as_change(&self) -> Option<&ChangeRecord> {
        match self {
            LogValue::Change(record) => Some(record),
            LogValue::Counter(_) => None,
        }
    }

    /// The counter value, if this is a counter record
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            LogValue::Counter(value) => Some(*value),
            LogValue::Change(_) => None,
        }
    }
}

/// Durable journal operation replayed on open to rebuild the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalOp {
    /// Insert a record (real or counter) at its key
    Put { key: Csn, value: LogValue },
    /// Remove the record at a key (trim)
    Delete { key: Csn },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_sorts_before_real_records() {
        let counter = counter_key(101);
        let real = Csn::new(101, 1, 1);
        assert!(counter < real);
        assert!(is_counter_key(&counter));
        assert!(!is_counter_key(&real));
    }

    #[test]
    fn test_seq_zero_real_key_is_not_counter() {
        // A real replica may legitimately emit sequence 0; only replica id 0
        // marks the sentinel
        let key = Csn::new(100, 0, 3);
        assert!(!is_counter_key(&key));
    }

    #[test]
    fn test_byte_size() {
        let record = ChangeRecord::new(Csn::new(1, 2, 3), vec![0u8; 100]);
        assert_eq!(record.byte_size(), 116);
    }

    #[test]
    fn test_journal_op_round_trip() {
        let op = JournalOp::Put {
            key: Csn::new(100, 1, 2),
            value: LogValue::Change(ChangeRecord::new(Csn::new(100, 1, 2), b"add: cn=x".to_vec())),
        };

        let bytes = bincode::serialize(&op).unwrap();
        let restored: JournalOp = bincode::deserialize(&bytes).unwrap();
        match restored {
            JournalOp::Put { key, value } => {
                assert_eq!(key, Csn::new(100, 1, 2));
                assert!(value.is_change());
            }
            _ => panic!("Wrong op after deserialize"),
        }
    }
}
