//! Change Sequence Numbers
//!
//! A CSN is the globally comparable identifier stamped on every replicated
//! change: wall-clock time in milliseconds, a per-millisecond sequence number
//! and the originating replica id. CSNs order totally (time, then sequence,
//! then replica id) and are the primary key of every stored change.
//!
//! Byte layout of the serialized form (16 bytes, big-endian so lexicographic
//! byte order equals CSN order):
//! - 8 bytes: timestamp (milliseconds since UNIX epoch)
//! - 4 bytes: sequence number
//! - 4 bytes: replica id

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Packed generator state bit allocation
const SEQUENCE_BITS: u64 = 21;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Change Sequence Number
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Csn {
    /// Wall-clock time in milliseconds since the UNIX epoch
    pub time_ms: u64,
    /// Monotonic sequence number within the millisecond
    pub seq: u32,
    /// Originating replica id
    pub server_id: u32,
}

impl Csn {
    /// Serialized size in bytes
    pub const SIZE: usize = 16;

    /// Create a CSN from its three fields
    pub fn new(time_ms: u64, seq: u32, server_id: u32) -> Self {
        Self {
            time_ms,
            seq,
            server_id,
        }
    }

    /// Serialize to a sortable big-endian byte encoding
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.time_ms.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.seq.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.server_id.to_be_bytes());
        bytes
    }

    /// Parse a CSN from its byte encoding
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            time_ms: u64::from_be_bytes(bytes[0..8].try_into().ok()?),
            seq: u32::from_be_bytes(bytes[8..12].try_into().ok()?),
            server_id: u32::from_be_bytes(bytes[12..16].try_into().ok()?),
        })
    }

    /// Age of this CSN relative to `now_ms` (0 if the CSN is in the future)
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.time_ms)
    }
}

impl std::fmt::Display for Csn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:08x}{:08x}", self.time_ms, self.seq, self.server_id)
    }
}

/// Current wall-clock time in milliseconds since the UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// CSN Generator
///
/// Thread-safe generator producing strictly increasing CSNs for one replica.
pub struct CsnGenerator {
    server_id: u32,
    /// Packed state: upper 43 bits = last timestamp, lower 21 bits = sequence
    state: AtomicU64,
}

impl CsnGenerator {
    /// Create a new generator for the given replica id
    ///
    /// # Panics
    /// Panics if server_id is 0 (reserved for counter-record sentinels)
    pub fn new(server_id: u32) -> Self {
        assert!(server_id != 0, "Replica id 0 is reserved");
        Self {
            server_id,
            state: AtomicU64::new(0),
        }
    }

    /// Generate a new CSN, strictly greater than any previous one
    ///
    /// Lock-free; survives clock regression by holding the old timestamp and
    /// advancing the sequence number until the clock catches up.
    pub fn generate(&self) -> Csn {
        loop {
            let current_time = now_millis();
            let old_state = self.state.load(Ordering::Relaxed);
            let old_timestamp = old_state >> SEQUENCE_BITS;
            let old_sequence = old_state & MAX_SEQUENCE;

            let (new_timestamp, new_sequence) = if current_time > old_timestamp {
                (current_time, 0)
            } else {
                let next_seq = old_sequence + 1;
                if next_seq > MAX_SEQUENCE {
                    // Sequence overflow, wait for the next millisecond
                    std::thread::yield_now();
                    continue;
                }
                (old_timestamp, next_seq)
            };

            let new_state = (new_timestamp << SEQUENCE_BITS) | new_sequence;

            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Csn {
                    time_ms: new_timestamp,
                    seq: new_sequence as u32,
                    server_id: self.server_id,
                };
            }
            // CAS failed, retry
        }
    }

    /// Make sure future CSNs sort after one received from another replica
    pub fn adjust(&self, seen: &Csn) {
        loop {
            let old_state = self.state.load(Ordering::Relaxed);
            let old_timestamp = old_state >> SEQUENCE_BITS;
            let old_sequence = old_state & MAX_SEQUENCE;

            if seen.time_ms < old_timestamp
                || (seen.time_ms == old_timestamp && (seen.seq as u64) < old_sequence)
            {
                return;
            }

            let new_state = (seen.time_ms << SEQUENCE_BITS) | (seen.seq as u64 & MAX_SEQUENCE);
            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Get the replica id this generator stamps
    pub fn server_id(&self) -> u32 {
        self.server_id
    }
}
