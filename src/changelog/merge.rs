//! Catch-up merge iteration
//!
//! Rebuilds a consumer's change stream once its live queue has been pruned:
//! one cursor per replica log, positioned just after the consumer's last-seen
//! CSN for that replica, merged through a min-heap into a single globally
//! CSN-ordered sequence. Each iterator covers one bounded burst; a consumer
//! that is still behind builds a fresh iterator with its updated state.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::ServerState;

use super::cursor::LogCursor;
use super::log::ReplicaLog;
use super::record::ChangeRecord;

/// Heap entry ordered by the cursor's current record CSN
struct HeapItem {
    record: ChangeRecord,
    cursor_idx: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.record.csn == other.record.csn
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.record.csn.cmp(&other.record.csn)
    }
}

/// Globally CSN-ordered merge over multiple replica logs, bounded to one
/// catch-up burst
pub struct CatchupIterator {
    heap: BinaryHeap<Reverse<HeapItem>>,
    cursors: Vec<Option<LogCursor>>,
    records_left: usize,
    bytes_left: usize,
    budget_exhausted: bool,
}

impl CatchupIterator {
    /// Build a burst iterator from the consumer's last-seen state
    ///
    /// Logs the consumer has never seen are read from their start; empty
    /// logs contribute nothing.
    pub fn new(
        logs: &[Arc<ReplicaLog>],
        state: &ServerState,
        max_records: usize,
        max_bytes: usize,
    ) -> Result<Self> {
        let mut cursors: Vec<Option<LogCursor>> = Vec::with_capacity(logs.len());
        let mut heap = BinaryHeap::new();

        for log in logs {
            let opened = match state.max_csn(log.server_id()) {
                Some(last_seen) => log.open_cursor_after(last_seen),
                None => log.open_cursor_from(None),
            };

            let mut cursor = match opened {
                Ok(cursor) => cursor,
                Err(Error::NotAvailable(_)) => continue,
                Err(e) => return Err(e),
            };

            match cursor.next()? {
                Some(record) => {
                    let cursor_idx = cursors.len();
                    cursors.push(Some(cursor));
                    heap.push(Reverse(HeapItem { record, cursor_idx }));
                }
                // Exhausted cursors are released immediately to free log locks
                None => drop(cursor),
            }
        }

        Ok(Self {
            heap,
            cursors,
            records_left: max_records,
            bytes_left: max_bytes,
            budget_exhausted: false,
        })
    }

    /// Pop the globally-smallest record, advancing its source cursor.
    /// Returns None once the burst budget is spent or every log is drained.
    pub fn next(&mut self) -> Result<Option<ChangeRecord>> {
        if self.records_left == 0 || self.bytes_left == 0 {
            self.budget_exhausted = !self.heap.is_empty();
            self.release_all();
            return Ok(None);
        }

        let Some(Reverse(HeapItem { record, cursor_idx })) = self.heap.pop() else {
            return Ok(None);
        };

        if let Some(cursor) = self.cursors[cursor_idx].as_mut() {
            match cursor.next()? {
                Some(next_record) => {
                    self.heap.push(Reverse(HeapItem {
                        record: next_record,
                        cursor_idx,
                    }));
                }
                None => {
                    self.cursors[cursor_idx] = None;
                }
            }
        }

        self.records_left -= 1;
        self.bytes_left = self.bytes_left.saturating_sub(record.byte_size());
        Ok(Some(record))
    }

    /// Whether iteration stopped on the burst budget rather than exhausting
    /// the logs (the consumer needs another burst)
    pub fn budget_exhausted(&self) -> bool {
        self.budget_exhausted || (!self.heap.is_empty() && self.records_left == 0)
    }

    fn release_all(&mut self) {
        self.heap.clear();
        for slot in self.cursors.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangelogConfig;
    use crate::csn::Csn;
    use crate::shutdown::ShutdownHandle;
    use tempfile::tempdir;

    fn open_log(dir: &std::path::Path, server_id: u32) -> Arc<ReplicaLog> {
        let config = ChangelogConfig {
            counter_window_size: 5,
            compression: false,
            ..Default::default()
        };
        Arc::new(ReplicaLog::open(dir, server_id, &config, ShutdownHandle::new()).unwrap())
    }

    fn fill(log: &ReplicaLog, server_id: u32, times: &[u64]) {
        for (i, t) in times.iter().enumerate() {
            log.append(ChangeRecord::new(
                Csn::new(*t, i as u32 + 1, server_id),
                vec![0u8; 4],
            ))
            .unwrap();
        }
    }

    #[test]
    fn test_merge_is_globally_ordered() {
        let dir = tempdir().unwrap();
        let log1 = open_log(dir.path(), 1);
        let log2 = open_log(dir.path(), 2);
        let log3 = open_log(dir.path(), 3);

        fill(&log1, 1, &[10, 40, 70]);
        fill(&log2, 2, &[20, 50, 80]);
        fill(&log3, 3, &[30, 60, 90]);

        let mut iter = CatchupIterator::new(
            &[log1, log2, log3],
            &ServerState::new(),
            100,
            100_000,
        )
        .unwrap();

        let mut csns = Vec::new();
        while let Some(record) = iter.next().unwrap() {
            csns.push(record.csn);
        }

        assert_eq!(csns.len(), 9);
        for pair in csns.windows(2) {
            assert!(pair[0] < pair[1], "Merge output must be CSN-ordered");
        }
        assert!(!iter.budget_exhausted());
    }

    #[test]
    fn test_merge_starts_after_server_state() {
        let dir = tempdir().unwrap();
        let log1 = open_log(dir.path(), 1);
        let log2 = open_log(dir.path(), 2);

        fill(&log1, 1, &[10, 20, 30]);
        fill(&log2, 2, &[15, 25, 35]);

        let mut state = ServerState::new();
        state.update(Csn::new(20, 2, 1));
        state.update(Csn::new(15, 1, 2));

        let mut iter = CatchupIterator::new(&[log1, log2], &state, 100, 100_000).unwrap();

        let mut times = Vec::new();
        while let Some(record) = iter.next().unwrap() {
            times.push(record.csn.time_ms);
        }
        assert_eq!(times, vec![25, 30, 35]);
    }

    #[test]
    fn test_record_budget_bounds_burst() {
        let dir = tempdir().unwrap();
        let log1 = open_log(dir.path(), 1);
        fill(&log1, 1, &(1..=50).collect::<Vec<u64>>());

        let mut iter =
            CatchupIterator::new(&[Arc::clone(&log1)], &ServerState::new(), 10, 100_000).unwrap();

        let mut count = 0;
        while iter.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
        assert!(iter.budget_exhausted());

        // A fresh iterator with updated state resumes where the burst ended
        let mut state = ServerState::new();
        state.update(Csn::new(10, 10, 1));
        let mut iter = CatchupIterator::new(&[log1], &state, 100, 100_000).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().csn.time_ms, 11);
    }

    #[test]
    fn test_byte_budget_bounds_burst() {
        let dir = tempdir().unwrap();
        let log1 = open_log(dir.path(), 1);
        fill(&log1, 1, &(1..=50).collect::<Vec<u64>>());

        // Each record is 20 bytes (16-byte CSN + 4 payload)
        let mut iter =
            CatchupIterator::new(&[log1], &ServerState::new(), 1000, 100).unwrap();

        let mut count = 0;
        while iter.next().unwrap().is_some() {
            count += 1;
        }
        assert!(count <= 5, "Byte budget must bound the burst, got {}", count);
        assert!(iter.budget_exhausted());
    }

    #[test]
    fn test_empty_logs_are_skipped() {
        let dir = tempdir().unwrap();
        let log1 = open_log(dir.path(), 1);
        let log2 = open_log(dir.path(), 2);
        fill(&log2, 2, &[5]);

        let mut iter =
            CatchupIterator::new(&[log1, log2], &ServerState::new(), 100, 100_000).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().csn.server_id, 2);
        assert!(iter.next().unwrap().is_none());
    }
}
