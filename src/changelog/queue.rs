//! Pending-write queue
//!
//! Bounded in-memory FIFO buffering one replica's changes before the writer
//! task flushes them to the changelog. Producers block (bounded wait,
//! periodically re-checked) once the queue holds more than the configured
//! maximum in records or aggregate bytes, and are released when a flush
//! drains it below the low watermark.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::config::QueueConfig;
use crate::csn::Csn;
use crate::error::{Error, Result};
use crate::shutdown::ShutdownHandle;

use super::record::ChangeRecord;

struct QueueInner {
    entries: VecDeque<ChangeRecord>,
    bytes: usize,
}

/// Bounded FIFO of not-yet-flushed changes for one replica
pub struct PendingWriteQueue {
    max_records: usize,
    max_bytes: usize,
    low_mark: usize,
    low_mark_bytes: usize,
    high_mark: usize,
    high_mark_bytes: usize,
    recheck: Duration,
    inner: Mutex<QueueInner>,
    /// Wakes producers blocked on a full queue
    space: Notify,
    /// Wakes the writer task when entries arrive
    arrival: Notify,
    shutdown: ShutdownHandle,
}

impl PendingWriteQueue {
    /// Create a queue sized from the configuration
    pub fn new(config: &QueueConfig, shutdown: ShutdownHandle) -> Self {
        Self {
            max_records: config.max_records,
            max_bytes: config.max_bytes(),
            low_mark: config.low_mark(),
            low_mark_bytes: config.low_mark_bytes(),
            high_mark: config.high_mark(),
            high_mark_bytes: config.high_mark_bytes(),
            recheck: Duration::from_millis(config.enqueue_recheck_ms),
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                bytes: 0,
            }),
            space: Notify::new(),
            arrival: Notify::new(),
            shutdown,
        }
    }

    /// Add a change at the back, blocking while the queue is over its
    /// record or byte maximum. Fails with `ShuttingDown` if the engine stops
    /// while waiting.
    pub async fn enqueue(&self, record: ChangeRecord) -> Result<()> {
        loop {
            if self.shutdown.is_shutdown() {
                return Err(Error::ShuttingDown);
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.entries.len() < self.max_records && inner.bytes < self.max_bytes {
                    inner.bytes += record.byte_size();
                    inner.entries.push_back(record);
                    drop(inner);
                    self.arrival.notify_waiters();
                    return Ok(());
                }
            }

            // Full: wait for a drain notification, re-checking periodically
            let _ = tokio::time::timeout(self.recheck, self.space.notified()).await;
        }
    }

    /// Return up to `n` oldest entries without removing them
    pub async fn peek_up_to(&self, n: usize) -> Vec<ChangeRecord> {
        let inner = self.inner.lock().await;
        inner.entries.iter().take(n).cloned().collect()
    }

    /// Remove exactly `n` entries from the front after a successful flush,
    /// waking blocked producers once the queue drops below the low watermark
    pub async fn remove_front(&self, n: usize) {
        let mut inner = self.inner.lock().await;
        for _ in 0..n {
            if let Some(record) = inner.entries.pop_front() {
                inner.bytes -= record.byte_size();
            }
        }
        if inner.entries.len() <= self.low_mark && inner.bytes <= self.low_mark_bytes {
            self.space.notify_waiters();
        }
    }

    /// CSN of the oldest queued entry, if any
    pub async fn first_csn(&self) -> Option<Csn> {
        let inner = self.inner.lock().await;
        inner.entries.front().map(|r| r.csn)
    }

    /// Whether a CSN is still buffered in the live queue
    pub async fn contains(&self, csn: &Csn) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.iter().any(|r| r.csn == *csn)
    }

    /// Current queued record count
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Current queued byte total
    pub async fn bytes(&self) -> usize {
        self.inner.lock().await.bytes
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Whether the queue sits below its low watermark
    pub async fn below_low_mark(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.len() <= self.low_mark && inner.bytes <= self.low_mark_bytes
    }

    /// Whether the queue sits at or above its high watermark. Surfaced
    /// through monitoring as a saturation signal before producers block.
    pub async fn above_high_mark(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.len() >= self.high_mark || inner.bytes >= self.high_mark_bytes
    }

    /// Wake every waiter (producers and the writer task) during shutdown
    pub fn wake_all(&self) {
        self.space.notify_waiters();
        self.arrival.notify_waiters();
    }

    /// Wait until at least one entry is queued or the timeout elapses
    pub async fn wait_for_entries(&self, timeout: Duration) {
        if !self.is_empty().await {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.arrival.notified()).await;
    }
}
