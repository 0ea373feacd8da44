//! Replica changelog
//!
//! The durable, per-replica append-only store of changes, keyed by CSN.
//! Periodic counter records are embedded in the key space so that counting
//! the records between two CSNs costs O(counter window) instead of a full
//! scan. An in-memory ordered index fronts an append-only journal file; the
//! journal is replayed on open and compacted after heavy trimming.
//!
//! Locking: the outer `RwLock` separates normal operation (read side, allows
//! concurrent cursors) from clear/close (write side, exclusive). The inner
//! `Mutex` guards the index and journal for individual operations.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::ChangelogConfig;
use crate::csn::Csn;
use crate::error::{Error, Result};
use crate::shutdown::{ShutdownHandle, ShutdownReason};

use super::cursor::{DeleteCursor, LogCursor};
use super::journal::Journal;
use super::record::{counter_key, ChangeRecord, JournalOp, LogValue};

/// Bound on internal retries for transient storage conflicts
pub(crate) const RETRY_LIMIT: u32 = 10;

/// Whether the log accepts operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogState {
    Open,
    Closed,
}

pub(crate) struct LogInner {
    /// Ordered index over real and counter records
    pub(crate) index: BTreeMap<Csn, LogValue>,
    /// Durable backing journal
    journal: Journal,
    /// Real records ever appended (never reset; counter values derive from it)
    counter_curr_value: u64,
    /// Timestamp of a counter checkpoint awaiting a timestamp change
    pending_counter_time: Option<u64>,
}

pub(crate) struct LogShared {
    pub(crate) server_id: u32,
    counter_window: u64,
    fsync: bool,
    pub(crate) guard: RwLock<LogState>,
    pub(crate) inner: Mutex<LogInner>,
}

/// Durable per-replica changelog
pub struct ReplicaLog {
    shared: Arc<LogShared>,
    shutdown: ShutdownHandle,
}

/// Map spurious I/O interruptions into the transient class so callers retry
fn classify(err: Error) -> Error {
    match err {
        Error::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ) =>
        {
            Error::Transient(e.to_string())
        }
        other => other,
    }
}

/// Retry a storage operation up to the fixed bound on transient conflicts
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match op().map_err(classify) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < RETRY_LIMIT => {
                attempts += 1;
                tracing::warn!(
                    "Transient changelog conflict (attempt {}/{}): {}",
                    attempts,
                    RETRY_LIMIT,
                    err
                );
            }
            Err(err) => return Err(err),
        }
    }
}

impl ReplicaLog {
    /// Open (or create) the changelog for one replica under `dir`
    pub fn open(
        dir: &Path,
        server_id: u32,
        config: &ChangelogConfig,
        shutdown: ShutdownHandle,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("replica_{:010}.chl", server_id));
        let mut journal = Journal::open(path, config.compression)?;

        let mut index = BTreeMap::new();
        for op in journal.replay()? {
            match op {
                JournalOp::Put { key, value } => {
                    index.insert(key, value);
                }
                JournalOp::Delete { key } => {
                    index.remove(&key);
                }
            }
        }

        // Rebuild the running counter from the last surviving checkpoint so
        // that differences between adjacent counter records keep matching the
        // number of real records physically between them.
        let last_counter = index
            .iter()
            .rev()
            .find_map(|(key, value)| value.as_counter().map(|v| (*key, v)));
        let counter_curr_value = match last_counter {
            Some((key, value)) => {
                let after = index
                    .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
                    .filter(|(_, v)| v.is_change())
                    .count() as u64;
                value + 1 + after
            }
            None => index.values().filter(|v| v.is_change()).count() as u64,
        };

        tracing::info!(
            "Opened changelog for replica {} with {} records",
            server_id,
            index.len()
        );

        Ok(Self {
            shared: Arc::new(LogShared {
                server_id,
                counter_window: config.counter_window_size,
                fsync: config.fsync,
                guard: RwLock::new(LogState::Open),
                inner: Mutex::new(LogInner {
                    index,
                    journal,
                    counter_curr_value,
                    pending_counter_time: None,
                }),
            }),
            shutdown,
        })
    }

    /// The replica id this log stores changes for
    pub fn server_id(&self) -> u32 {
        self.shared.server_id
    }

    /// Mark the log closed and escalate an unrecoverable storage fault
    fn fatal(&self, err: Error) -> Error {
        if let Ok(mut state) = self.shared.guard.write() {
            *state = LogState::Closed;
        }
        tracing::error!(
            "Unrecoverable changelog fault on replica {}: {} - requesting server shutdown",
            self.shared.server_id,
            err
        );
        self.shutdown.shutdown(ShutdownReason::FatalStorage);
        err
    }

    fn read_guard(&self) -> Result<std::sync::RwLockReadGuard<'_, LogState>> {
        let guard = self
            .shared
            .guard
            .read()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
        if *guard == LogState::Closed {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    /// Append one change keyed by its CSN
    ///
    /// Inserts the pending counter record first when the incoming timestamp
    /// differs from the checkpoint's, so counter keys never collide with real
    /// keys sharing a timestamp.
    pub fn append(&self, record: ChangeRecord) -> Result<()> {
        if record.csn.server_id != self.shared.server_id {
            return Err(Error::Changelog(format!(
                "Record from replica {} appended to log of replica {}",
                record.csn.server_id, self.shared.server_id
            )));
        }

        let _guard = self.read_guard()?;
        let mut inner = self.lock_inner()?;

        if let Some(pending_time) = inner.pending_counter_time {
            if record.csn.time_ms != pending_time {
                let value = inner.counter_curr_value.saturating_sub(1);
                let key = counter_key(record.csn.time_ms);
                let result = with_retry(|| {
                    inner.journal.append(&JournalOp::Put {
                        key,
                        value: LogValue::Counter(value),
                    })
                });
                if let Err(err) = result {
                    drop(inner);
                    drop(_guard);
                    return Err(self.fatal(err));
                }
                inner.index.insert(key, LogValue::Counter(value));
                inner.pending_counter_time = None;
            }
        }

        let key = record.csn;
        let result = with_retry(|| {
            inner.journal.append(&JournalOp::Put {
                key,
                value: LogValue::Change(record.clone()),
            })
        });
        if let Err(err) = result {
            drop(inner);
            drop(_guard);
            return Err(self.fatal(err));
        }
        inner.index.insert(key, LogValue::Change(record));
        inner.counter_curr_value += 1;

        if self.shared.counter_window > 0
            && inner.counter_curr_value % self.shared.counter_window == 0
        {
            inner.pending_counter_time = Some(key.time_ms);
        }

        Ok(())
    }

    /// The oldest real (non-counter) CSN, or None if the log holds none
    pub fn read_first(&self) -> Result<Option<Csn>> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;
        Ok(inner
            .index
            .iter()
            .find(|(_, v)| v.is_change())
            .map(|(k, _)| *k))
    }

    /// The newest real (non-counter) CSN, or None if the log holds none
    pub fn read_last(&self) -> Result<Option<Csn>> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;
        Ok(inner
            .index
            .iter()
            .rev()
            .find(|(_, v)| v.is_change())
            .map(|(k, _)| *k))
    }

    /// Number of real records between two CSNs inclusive
    ///
    /// Scans forward from `from` and backward from `to` until the first
    /// counter record on each side, then bridges the middle with the counter
    /// value difference instead of walking it.
    pub fn count(&self, from: Csn, to: Csn) -> Result<u64> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;

        if from > to {
            return Ok(0);
        }

        let mut forward_partial = 0u64;
        let mut first_counter: Option<(Csn, u64)> = None;
        for (key, value) in inner.index.range(from..=to) {
            match value {
                LogValue::Change(_) => forward_partial += 1,
                LogValue::Counter(v) => {
                    first_counter = Some((*key, *v));
                    break;
                }
            }
        }

        let Some((c1_key, c1_value)) = first_counter else {
            // No counter in range: the forward scan reached `to`
            return Ok(forward_partial);
        };

        let mut backward_partial = 0u64;
        let mut last_counter: Option<(Csn, u64)> = None;
        for (key, value) in inner.index.range(from..=to).rev() {
            match value {
                LogValue::Change(_) => backward_partial += 1,
                LogValue::Counter(v) => {
                    last_counter = Some((*key, *v));
                    break;
                }
            }
        }

        // A counter was found forward, so the backward scan finds one too
        let (c2_key, c2_value) = last_counter.unwrap_or((c1_key, c1_value));

        if c1_key == c2_key {
            Ok(forward_partial + backward_partial)
        } else {
            Ok(forward_partial + (c2_value - c1_value) + backward_partial)
        }
    }

    /// Reference count by full linear scan (test oracle and cold paths)
    pub fn count_linear(&self, from: Csn, to: Csn) -> Result<u64> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;
        if from > to {
            return Ok(0);
        }
        Ok(inner
            .index
            .range(from..=to)
            .filter(|(_, v)| v.is_change())
            .count() as u64)
    }

    /// Open a read cursor positioned at `from` (or the nearest following
    /// record; falls back to the closest preceding record, then a full
    /// rescan). `None` positions at the start of the log.
    pub fn open_cursor_from(&self, from: Option<Csn>) -> Result<LogCursor> {
        let _guard = self.read_guard()?;
        LogCursor::position_from(Arc::clone(&self.shared), from)
    }

    /// Open a read cursor positioned strictly after `after`
    pub fn open_cursor_after(&self, after: Csn) -> Result<LogCursor> {
        let _guard = self.read_guard()?;
        LogCursor::position_after(Arc::clone(&self.shared), after)
    }

    /// Open a transactional cursor for trimming
    pub fn open_delete_cursor(&self) -> Result<DeleteCursor> {
        let _guard = self.read_guard()?;
        Ok(DeleteCursor::new(
            Arc::clone(&self.shared),
            self.shutdown.clone(),
        ))
    }

    /// Sync the backing journal to disk (no-op when fsync is disabled)
    pub fn sync(&self) -> Result<()> {
        if !self.shared.fsync {
            return Ok(());
        }
        let result = {
            let _guard = self.read_guard()?;
            let inner = self.lock_inner()?;
            with_retry(|| inner.journal.sync())
        };
        result.map_err(|e| self.fatal(e))
    }

    /// Rewrite the journal from live records when trimming left enough dead
    /// frames behind. Returns true if a compaction ran.
    ///
    /// A delete leaves two dead frames behind (the put it cancels plus its
    /// own delete frame), so the dead count is the journal frame count minus
    /// the live index size. Counting frames rather than deletes keeps the
    /// estimate honest across a reopen.
    pub fn compact_if_needed(&self) -> Result<bool> {
        let _guard = self.read_guard()?;
        let mut inner = self.lock_inner()?;

        let live = inner.index.len() as u64;
        let dead = inner.journal.op_count().saturating_sub(live);
        if dead < 1000 || dead < live {
            return Ok(false);
        }

        tracing::info!(
            "Compacting changelog for replica {} ({} live records, {} dead journal frames)",
            self.shared.server_id,
            live,
            dead
        );

        let ops: Vec<JournalOp> = inner
            .index
            .iter()
            .map(|(key, value)| JournalOp::Put {
                key: *key,
                value: value.clone(),
            })
            .collect();
        if let Err(err) = with_retry(|| inner.journal.compact(ops.clone().into_iter())) {
            drop(inner);
            drop(_guard);
            return Err(self.fatal(err));
        }
        Ok(true)
    }

    /// Logically truncate and recreate the store
    pub fn clear(&self) -> Result<()> {
        let mut state = self
            .shared
            .guard
            .write()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
        if *state == LogState::Closed {
            return Err(Error::Closed);
        }

        let mut inner = self.lock_inner()?;
        if let Err(err) = with_retry(|| inner.journal.clear()) {
            *state = LogState::Closed;
            drop(inner);
            self.shutdown.shutdown(ShutdownReason::FatalStorage);
            return Err(err);
        }
        inner.index.clear();
        inner.counter_curr_value = 0;
        inner.pending_counter_time = None;
        tracing::info!("Cleared changelog for replica {}", self.shared.server_id);
        Ok(())
    }

    /// Close the log; subsequent operations fail with `Closed`
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self
            .shared
            .guard
            .write()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
        if *state == LogState::Closed {
            return Ok(());
        }
        *state = LogState::Closed;

        let inner = self.lock_inner()?;
        if let Err(e) = inner.journal.sync() {
            tracing::warn!(
                "Final sync failed while closing changelog for replica {}: {}",
                self.shared.server_id,
                e
            );
        }
        Ok(())
    }

    /// Number of real records currently stored
    pub fn record_count(&self) -> Result<u64> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;
        Ok(inner.index.values().filter(|v| v.is_change()).count() as u64)
    }

    /// Journal size on disk in bytes
    pub fn size_bytes(&self) -> Result<u64> {
        let _guard = self.read_guard()?;
        let inner = self.lock_inner()?;
        Ok(inner.journal.size_bytes())
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, LogInner>> {
        self.shared
            .inner
            .lock()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))
    }
}

impl LogInner {
    /// Apply one delete, journaling it first. Used by the delete cursor.
    pub(crate) fn apply_delete(&mut self, key: Csn) -> Result<()> {
        with_retry(|| self.journal.append(&JournalOp::Delete { key }))?;
        self.index.remove(&key);
        Ok(())
    }
}
