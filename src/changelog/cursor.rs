//! Changelog cursors
//!
//! `LogCursor` walks real records of one replica log in CSN order,
//! re-acquiring the log locks per step so a slow consumer never pins the
//! store. `DeleteCursor` is the transactional trim cursor: deletions are
//! collected against the current position and applied on commit, or thrown
//! away on abort.

use std::ops::Bound;
use std::sync::Arc;

use crate::csn::Csn;
use crate::error::{Error, Result};
use crate::shutdown::{ShutdownHandle, ShutdownReason};

use super::log::{LogShared, LogState};
use super::record::{ChangeRecord, LogValue};

/// Read cursor over the real records of one replica log
pub struct LogCursor {
    shared: Arc<LogShared>,
    /// Lower bound for the next step
    next_from: Bound<Csn>,
}

impl LogCursor {
    /// Position at `from` or the nearest following record; if nothing
    /// follows, fall back to the closest preceding record, then to a full
    /// rescan from the start. Fails with `NotAvailable` on an empty log.
    pub(crate) fn position_from(shared: Arc<LogShared>, from: Option<Csn>) -> Result<Self> {
        let start = {
            let inner = shared
                .inner
                .lock()
                .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;

            let following = from.map_or_else(
                || first_change(&inner.index, Bound::Unbounded),
                |csn| first_change(&inner.index, Bound::Included(csn)),
            );

            let position = following.or_else(|| {
                // Range search found nothing following: take the closest
                // preceding record, then rescan from the start as a last
                // resort
                from.and_then(|csn| {
                    inner
                        .index
                        .range(..csn)
                        .rev()
                        .find(|(_, v)| v.is_change())
                        .map(|(k, _)| *k)
                })
                .or_else(|| first_change(&inner.index, Bound::Unbounded))
            });

            match position {
                Some(csn) => csn,
                None => {
                    return Err(Error::NotAvailable(format!(
                        "Changelog for replica {} holds no records",
                        shared.server_id
                    )))
                }
            }
        };

        Ok(Self {
            shared,
            next_from: Bound::Included(start),
        })
    }

    /// Position strictly after `after`
    pub(crate) fn position_after(shared: Arc<LogShared>, after: Csn) -> Result<Self> {
        {
            let inner = shared
                .inner
                .lock()
                .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
            if !inner.index.values().any(|v| v.is_change()) {
                return Err(Error::NotAvailable(format!(
                    "Changelog for replica {} holds no records",
                    shared.server_id
                )));
            }
        }
        Ok(Self {
            shared,
            next_from: Bound::Excluded(after),
        })
    }

    /// Return the record at the current position and advance, or None when
    /// the log is exhausted
    pub fn next(&mut self) -> Result<Option<ChangeRecord>> {
        let state = self
            .shared
            .guard
            .read()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
        if *state == LogState::Closed {
            return Err(Error::Closed);
        }

        let inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;

        let found = inner
            .index
            .range((self.next_from, Bound::Unbounded))
            .find_map(|(key, value)| value.as_change().map(|r| (*key, r.clone())));

        match found {
            Some((key, record)) => {
                self.next_from = Bound::Excluded(key);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The replica id this cursor reads from
    pub fn server_id(&self) -> u32 {
        self.shared.server_id
    }
}

fn first_change(
    index: &std::collections::BTreeMap<Csn, LogValue>,
    from: Bound<Csn>,
) -> Option<Csn> {
    index
        .range((from, Bound::Unbounded))
        .find(|(_, v)| v.is_change())
        .map(|(k, _)| *k)
}

/// Transactional trim cursor
///
/// Walks every entry (counter records included), collects deletions against
/// the visited positions, and applies them as one batch on `commit`.
pub struct DeleteCursor {
    shared: Arc<LogShared>,
    shutdown: ShutdownHandle,
    next_from: Bound<Csn>,
    current: Option<Csn>,
    pending: Vec<Csn>,
}

impl DeleteCursor {
    pub(crate) fn new(shared: Arc<LogShared>, shutdown: ShutdownHandle) -> Self {
        Self {
            shared,
            shutdown,
            next_from: Bound::Unbounded,
            current: None,
            pending: Vec::new(),
        }
    }

    /// Advance to the next entry (real or counter), returning its key/value
    pub fn next(&mut self) -> Result<Option<(Csn, LogValue)>> {
        let state = self
            .shared
            .guard
            .read()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
        if *state == LogState::Closed {
            return Err(Error::Closed);
        }

        let inner = self
            .shared
            .inner
            .lock()
            .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;

        let found = inner
            .index
            .range((self.next_from, Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, v.clone()));

        match found {
            Some((key, value)) => {
                self.next_from = Bound::Excluded(key);
                self.current = Some(key);
                Ok(Some((key, value)))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Mark the entry at the current position for deletion
    pub fn delete(&mut self) -> Result<()> {
        match self.current {
            Some(key) => {
                self.pending.push(key);
                Ok(())
            }
            None => Err(Error::Changelog(
                "Delete cursor is not positioned on a record".into(),
            )),
        }
    }

    /// Number of deletions collected so far
    pub fn pending_deletes(&self) -> usize {
        self.pending.len()
    }

    /// Apply the collected deletions. Transient conflicts are retried inside
    /// the journal layer; exhaustion closes the log and escalates, the same
    /// as an append failure.
    pub fn commit(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let result = {
            let state = self
                .shared
                .guard
                .read()
                .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;
            if *state == LogState::Closed {
                return Err(Error::Closed);
            }

            let mut inner = self
                .shared
                .inner
                .lock()
                .map_err(|_| Error::Internal("Changelog lock poisoned".into()))?;

            let keys = std::mem::take(&mut self.pending);
            let applied = keys.len();
            let mut outcome = Ok(applied);
            for key in keys {
                if let Err(err) = inner.apply_delete(key) {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        };
        result.map_err(|err| self.fatal(err))
    }

    /// Mark the log closed and escalate an unrecoverable trim fault
    fn fatal(&self, err: Error) -> Error {
        if let Ok(mut state) = self.shared.guard.write() {
            *state = LogState::Closed;
        }
        tracing::error!(
            "Unrecoverable trim fault on replica {}: {} - requesting server shutdown",
            self.shared.server_id,
            err
        );
        self.shutdown.shutdown(ShutdownReason::FatalStorage);
        err
    }

    /// Discard the collected deletions
    pub fn abort(&mut self) {
        self.pending.clear();
    }
}
