//! Changelog storage engine
//!
//! Durable per-replica change logs with embedded counter records, the
//! bounded pending-write queue feeding them, the background flush/trim
//! writer task, and cursors plus a multi-log merge for catch-up reads.

pub mod record;
mod journal;
mod log;
mod cursor;
mod queue;
mod writer;
mod merge;

pub use record::{ChangeRecord, LogValue};
pub use journal::Journal;
pub use log::ReplicaLog;
pub use cursor::{DeleteCursor, LogCursor};
pub use queue::PendingWriteQueue;
pub use writer::LogWriterTask;
pub use merge::CatchupIterator;
