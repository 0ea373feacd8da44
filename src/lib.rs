//! dirrepl - Replication core for a distributed directory service
//!
//! dirrepl is the server-side replication engine that keeps many directory
//! replicas consistent: a durable per-replica changelog with trimming and
//! cheap range counting, an in-memory pending-write queue with back-pressure,
//! cursors and a multi-log merge for catch-up reads, a per-suffix domain that
//! routes updates among connected peers, and an assured-replication
//! acknowledgment tracker (safe-read and safe-data modes) with timeouts.
//!
//! # Architecture
//!
//! Every change carries a CSN (change sequence number): a globally comparable
//! (time, sequence, replica id) triple. Each replica's changes are buffered in
//! a `PendingWriteQueue`, flushed and trimmed by a background `LogWriterTask`,
//! and stored in a `ReplicaLog` keyed by CSN. The `ReplicationDomain` fans
//! incoming updates out to all other connected peers, filtering on generation
//! id and peer status, and the `AssuredAckTracker` aggregates acknowledgments
//! for assured updates.
//!
//! # Features
//!
//! - Append-only changelog with embedded counter records for O(window) range
//!   counting
//! - Bounded pending-write queue with low/high watermark back-pressure
//! - Globally CSN-ordered catch-up streams merged across replica logs
//! - Generation-id and peer-status filtered fan-out per replicated suffix
//! - Safe-read / safe-data assured acknowledgment with timeout reporting

pub mod config;
pub mod error;
pub mod csn;
pub mod state;
pub mod changelog;
pub mod domain;
pub mod protocol;
pub mod shutdown;

pub use config::ReplicationConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ReplicationConfig;
    pub use crate::error::{Error, Result};
    pub use crate::csn::{Csn, CsnGenerator};
    pub use crate::state::ServerState;
    pub use crate::changelog::{ReplicaLog, PendingWriteQueue, LogWriterTask, CatchupIterator};
    pub use crate::domain::{ReplicationDomain, PeerStatus, AssuredAckTracker};
    pub use crate::protocol::Message;
    pub use crate::shutdown::ShutdownHandle;
}
