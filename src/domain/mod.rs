//! Per-suffix replication domains
//!
//! The domain layer sits between the connection layer and the changelog
//! engine: peer sessions and their statuses, the update fan-out router,
//! and assured-acknowledgment tracking.

pub mod peer;
mod assured;
#[allow(clippy::module_inception)]
mod domain;

pub use assured::{AckMode, AssuredAckTracker, RegisterOutcome};
pub use domain::{CatchupBurst, DomainMonitor, PeerMonitor, ReplicaMonitor, ReplicationDomain};
pub use peer::{PeerHandle, PeerInfo, PeerKind, PeerSession, PeerStatus};
