//! Peer sessions
//!
//! A peer is a connected directory server or replication server. The
//! connection layer owns the session and its transport; the domain holds a
//! non-owning handle around the session's outbound channel, plus the peer's
//! status state machine and following/catching-up flag.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Status of a peer within a replication domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Peer is connected and up to date
    Normal,
    /// Peer is connected but lagging; excluded from assured expectations
    Degraded,
    /// Peer's dataset generation does not match the domain reference;
    /// live replication to it is disabled until resolved
    BadGenerationId,
    /// Directory server being bulk-initialized; must not receive live changes
    FullUpdate,
    /// Peer is not connected
    NotConnected,
}

impl PeerStatus {
    fn as_u8(self) -> u8 {
        match self {
            PeerStatus::Normal => 0,
            PeerStatus::Degraded => 1,
            PeerStatus::BadGenerationId => 2,
            PeerStatus::FullUpdate => 3,
            PeerStatus::NotConnected => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerStatus::Normal,
            1 => PeerStatus::Degraded,
            2 => PeerStatus::BadGenerationId,
            3 => PeerStatus::FullUpdate,
            _ => PeerStatus::NotConnected,
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Normal => write!(f, "NORMAL"),
            PeerStatus::Degraded => write!(f, "DEGRADED"),
            PeerStatus::BadGenerationId => write!(f, "BAD_GEN_ID"),
            PeerStatus::FullUpdate => write!(f, "FULL_UPDATE"),
            PeerStatus::NotConnected => write!(f, "NOT_CONNECTED"),
        }
    }
}

/// Kind of peer in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    /// A directory server replica
    DirectoryServer,
    /// A replication server relay
    ReplicationServer,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::DirectoryServer => write!(f, "DS"),
            PeerKind::ReplicationServer => write!(f, "RS"),
        }
    }
}

/// Peer identity and state as carried in topology messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique server id in the topology
    pub server_id: u32,
    /// Directory server or replication server
    pub kind: PeerKind,
    /// Assured-replication group this peer belongs to
    pub group_id: u8,
    /// Dataset generation fingerprint reported by the peer
    pub generation_id: i64,
    /// Current status
    pub status: PeerStatus,
}

/// The domain-facing surface of a connected peer session
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// The peer's server id
    fn server_id(&self) -> u32;

    /// Queue a message for delivery to the peer
    async fn send(&self, msg: Message) -> Result<()>;
}

/// Non-owning handle to a connected peer
///
/// The outbound channel belongs to the connection layer's writer task; the
/// handle queues messages into it without blocking the domain. A full
/// outbound queue flips the peer out of following mode so the domain
/// rebuilds its stream through the catch-up iterator instead.
#[derive(Debug)]
pub struct PeerHandle {
    identity: PeerInfo,
    outbound: mpsc::Sender<Message>,
    connected_at: chrono::DateTime<chrono::Utc>,
    status: AtomicU8,
    /// true = following the live queue, false = catching up from the logs
    following: AtomicBool,
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
}

impl PeerHandle {
    /// Wrap a connection-layer outbound channel
    pub fn new(info: PeerInfo, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            status: AtomicU8::new(info.status.as_u8()),
            identity: info,
            outbound,
            connected_at: chrono::Utc::now(),
            following: AtomicBool::new(true),
            updates_sent: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
        }
    }

    /// When this session was registered with the domain
    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// Identity snapshot carrying the current status
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            status: self.status(),
            ..self.identity.clone()
        }
    }

    pub fn kind(&self) -> PeerKind {
        self.identity.kind
    }

    pub fn group_id(&self) -> u8 {
        self.identity.group_id
    }

    pub fn generation_id(&self) -> i64 {
        self.identity.generation_id
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: PeerStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Queue a live update; a full outbound queue demotes the peer to
    /// catching-up rather than blocking the router
    pub fn send_live(&self, msg: Message) -> Result<()> {
        match self.outbound.try_send(msg) {
            Ok(()) => {
                self.updates_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.following.swap(false, Ordering::SeqCst) {
                    tracing::warn!(
                        "Outbound queue full for peer {}; switching to catch-up",
                        self.identity.server_id
                    );
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::UnknownPeer(self.identity.server_id))
            }
        }
    }

    /// Whether the peer reads live from the pending queue
    pub fn is_following(&self) -> bool {
        self.following.load(Ordering::SeqCst)
    }

    /// Flip the following/catching-up flag
    pub fn set_following(&self, following: bool) {
        self.following.store(following, Ordering::SeqCst);
    }

    /// Count one received update
    pub fn record_received(&self) {
        self.updates_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Updates queued toward this peer
    pub fn sent_count(&self) -> u64 {
        self.updates_sent.load(Ordering::Relaxed)
    }

    /// Updates received from this peer
    pub fn received_count(&self) -> u64 {
        self.updates_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerSession for PeerHandle {
    fn server_id(&self) -> u32 {
        self.identity.server_id
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::UnknownPeer(self.identity.server_id))?;
        self.updates_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;

    fn info(server_id: u32) -> PeerInfo {
        PeerInfo {
            server_id,
            kind: PeerKind::DirectoryServer,
            group_id: 1,
            generation_id: 42,
            status: PeerStatus::Normal,
        }
    }

    #[tokio::test]
    async fn test_send_live_counts() {
        let (tx, mut rx) = mpsc::channel(4);
        let peer = PeerHandle::new(info(3), tx);

        peer.send_live(Message::update(Csn::new(1, 1, 1), vec![])).unwrap();
        peer.send_live(Message::update(Csn::new(1, 2, 1), vec![])).unwrap();

        assert_eq!(peer.sent_count(), 2);
        assert!(matches!(rx.recv().await, Some(Message::Update { .. })));
    }

    #[tokio::test]
    async fn test_full_outbound_demotes_to_catchup() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerHandle::new(info(4), tx);
        assert!(peer.is_following());

        peer.send_live(Message::update(Csn::new(1, 1, 1), vec![])).unwrap();
        // Queue of one is now full; the next live send demotes the peer
        peer.send_live(Message::update(Csn::new(1, 2, 1), vec![])).unwrap();

        assert!(!peer.is_following());
        assert_eq!(peer.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_outbound_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let peer = PeerHandle::new(info(5), tx);
        assert!(matches!(
            peer.send_live(Message::update(Csn::new(1, 1, 1), vec![])),
            Err(Error::UnknownPeer(5))
        ));
    }

    #[test]
    fn test_status_transitions_are_visible_in_info() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerHandle::new(info(6), tx);
        assert_eq!(peer.status(), PeerStatus::Normal);

        peer.set_status(PeerStatus::Degraded);
        assert_eq!(peer.info().status, PeerStatus::Degraded);
        peer.set_status(PeerStatus::BadGenerationId);
        assert_eq!(peer.info().status, PeerStatus::BadGenerationId);
    }
}
