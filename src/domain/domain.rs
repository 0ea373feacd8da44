//! Replication domain
//!
//! One domain per replicated suffix. The domain accepts updates from
//! connected peers, persists each one through the origin replica's pending
//! queue and changelog lane, fans it out to every other eligible peer, and
//! tracks assured acknowledgments. It also serves catch-up bursts for peers
//! whose live stream was pruned, and exposes a monitoring snapshot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::changelog::record::ChangeRecord;
use crate::changelog::{CatchupIterator, LogWriterTask, PendingWriteQueue, ReplicaLog};
use crate::config::ReplicationConfig;
use crate::csn::Csn;
use crate::error::{Error, Result};
use crate::protocol::{AssuredMode, ErrorCode, Message};
use crate::shutdown::ShutdownHandle;
use crate::state::ServerState;

use super::assured::{AckMode, AssuredAckTracker};
use super::peer::{PeerHandle, PeerInfo, PeerKind, PeerSession, PeerStatus};

/// Storage lane for one origin replica: its pending queue, changelog and
/// writer task
struct ReplicaLane {
    queue: Arc<PendingWriteQueue>,
    log: Arc<ReplicaLog>,
    writer: Option<LogWriterTask>,
}

struct DomainInner {
    /// Reference generation id; None until adopted from the first peer or
    /// set by an explicit reset
    generation_id: Option<i64>,
    /// An adopted id stays provisional until the first change enters the
    /// durable persist path; only a pinned reference flags mismatched peers
    generation_saved: bool,
    peers: HashMap<u32, Arc<PeerHandle>>,
    lanes: HashMap<u32, ReplicaLane>,
}

/// One catch-up burst served to a lagging consumer
pub struct CatchupBurst {
    /// CSN-ordered records the consumer has not seen
    pub records: Vec<ChangeRecord>,
    /// true once the stored logs are exhausted for this consumer's state;
    /// the consumer may switch back to following the live stream
    pub caught_up: bool,
}

/// Per-suffix update router with durable changelog lanes
pub struct ReplicationDomain {
    suffix: String,
    data_dir: PathBuf,
    config: ReplicationConfig,
    assured: AssuredAckTracker,
    shutdown: ShutdownHandle,
    inner: RwLock<DomainInner>,
}

impl ReplicationDomain {
    /// Create the domain for the configured suffix, preparing its data
    /// directory. Changelog lanes open lazily as origin replicas appear.
    pub fn new(config: ReplicationConfig, shutdown: ShutdownHandle) -> Result<Self> {
        let suffix = config.replica.suffix.clone();
        let data_dir = config.replica.data_dir.join(dir_name(&suffix));
        std::fs::create_dir_all(&data_dir)?;

        info!("Replication domain ready for suffix {}", suffix);

        Ok(Self {
            suffix,
            data_dir,
            assured: AssuredAckTracker::new(config.assured.timeout()),
            config,
            shutdown,
            inner: RwLock::new(DomainInner {
                generation_id: None,
                generation_saved: false,
                peers: HashMap::new(),
                lanes: HashMap::new(),
            }),
        })
    }

    /// The suffix this domain replicates
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Current reference generation id, if adopted
    pub async fn generation_id(&self) -> Option<i64> {
        self.inner.read().await.generation_id
    }

    /// Register a connected peer session
    ///
    /// The first peer that reports a generation id donates it as the domain
    /// reference. The reference stays provisional until the first change is
    /// durably persisted; once pinned, a later peer whose generation differs
    /// is kept connected but marked `BadGenerationId` and receives no live
    /// updates until an explicit generation reset. The updated topology is
    /// broadcast to every connected peer.
    pub async fn connect_peer(
        &self,
        mut info: PeerInfo,
        outbound: mpsc::Sender<Message>,
    ) -> Result<Arc<PeerHandle>> {
        let mut inner = self.inner.write().await;

        if inner.peers.contains_key(&info.server_id) {
            // Tell the rejected session why before the connection layer
            // tears it down
            let _ = outbound.try_send(Message::Error {
                code: ErrorCode::DuplicateServerId,
                message: format!(
                    "Server id {} is already connected to {}",
                    info.server_id, self.suffix
                ),
            });
            return Err(Error::DuplicateServerId {
                server_id: info.server_id,
                domain: self.suffix.clone(),
            });
        }

        match inner.generation_id {
            None => {
                inner.generation_id = Some(info.generation_id);
                debug!(
                    "Domain {} adopted provisional generation id {} from peer {}",
                    self.suffix, info.generation_id, info.server_id
                );
            }
            Some(local) if local != info.generation_id && inner.generation_saved => {
                warn!(
                    "Peer {} joins domain {} with generation {} (reference {}); \
                     marking BAD_GEN_ID",
                    info.server_id, self.suffix, info.generation_id, local
                );
                info.status = PeerStatus::BadGenerationId;
            }
            Some(local) if local != info.generation_id => {
                // Nothing persisted under the provisional reference yet, so
                // a disagreeing peer is tolerated until the first durable
                // change pins it
                debug!(
                    "Peer {} reports generation {} against unpinned reference {} \
                     in domain {}",
                    info.server_id, info.generation_id, local, self.suffix
                );
            }
            Some(_) => {}
        }

        info!(
            "Peer {} ({}) connected to domain {} with status {}",
            info.server_id, info.kind, self.suffix, info.status
        );

        let peer = Arc::new(PeerHandle::new(info.clone(), outbound));
        inner.peers.insert(info.server_id, Arc::clone(&peer));

        self.broadcast_topology(&inner).await;
        Ok(peer)
    }

    /// Remove a disconnected peer and settle any assured updates that were
    /// waiting on it
    pub async fn disconnect_peer(&self, server_id: u32) {
        let mut inner = self.inner.write().await;
        if inner.peers.remove(&server_id).is_none() {
            return;
        }
        info!("Peer {} disconnected from domain {}", server_id, self.suffix);

        self.assured.forget_server(server_id).await;
        self.broadcast_topology(&inner).await;
    }

    /// Accept an update from a connected peer: persist it through the origin
    /// replica's lane, fan it out, and register assured tracking if requested
    ///
    /// Updates from peers marked `BadGenerationId` are rejected; their
    /// dataset does not match the domain reference.
    pub async fn receive_update(
        &self,
        from: u32,
        csn: Csn,
        payload: Vec<u8>,
        assured: bool,
        assured_mode: AssuredMode,
        safe_data_level: u8,
    ) -> Result<()> {
        let inner = self.inner.read().await;
        let origin = inner
            .peers
            .get(&from)
            .cloned()
            .ok_or(Error::UnknownPeer(from))?;
        origin.record_received();

        if origin.status() == PeerStatus::BadGenerationId {
            let local = inner.generation_id.unwrap_or(-1);
            let _ = origin.send_live(Message::Error {
                code: ErrorCode::GenerationMismatch,
                message: format!(
                    "Update {} rejected: generation {} does not match reference {}",
                    csn,
                    origin.generation_id(),
                    local
                ),
            });
            return Err(Error::GenerationMismatch {
                peer: from,
                local,
                remote: origin.generation_id(),
            });
        }
        drop(inner);

        // Persist through the origin replica's lane before acknowledging
        // anything
        let queue = self.lane_queue(csn.server_id).await?;
        queue
            .enqueue(ChangeRecord::new(csn, payload.clone()))
            .await?;
        self.confirm_generation().await;

        let inner = self.inner.read().await;
        let msg = Message::Update {
            csn,
            payload,
            assured,
            assured_mode,
            safe_data_level,
        };

        let mut reached: Vec<Arc<PeerHandle>> = Vec::new();
        for (server_id, peer) in inner.peers.iter() {
            if *server_id == from || !fanout_eligible(peer) {
                continue;
            }
            if peer.is_following() {
                // A dead session must not fail the update for everyone else
                if let Err(e) = peer.send_live(msg.clone()) {
                    debug!("Fan-out to peer {} failed: {}", server_id, e);
                    continue;
                }
                reached.push(Arc::clone(peer));
            }
        }

        if assured {
            let expected = expected_ackers(&reached, assured_mode, self.config.assured.group_id);
            let mode = match assured_mode {
                AssuredMode::SafeRead => AckMode::SafeRead { expected },
                AssuredMode::SafeData => AckMode::SafeData {
                    level: safe_data_level,
                    expected,
                },
            };
            drop(inner);

            let (reply_tx, reply_rx) = oneshot::channel();
            self.assured.register(csn, mode, reply_tx).await;

            // Forward the final acknowledgment back to the originator
            tokio::spawn(async move {
                if let Ok(ack) = reply_rx.await {
                    if let Err(e) = origin.send(ack).await {
                        debug!("Could not deliver final ack for {}: {}", csn, e);
                    }
                }
            });
        }

        Ok(())
    }

    /// Pin the provisional generation reference once a change has entered
    /// the durable persist path
    async fn confirm_generation(&self) {
        if self.inner.read().await.generation_saved {
            return;
        }
        let mut inner = self.inner.write().await;
        if inner.generation_saved {
            return;
        }
        inner.generation_saved = true;
        if let Some(generation_id) = inner.generation_id {
            debug!(
                "Domain {} pinned generation id {} after the first persisted change",
                self.suffix, generation_id
            );
        }
    }

    /// Fold a peer acknowledgment into the assured tracker
    pub async fn receive_ack(
        &self,
        from: u32,
        csn: Csn,
        has_timeout: bool,
        has_wrong_status: bool,
        has_replay_error: bool,
        failed_servers: &[u32],
    ) -> Result<()> {
        {
            let inner = self.inner.read().await;
            if !inner.peers.contains_key(&from) {
                return Err(Error::UnknownPeer(from));
            }
        }
        self.assured
            .process_ack(
                csn,
                from,
                has_timeout,
                has_wrong_status,
                has_replay_error,
                failed_servers,
            )
            .await;
        Ok(())
    }

    /// Record a peer's announced status change and broadcast the new
    /// topology
    pub async fn receive_status_change(&self, server_id: u32, status: PeerStatus) -> Result<()> {
        let inner = self.inner.write().await;
        let Some(peer) = inner.peers.get(&server_id) else {
            return Err(Error::UnknownPeer(server_id));
        };

        info!(
            "Peer {} in domain {} changed status {} -> {}",
            server_id, self.suffix, peer.status(), status
        );
        peer.set_status(status);

        if status == PeerStatus::NotConnected || status == PeerStatus::FullUpdate {
            self.assured.forget_server(server_id).await;
        }

        self.broadcast_topology(&inner).await;
        Ok(())
    }

    /// Adopt a new reference generation id and propagate it to every peer
    ///
    /// Peers previously marked `BadGenerationId` whose generation matches
    /// the new reference return to `Normal`.
    pub async fn reset_generation_id(&self, generation_id: i64) {
        let mut inner = self.inner.write().await;
        info!(
            "Domain {} generation id reset to {}",
            self.suffix, generation_id
        );
        // An administrative reset is authoritative, not provisional
        inner.generation_id = Some(generation_id);
        inner.generation_saved = true;

        for peer in inner.peers.values() {
            if peer.status() == PeerStatus::BadGenerationId
                && peer.generation_id() == generation_id
            {
                peer.set_status(PeerStatus::Normal);
            }
            let _ = peer.send_live(Message::ResetGenerationId { generation_id });
        }
        self.broadcast_topology(&inner).await;
    }

    /// Serve one catch-up burst for a consumer that fell off the live stream
    ///
    /// `state` is the consumer's last-seen CSN per replica; it is advanced
    /// past every returned record. `caught_up` reports that the stored logs
    /// are drained for this state. The driver then calls `resume_following`
    /// and sweeps one more burst after the next flush interval: changes
    /// enqueued before the switch reach the logs by then, changes enqueued
    /// after it arrive live, and the consumer drops overlapping records by
    /// CSN.
    pub async fn catchup_burst(&self, state: &mut ServerState) -> Result<CatchupBurst> {
        let logs: Vec<Arc<ReplicaLog>> = {
            let inner = self.inner.read().await;
            inner.lanes.values().map(|l| Arc::clone(&l.log)).collect()
        };

        let mut iter = CatchupIterator::new(
            &logs,
            state,
            self.config.changelog.catchup_max_records,
            self.config.changelog.catchup_max_bytes,
        )?;

        let mut records = Vec::new();
        while let Some(record) = iter.next()? {
            state.update(record.csn);
            records.push(record);
        }

        Ok(CatchupBurst {
            caught_up: !iter.budget_exhausted(),
            records,
        })
    }

    /// Flip a caught-up peer back onto the live stream
    pub async fn resume_following(&self, server_id: u32) -> Result<()> {
        let inner = self.inner.read().await;
        let peer = inner
            .peers
            .get(&server_id)
            .ok_or(Error::UnknownPeer(server_id))?;
        peer.set_following(true);
        debug!(
            "Peer {} resumed following in domain {}",
            server_id, self.suffix
        );
        Ok(())
    }

    /// Monitoring snapshot of the domain
    pub async fn monitor(&self) -> Result<DomainMonitor> {
        let inner = self.inner.read().await;

        let mut replicas = Vec::with_capacity(inner.lanes.len());
        for (server_id, lane) in inner.lanes.iter() {
            replicas.push(ReplicaMonitor {
                server_id: *server_id,
                first_csn: lane.log.read_first()?.map(|c| c.to_string()),
                last_csn: lane.log.read_last()?.map(|c| c.to_string()),
                record_count: lane.log.record_count()?,
                queue_records: lane.queue.len().await,
                queue_bytes: lane.queue.bytes().await,
                queue_saturated: lane.queue.above_high_mark().await,
            });
        }
        replicas.sort_by_key(|r| r.server_id);

        let mut peers: Vec<PeerMonitor> = inner
            .peers
            .values()
            .map(|p| PeerMonitor {
                server_id: p.server_id(),
                kind: p.kind().to_string(),
                status: p.status().to_string(),
                generation_id: p.generation_id(),
                following: p.is_following(),
                connected_at: p.connected_at().to_rfc3339(),
                updates_sent: p.sent_count(),
                updates_received: p.received_count(),
            })
            .collect();
        peers.sort_by_key(|p| p.server_id);

        Ok(DomainMonitor {
            suffix: self.suffix.clone(),
            generation_id: inner.generation_id,
            outstanding_acks: self.assured.outstanding_count().await,
            replicas,
            peers,
        })
    }

    /// Stop every writer task (final flush included) and close the logs
    pub async fn shutdown(&self) {
        info!("Shutting down replication domain {}", self.suffix);
        let mut inner = self.inner.write().await;

        for lane in inner.lanes.values() {
            lane.queue.wake_all();
        }
        for lane in inner.lanes.values_mut() {
            if let Some(writer) = lane.writer.take() {
                writer.stop().await;
            }
            if let Err(e) = lane.log.shutdown() {
                warn!("Changelog close failed during shutdown: {}", e);
            }
        }
        inner.peers.clear();
    }

    /// Get or lazily open the storage lane for an origin replica
    async fn lane_queue(&self, origin_id: u32) -> Result<Arc<PendingWriteQueue>> {
        {
            let inner = self.inner.read().await;
            if let Some(lane) = inner.lanes.get(&origin_id) {
                return Ok(Arc::clone(&lane.queue));
            }
        }

        let mut inner = self.inner.write().await;
        // Raced with another opener
        if let Some(lane) = inner.lanes.get(&origin_id) {
            return Ok(Arc::clone(&lane.queue));
        }

        debug!(
            "Opening changelog lane for replica {} in domain {}",
            origin_id, self.suffix
        );
        let log = Arc::new(ReplicaLog::open(
            &self.data_dir,
            origin_id,
            &self.config.changelog,
            self.shutdown.clone(),
        )?);
        let queue = Arc::new(PendingWriteQueue::new(
            &self.config.queue,
            self.shutdown.clone(),
        ));
        let writer = LogWriterTask::spawn(
            Arc::clone(&queue),
            Arc::clone(&log),
            self.config.changelog.clone(),
            self.shutdown.clone(),
        );

        inner.lanes.insert(
            origin_id,
            ReplicaLane {
                queue: Arc::clone(&queue),
                log,
                writer: Some(writer),
            },
        );
        Ok(queue)
    }

    async fn broadcast_topology(&self, inner: &DomainInner) {
        let peers: Vec<PeerInfo> = inner.peers.values().map(|p| p.info()).collect();
        let msg = Message::TopologyInfo { peers };
        for peer in inner.peers.values() {
            let _ = peer.send_live(msg.clone());
        }
    }
}

/// Whether a peer may receive live updates at all
fn fanout_eligible(peer: &PeerHandle) -> bool {
    match peer.status() {
        PeerStatus::BadGenerationId | PeerStatus::NotConnected => false,
        // A directory server being bulk-initialized must not interleave
        // live changes with its import
        PeerStatus::FullUpdate => peer.kind() != PeerKind::DirectoryServer,
        PeerStatus::Normal | PeerStatus::Degraded => true,
    }
}

/// Peers whose acknowledgment counts toward the assured requirement
fn expected_ackers(
    reached: &[Arc<PeerHandle>],
    mode: AssuredMode,
    group_id: u8,
) -> HashSet<u32> {
    reached
        .iter()
        .filter(|p| p.status() == PeerStatus::Normal)
        .filter(|p| match mode {
            // Safe-read: every normal peer of the local group must replay
            AssuredMode::SafeRead => p.group_id() == group_id,
            // Safe-data: only replication-server relays can vouch for
            // durability
            AssuredMode::SafeData => p.kind() == PeerKind::ReplicationServer,
        })
        .map(|p| p.server_id())
        .collect()
}

fn dir_name(suffix: &str) -> String {
    suffix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Monitoring snapshot of one domain, serializable to JSON
#[derive(Debug, Serialize)]
pub struct DomainMonitor {
    pub suffix: String,
    pub generation_id: Option<i64>,
    pub outstanding_acks: usize,
    pub replicas: Vec<ReplicaMonitor>,
    pub peers: Vec<PeerMonitor>,
}

#[derive(Debug, Serialize)]
pub struct ReplicaMonitor {
    pub server_id: u32,
    pub first_csn: Option<String>,
    pub last_csn: Option<String>,
    pub record_count: u64,
    pub queue_records: usize,
    pub queue_bytes: usize,
    /// true once the pending queue crosses its high watermark
    pub queue_saturated: bool,
}

#[derive(Debug, Serialize)]
pub struct PeerMonitor {
    pub server_id: u32,
    pub kind: String,
    pub status: String,
    pub generation_id: i64,
    pub following: bool,
    pub connected_at: String,
    pub updates_sent: u64,
    pub updates_received: u64,
}

impl DomainMonitor {
    /// Render the snapshot as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> ReplicationConfig {
        let mut config = ReplicationConfig::from_toml_str(
            r#"
            [replica]
            server_id = 1
            suffix = "dc=example,dc=com"

            [changelog]
            # Retention off: tests stamp small synthetic timestamps that an
            # age-based trim would purge immediately
            purge_delay_secs = 0
            counter_window_size = 10
            flush_interval_ms = 20
            compression = false

            [assured]
            timeout_ms = 200
        "#,
        )
        .unwrap();
        config.replica.data_dir = dir.to_path_buf();
        config
    }

    fn info(server_id: u32, kind: PeerKind, generation_id: i64) -> PeerInfo {
        PeerInfo {
            server_id,
            kind,
            group_id: 1,
            generation_id,
            status: PeerStatus::Normal,
        }
    }

    async fn domain(dir: &std::path::Path) -> ReplicationDomain {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        ReplicationDomain::new(config(dir), ShutdownHandle::new()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_server_id_is_rejected() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let err = domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateServerId { server_id: 2, .. }));

        // The rejected session is told why
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::Error {
                code: ErrorCode::DuplicateServerId,
                ..
            })
        ));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_peer_donates_generation_id() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;
        assert_eq!(domain.generation_id().await, None);

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 99), tx)
            .await
            .unwrap();
        assert_eq!(domain.generation_id().await, Some(99));

        // The reference is provisional: with nothing persisted yet, a
        // disagreeing peer is tolerated
        let (tx, _rx) = mpsc::channel(8);
        let peer = domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 42), tx)
            .await
            .unwrap();
        assert_eq!(peer.status(), PeerStatus::Normal);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_generation_pins_after_first_persisted_change() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 99), tx)
            .await
            .unwrap();

        // First persisted change pins the reference
        domain
            .receive_update(
                2,
                Csn::new(1, 1, 2),
                b"first".to_vec(),
                false,
                AssuredMode::SafeData,
                1,
            )
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let peer = domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 42), tx)
            .await
            .unwrap();
        assert_eq!(peer.status(), PeerStatus::BadGenerationId);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_fans_out_to_other_peers_only() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, mut rx3) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx2)
            .await
            .unwrap();
        domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 7), tx3)
            .await
            .unwrap();
        // Drain the topology broadcasts
        while rx2.try_recv().is_ok() {}
        while rx3.try_recv().is_ok() {}

        let csn = Csn::new(1000, 1, 2);
        domain
            .receive_update(2, csn, b"change".to_vec(), false, AssuredMode::SafeData, 1)
            .await
            .unwrap();

        // Only peer 3 sees the update
        match rx3.try_recv() {
            Ok(Message::Update { csn: got, .. }) => assert_eq!(got, csn),
            other => panic!("Expected update at peer 3, got {:?}", other.map(|m| m.type_name().to_string())),
        }
        assert!(rx2.try_recv().is_err());
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_from_bad_generation_peer_is_rejected() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx)
            .await
            .unwrap();
        domain
            .receive_update(
                2,
                Csn::new(1, 1, 2),
                vec![],
                false,
                AssuredMode::SafeData,
                1,
            )
            .await
            .unwrap();

        // Reference 7 is now pinned; peer 3 arrives with generation 8
        let (tx, mut rx) = mpsc::channel(8);
        domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 8), tx)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        let err = domain
            .receive_update(
                3,
                Csn::new(2, 1, 3),
                vec![],
                false,
                AssuredMode::SafeData,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationMismatch { peer: 3, .. }));
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::Error {
                code: ErrorCode::GenerationMismatch,
                ..
            })
        ));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_generation_reset_rehabilitates_matching_peer() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx)
            .await
            .unwrap();
        domain
            .receive_update(
                2,
                Csn::new(1, 1, 2),
                vec![],
                false,
                AssuredMode::SafeData,
                1,
            )
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let peer = domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 42), tx)
            .await
            .unwrap();
        assert_eq!(peer.status(), PeerStatus::BadGenerationId);

        domain.reset_generation_id(42).await;
        assert_eq!(domain.generation_id().await, Some(42));

        let monitor = domain.monitor().await.unwrap();
        let peer3 = monitor.peers.iter().find(|p| p.server_id == 3).unwrap();
        assert_eq!(peer3.status, "NORMAL");
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_catchup_burst_reports_caught_up() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(64);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx)
            .await
            .unwrap();

        for seq in 1..=5 {
            domain
                .receive_update(
                    2,
                    Csn::new(1000 + seq as u64, seq, 2),
                    vec![seq as u8],
                    false,
                    AssuredMode::SafeData,
                    1,
                )
                .await
                .unwrap();
        }

        // Wait for the writer to flush the lane
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let monitor = domain.monitor().await.unwrap();
            if monitor.replicas.first().map(|r| r.record_count) == Some(5) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "Flush timed out");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut state = ServerState::new();
        let burst = domain.catchup_burst(&mut state).await.unwrap();
        assert_eq!(burst.records.len(), 5);
        assert!(burst.caught_up);
        assert_eq!(state.max_csn(2), Some(Csn::new(1005, 5, 2)));

        // Nothing further once the state covers everything
        let burst = domain.catchup_burst(&mut state).await.unwrap();
        assert!(burst.records.is_empty());
        assert!(burst.caught_up);
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_assured_safe_data_ack_round_trip() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        // Originating directory server and two relays
        let (tx_ds, mut rx_ds) = mpsc::channel(16);
        let (tx_r1, mut rx_r1) = mpsc::channel(16);
        let (tx_r2, mut rx_r2) = mpsc::channel(16);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx_ds)
            .await
            .unwrap();
        domain
            .connect_peer(info(10, PeerKind::ReplicationServer, 7), tx_r1)
            .await
            .unwrap();
        domain
            .connect_peer(info(11, PeerKind::ReplicationServer, 7), tx_r2)
            .await
            .unwrap();
        while rx_ds.try_recv().is_ok() {}
        while rx_r1.try_recv().is_ok() {}
        while rx_r2.try_recv().is_ok() {}

        let csn = Csn::new(2000, 1, 2);
        domain
            .receive_update(2, csn, b"assured".to_vec(), true, AssuredMode::SafeData, 2)
            .await
            .unwrap();
        assert!(matches!(rx_r1.try_recv(), Ok(Message::Update { .. })));
        assert!(matches!(rx_r2.try_recv(), Ok(Message::Update { .. })));

        // Level 2 wants one relay; a single ack settles the update
        domain
            .receive_ack(10, csn, false, false, false, &[])
            .await
            .unwrap();

        let ack = tokio::time::timeout(std::time::Duration::from_secs(1), rx_ds.recv())
            .await
            .expect("Originator must get the final ack")
            .unwrap();
        match ack {
            Message::Ack {
                csn: got,
                has_timeout,
                failed_servers,
                ..
            } => {
                assert_eq!(got, csn);
                assert!(!has_timeout);
                assert!(failed_servers.is_empty());
            }
            other => panic!("Expected ack, got {}", other.type_name()),
        }
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_assured_timeout_reports_silent_relay() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx_ds, mut rx_ds) = mpsc::channel(16);
        let (tx_r1, _rx_r1) = mpsc::channel(16);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx_ds)
            .await
            .unwrap();
        domain
            .connect_peer(info(10, PeerKind::ReplicationServer, 7), tx_r1)
            .await
            .unwrap();
        while rx_ds.try_recv().is_ok() {}

        let csn = Csn::new(3000, 1, 2);
        domain
            .receive_update(2, csn, b"assured".to_vec(), true, AssuredMode::SafeData, 2)
            .await
            .unwrap();

        // Relay 10 never acks; the 200ms timeout settles the update
        let ack = tokio::time::timeout(std::time::Duration::from_secs(2), rx_ds.recv())
            .await
            .expect("Timeout ack must arrive")
            .unwrap();
        match ack {
            Message::Ack {
                has_timeout,
                failed_servers,
                ..
            } => {
                assert!(has_timeout);
                assert_eq!(failed_servers, vec![10]);
            }
            other => panic!("Expected ack, got {}", other.type_name()),
        }
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_update_directory_server_excluded_from_fanout() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx2, _rx2) = mpsc::channel(16);
        let (tx3, mut rx3) = mpsc::channel(16);
        let (tx4, mut rx4) = mpsc::channel(16);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx2)
            .await
            .unwrap();
        domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 7), tx3)
            .await
            .unwrap();
        domain
            .connect_peer(info(4, PeerKind::ReplicationServer, 7), tx4)
            .await
            .unwrap();

        // Both targets enter bulk initialization
        domain
            .receive_status_change(3, PeerStatus::FullUpdate)
            .await
            .unwrap();
        domain
            .receive_status_change(4, PeerStatus::FullUpdate)
            .await
            .unwrap();
        while rx3.try_recv().is_ok() {}
        while rx4.try_recv().is_ok() {}

        let csn = Csn::new(500, 1, 2);
        domain
            .receive_update(2, csn, b"change".to_vec(), false, AssuredMode::SafeData, 1)
            .await
            .unwrap();

        // An importing directory server must not interleave live changes
        assert!(rx3.try_recv().is_err());
        // A relay keeps forwarding during its full update
        assert!(matches!(rx4.try_recv(), Ok(Message::Update { .. })));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_safe_read_excludes_degraded_and_foreign_group() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx_ds, mut rx_ds) = mpsc::channel(16);
        let (tx3, mut rx3) = mpsc::channel(16);
        let (tx4, mut rx4) = mpsc::channel(16);
        let (tx5, mut rx5) = mpsc::channel(16);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx_ds)
            .await
            .unwrap();
        domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 7), tx3)
            .await
            .unwrap();
        domain
            .connect_peer(info(4, PeerKind::DirectoryServer, 7), tx4)
            .await
            .unwrap();
        let mut other_group = info(5, PeerKind::DirectoryServer, 7);
        other_group.group_id = 2;
        domain.connect_peer(other_group, tx5).await.unwrap();

        domain
            .receive_status_change(4, PeerStatus::Degraded)
            .await
            .unwrap();
        while rx_ds.try_recv().is_ok() {}
        while rx3.try_recv().is_ok() {}
        while rx4.try_recv().is_ok() {}
        while rx5.try_recv().is_ok() {}

        let csn = Csn::new(4000, 1, 2);
        domain
            .receive_update(2, csn, b"assured".to_vec(), true, AssuredMode::SafeRead, 1)
            .await
            .unwrap();

        // Degraded and foreign-group peers still receive the change
        assert!(matches!(rx3.try_recv(), Ok(Message::Update { .. })));
        assert!(matches!(rx4.try_recv(), Ok(Message::Update { .. })));
        assert!(matches!(rx5.try_recv(), Ok(Message::Update { .. })));

        // Only peer 3 counts toward safe-read; its ack alone settles the
        // update with no failures reported
        domain
            .receive_ack(3, csn, false, false, false, &[])
            .await
            .unwrap();

        let ack = tokio::time::timeout(std::time::Duration::from_secs(1), rx_ds.recv())
            .await
            .expect("Final ack must arrive")
            .unwrap();
        match ack {
            Message::Ack {
                csn: got,
                has_timeout,
                failed_servers,
                ..
            } => {
                assert_eq!(got, csn);
                assert!(!has_timeout);
                assert!(failed_servers.is_empty());
            }
            other => panic!("Expected ack, got {}", other.type_name()),
        }
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_change_updates_peer_and_broadcasts() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx2, mut rx2) = mpsc::channel(16);
        let (tx3, _rx3) = mpsc::channel(16);
        domain
            .connect_peer(info(2, PeerKind::DirectoryServer, 7), tx2)
            .await
            .unwrap();
        domain
            .connect_peer(info(3, PeerKind::DirectoryServer, 7), tx3)
            .await
            .unwrap();
        while rx2.try_recv().is_ok() {}

        domain
            .receive_status_change(3, PeerStatus::Degraded)
            .await
            .unwrap();

        // Peer 2 sees the new topology with peer 3 degraded
        let mut saw_degraded = false;
        while let Ok(msg) = rx2.try_recv() {
            if let Message::TopologyInfo { peers } = msg {
                saw_degraded |= peers
                    .iter()
                    .any(|p| p.server_id == 3 && p.status == PeerStatus::Degraded);
            }
        }
        assert!(saw_degraded, "Status change must be broadcast");

        let monitor = domain.monitor().await.unwrap();
        let peer3 = monitor.peers.iter().find(|p| p.server_id == 3).unwrap();
        assert_eq!(peer3.status, "DEGRADED");

        assert!(matches!(
            domain.receive_status_change(99, PeerStatus::Normal).await,
            Err(Error::UnknownPeer(99))
        ));
        domain.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitor_snapshot_serializes() {
        let dir = tempdir().unwrap();
        let domain = domain(dir.path()).await;

        let (tx, _rx) = mpsc::channel(8);
        domain
            .connect_peer(info(4, PeerKind::ReplicationServer, 7), tx)
            .await
            .unwrap();

        let monitor = domain.monitor().await.unwrap();
        let json = monitor.to_json().unwrap();
        assert!(json.contains("dc_example_dc_com") || json.contains("dc=example,dc=com"));
        assert!(json.contains("\"server_id\": 4"));
        domain.shutdown().await;
    }
}
