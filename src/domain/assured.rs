//! Assured replication acknowledgment tracking
//!
//! An assured update is not considered delivered until enough peers have
//! acknowledged it. The tracker holds one entry per outstanding update CSN,
//! merges partial acknowledgments into it, and releases the originator's
//! final acknowledgment on completion or on timeout. Whichever comes first
//! wins; the loser finds the entry gone and does nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::csn::Csn;
use crate::protocol::Message;

/// Acknowledgment requirement for one assured update
#[derive(Debug, Clone)]
pub enum AckMode {
    /// Every server in the expected set must acknowledge
    SafeRead { expected: HashSet<u32> },
    /// `level` servers (counting the local one) must hold the change;
    /// `expected` is the set of eligible relays that may contribute
    SafeData { level: u8, expected: HashSet<u32> },
}

/// Outcome of registering an assured update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Requirement already satisfied; the final ack was sent at once
    Immediate,
    /// Waiting on peer acknowledgments
    Pending,
}

struct AckEntry {
    /// Expected servers that have not acknowledged yet
    remaining: HashSet<u32>,
    /// Further acknowledgments required before completion
    acks_needed: usize,
    has_timeout: bool,
    has_wrong_status: bool,
    has_replay_error: bool,
    failed_servers: Vec<u32>,
    reply: Option<oneshot::Sender<Message>>,
}

impl AckEntry {
    fn final_ack(&mut self, csn: Csn) -> Message {
        Message::Ack {
            csn,
            has_timeout: self.has_timeout,
            has_wrong_status: self.has_wrong_status,
            has_replay_error: self.has_replay_error,
            failed_servers: std::mem::take(&mut self.failed_servers),
        }
    }
}

/// Tracks outstanding assured updates for one replication domain
#[derive(Clone)]
pub struct AssuredAckTracker {
    entries: Arc<Mutex<HashMap<Csn, AckEntry>>>,
    timeout: Duration,
}

impl AssuredAckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register an assured update and arm its timeout
    ///
    /// In safe-data mode a level that exceeds the eligible relay count is
    /// downgraded to what the topology can actually deliver, so the
    /// originator is never left waiting for acknowledgments that cannot
    /// arrive. Level 1 (or an empty expected set) completes immediately.
    pub async fn register(
        &self,
        csn: Csn,
        mode: AckMode,
        reply: oneshot::Sender<Message>,
    ) -> RegisterOutcome {
        let (expected, acks_needed) = match mode {
            AckMode::SafeRead { expected } => {
                let needed = expected.len();
                (expected, needed)
            }
            AckMode::SafeData { level, expected } => {
                let wanted = usize::from(level.saturating_sub(1));
                if wanted > expected.len() {
                    warn!(
                        "Safe-data level {} exceeds {} eligible relays for {}; downgrading",
                        level,
                        expected.len(),
                        csn
                    );
                }
                let needed = wanted.min(expected.len());
                (expected, needed)
            }
        };

        if acks_needed == 0 {
            let _ = reply.send(Message::ack(csn));
            return RegisterOutcome::Immediate;
        }

        let mut entries = self.entries.lock().await;
        entries.insert(
            csn,
            AckEntry {
                remaining: expected,
                acks_needed,
                has_timeout: false,
                has_wrong_status: false,
                has_replay_error: false,
                failed_servers: Vec::new(),
                reply: Some(reply),
            },
        );
        drop(entries);

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.timeout).await;
            tracker.expire(csn).await;
        });

        RegisterOutcome::Pending
    }

    /// Fold one peer acknowledgment into the matching entry
    ///
    /// Acks for completed or unknown CSNs are ignored; so are duplicate
    /// acks from the same server.
    pub async fn process_ack(
        &self,
        csn: Csn,
        from: u32,
        has_timeout: bool,
        has_wrong_status: bool,
        has_replay_error: bool,
        failed_servers: &[u32],
    ) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&csn) else {
            debug!("Ignoring ack from {} for settled update {}", from, csn);
            return;
        };
        if !entry.remaining.remove(&from) {
            return;
        }

        entry.has_timeout |= has_timeout;
        entry.has_wrong_status |= has_wrong_status;
        entry.has_replay_error |= has_replay_error;
        if has_timeout || has_wrong_status || has_replay_error {
            entry.failed_servers.push(from);
        }
        for failed in failed_servers {
            if !entry.failed_servers.contains(failed) {
                entry.failed_servers.push(*failed);
            }
        }
        entry.acks_needed = entry.acks_needed.saturating_sub(1);

        if entry.acks_needed == 0 {
            if let Some(mut entry) = entries.remove(&csn) {
                let ack = entry.final_ack(csn);
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(ack);
                }
            }
        }
    }

    /// Settle an entry whose timeout fired before completion
    ///
    /// Servers still in the remaining set are reported as failed.
    async fn expire(&self, csn: Csn) {
        let mut entries = self.entries.lock().await;
        let Some(mut entry) = entries.remove(&csn) else {
            return;
        };
        drop(entries);

        warn!(
            "Assured update {} timed out waiting on {} peer(s)",
            csn,
            entry.remaining.len()
        );
        entry.has_timeout = true;
        let mut silent: Vec<u32> = entry.remaining.iter().copied().collect();
        silent.sort_unstable();
        for server_id in silent {
            if !entry.failed_servers.contains(&server_id) {
                entry.failed_servers.push(server_id);
            }
        }
        let ack = entry.final_ack(csn);
        if let Some(reply) = entry.reply.take() {
            let _ = reply.send(ack);
        }
    }

    /// Drop an expected server from every outstanding entry, completing
    /// entries that were only waiting on it
    pub async fn forget_server(&self, server_id: u32) {
        let mut entries = self.entries.lock().await;
        let mut settled = Vec::new();
        for (csn, entry) in entries.iter_mut() {
            if entry.remaining.remove(&server_id) {
                entry.has_timeout = true;
                if !entry.failed_servers.contains(&server_id) {
                    entry.failed_servers.push(server_id);
                }
                entry.acks_needed = entry.acks_needed.saturating_sub(1);
                if entry.acks_needed == 0 {
                    settled.push(*csn);
                }
            }
        }
        for csn in settled {
            if let Some(mut entry) = entries.remove(&csn) {
                let ack = entry.final_ack(csn);
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(ack);
                }
            }
        }
    }

    /// Assured updates still waiting on acknowledgments
    pub async fn outstanding_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
