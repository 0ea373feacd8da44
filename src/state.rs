//! Server State
//!
//! A `ServerState` is the per-consumer vector clock of replication: for each
//! replica id, the latest CSN seen from that replica. Entries only ever
//! advance; an update with an older CSN is ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::csn::Csn;

/// Last CSN seen per replica
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerState {
    csns: HashMap<u32, Csn>,
}

impl ServerState {
    /// Create an empty server state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a CSN. Returns true if the entry advanced, false if the CSN
    /// was older than (or equal to) what is already recorded.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.server_id) {
            Some(existing) if *existing >= csn => false,
            _ => {
                self.csns.insert(csn.server_id, csn);
                true
            }
        }
    }

    /// The latest CSN seen from a replica, if any
    pub fn max_csn(&self, server_id: u32) -> Option<Csn> {
        self.csns.get(&server_id).copied()
    }

    /// Whether this state already covers the given change
    pub fn covers(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.server_id)
            .map(|seen| seen >= csn)
            .unwrap_or(false)
    }

    /// Iterate over (replica id, latest CSN) pairs
    pub fn iter(&self) -> impl Iterator<Item = (u32, Csn)> + '_ {
        self.csns.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Replica ids present in this state
    pub fn server_ids(&self) -> Vec<u32> {
        self.csns.keys().copied().collect()
    }

    /// Number of replicas tracked
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Whether no replica has been seen yet
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Fold another state into this one, keeping the max per replica
    pub fn merge(&mut self, other: &ServerState) {
        for (_, csn) in other.iter() {
            self.update(csn);
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<_> = self.csns.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        let parts: Vec<String> = entries
            .iter()
            .map(|(id, csn)| format!("{}:{}", id, csn))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_advances_only() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(100, 1, 1)));
        assert!(state.update(Csn::new(100, 2, 1)));
        // Older CSN for the same replica never regresses the entry
        assert!(!state.update(Csn::new(100, 1, 1)));
        assert!(!state.update(Csn::new(99, 9, 1)));
        assert_eq!(state.max_csn(1), Some(Csn::new(100, 2, 1)));
    }

    #[test]
    fn test_one_entry_per_replica() {
        let mut state = ServerState::new();
        state.update(Csn::new(100, 1, 1));
        state.update(Csn::new(100, 1, 2));
        state.update(Csn::new(200, 1, 1));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_covers() {
        let mut state = ServerState::new();
        state.update(Csn::new(100, 5, 1));
        assert!(state.covers(&Csn::new(100, 5, 1)));
        assert!(state.covers(&Csn::new(100, 4, 1)));
        assert!(!state.covers(&Csn::new(100, 6, 1)));
        assert!(!state.covers(&Csn::new(50, 0, 2)));
    }

    #[test]
    fn test_merge() {
        let mut a = ServerState::new();
        a.update(Csn::new(100, 1, 1));
        a.update(Csn::new(100, 1, 2));

        let mut b = ServerState::new();
        b.update(Csn::new(200, 1, 1));
        b.update(Csn::new(50, 1, 3));

        a.merge(&b);
        assert_eq!(a.max_csn(1), Some(Csn::new(200, 1, 1)));
        assert_eq!(a.max_csn(2), Some(Csn::new(100, 1, 2)));
        assert_eq!(a.max_csn(3), Some(Csn::new(50, 1, 3)));
    }
}
