//! Replication Protocol
//!
//! Defines the update-path messages exchanged between directory-server and
//! replication-server peers. Session handshake and transport framing beyond
//! the length/checksum header are owned by the connection layer.

use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use crate::domain::peer::{PeerInfo, PeerStatus};

/// Assured-replication mode carried on an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Every eligible peer must acknowledge
    SafeRead,
    /// A numeric quorum of acknowledgments suffices
    SafeData,
}

/// Protocol messages for the replication update path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A replicated change fanned out across the topology
    Update {
        csn: Csn,
        /// Opaque serialized update payload
        payload: Vec<u8>,
        /// Whether the sender waits for acknowledgment
        assured: bool,
        assured_mode: AssuredMode,
        /// Acknowledgments required for safe-data mode (1 = local only)
        safe_data_level: u8,
    },

    /// Acknowledgment for an assured update
    Ack {
        csn: Csn,
        /// Set when the acknowledgment timed out before completion
        has_timeout: bool,
        /// Set when a peer could not accept the update due to its status
        has_wrong_status: bool,
        /// Set when a peer failed to replay the update
        has_replay_error: bool,
        /// Peers that never acknowledged (or reported an error) in time
        failed_servers: Vec<u32>,
    },

    /// A peer announces its own status change
    StatusChange {
        server_id: u32,
        status: PeerStatus,
    },

    /// Topology view broadcast when peers connect, disconnect or change
    TopologyInfo {
        peers: Vec<PeerInfo>,
    },

    /// Reset the domain's reference generation id
    ResetGenerationId {
        generation_id: i64,
    },

    /// Error reply for a protocol-level inconsistency
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A peer with the same server id is already connected
    DuplicateServerId,
    /// The destination peer is unknown to this domain
    UnknownPeer,
    /// Generation id does not match the domain reference
    GenerationMismatch,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Update { .. } => "Update",
            Message::Ack { .. } => "Ack",
            Message::StatusChange { .. } => "StatusChange",
            Message::TopologyInfo { .. } => "TopologyInfo",
            Message::ResetGenerationId { .. } => "ResetGenerationId",
            Message::Error { .. } => "Error",
        }
    }

    /// Build a plain (non-assured) update
    pub fn update(csn: Csn, payload: Vec<u8>) -> Self {
        Message::Update {
            csn,
            payload,
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
        }
    }

    /// Build a clean acknowledgment
    pub fn ack(csn: Csn) -> Self {
        Message::Ack {
            csn,
            has_timeout: false,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: Vec::new(),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }

    /// Whether the payload matches this header's checksum
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() == self.length as usize && crc32fast::hash(data) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_serialization() {
        let msg = Message::Update {
            csn: Csn::new(1000, 7, 3),
            payload: b"add: uid=jdoe".to_vec(),
            assured: true,
            assured_mode: AssuredMode::SafeRead,
            safe_data_level: 1,
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Update {
                csn,
                payload,
                assured,
                assured_mode,
                ..
            } => {
                assert_eq!(csn, Csn::new(1000, 7, 3));
                assert_eq!(payload, b"add: uid=jdoe");
                assert!(assured);
                assert_eq!(assured_mode, AssuredMode::SafeRead);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_ack_carries_failure_detail() {
        let msg = Message::Ack {
            csn: Csn::new(5, 1, 1),
            has_timeout: true,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: vec![12, 17],
        };

        let restored = Message::deserialize(&msg.serialize().unwrap()).unwrap();
        match restored {
            Message::Ack {
                has_timeout,
                failed_servers,
                ..
            } => {
                assert!(has_timeout);
                assert_eq!(failed_servers, vec![12, 17]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header_round_trip() {
        let data = b"replicated change payload";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
        assert!(restored.verify(data));
        assert!(!restored.verify(b"tampered"));
    }
}
