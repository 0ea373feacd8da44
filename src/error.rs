//! dirrepl Error Types

use thiserror::Error;

use crate::csn::Csn;

/// Result type alias for dirrepl operations
pub type Result<T> = std::result::Result<T, Error>;

/// dirrepl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Changelog storage errors
    #[error("Changelog error: {0}")]
    Changelog(String),

    #[error("Changelog is closed")]
    Closed,

    #[error("No change available: {0}")]
    NotAvailable(String),

    #[error("Transient storage conflict: {0}")]
    Transient(String),

    #[error("Changelog corrupted at {csn}: {reason}")]
    Corrupted { csn: Csn, reason: String },

    #[error("Changelog serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Domain / protocol errors
    #[error("Duplicate server id {server_id} in domain {domain}")]
    DuplicateServerId { server_id: u32, domain: String },

    #[error("Unknown peer {0}")]
    UnknownPeer(u32),

    #[error("Generation id mismatch for peer {peer}: local {local}, remote {remote}")]
    GenerationMismatch { peer: u32, local: i64, remote: i64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient storage conflict worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Check if this error must close the changelog and escalate to a full
    /// server shutdown (durability can no longer be guaranteed)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupted { .. } | Error::Io(_))
    }
}
