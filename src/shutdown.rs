//! Shutdown signaling
//!
//! A process-wide shutdown handle shared by the domain, the changelog writer
//! tasks and blocked queue producers. A fatal storage fault anywhere in the
//! engine requests a full server shutdown through this handle, since the
//! engine cannot guarantee durability past an unrecoverable storage error.

use tokio::sync::watch;

/// Why the engine is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator-requested stop
    Requested,
    /// Unrecoverable storage fault; continuing would risk silent data loss
    FatalStorage,
}

/// Cloneable shutdown handle
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownHandle {
    /// Create a fresh handle (not yet shut down)
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Request shutdown; wakes every subscriber. The first reason wins.
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The recorded reason, if shutdown was requested
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    /// Subscribe for shutdown notification
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task shutdown listener
pub struct ShutdownListener {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownListener {
    /// Wait until shutdown is requested
    pub async fn wait(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = *self.rx.borrow() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped; treat as a requested stop
                return ShutdownReason::Requested;
            }
        }
    }

    /// Non-blocking check
    pub fn is_shutdown(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
