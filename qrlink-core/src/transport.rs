//! Back-channel transport seam. Concrete links (LAN, Wi-Fi Direct, Bluetooth)
//! implement `Transport`; the session controller only talks to this trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::Role;

pub mod memory;

/// A nearby peer reported by discovery or read from an invitation frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerCandidate {
    pub address: String,
}

impl PeerCandidate {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Result of a successful pairing. Fixed for the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInfo {
    pub peer_address: String,
    /// True on the side that coordinates (accepts) the back-channel.
    pub is_coordinator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing rejected: {0}")]
    Rejected(String),
    #[error("pairing timed out")]
    Timeout,
    #[error("both peers claim the same role")]
    RoleConflict,
    #[error("transport failure while pairing: {0}")]
    Transport(String),
}

impl PairingError {
    /// Transient failures may be retried within the session's retry budget.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PairingError::RoleConflict)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("back-channel closed")]
    Closed,
    #[error("back-channel not paired")]
    NotPaired,
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Bidirectional point-to-point byte channel between sender and receiver.
///
/// `receive` blocks its caller's task; the session runs it on a dedicated
/// worker and aborts that worker on teardown. All methods take `&self` so a
/// send can proceed while a receive is pending.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start looking for peers. Candidates arrive on the returned channel until
    /// it is dropped or the search ends; calling again restarts the search.
    async fn discover(&self) -> mpsc::Receiver<PeerCandidate>;

    /// Establish the back-channel. The coordinator (sender) passes `None` and
    /// waits for a peer; the receiver connects to `candidate`.
    async fn pair(
        &self,
        role: Role,
        candidate: Option<PeerCandidate>,
    ) -> Result<PairingInfo, PairingError>;

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Next chunk of bytes from the peer. `Err(Closed)` signals a disconnect.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    /// Release the channel. Idempotent.
    async fn close(&self);

    /// Address a receiver can pair with, shown in the sender's invitation frame.
    fn invitation_address(&self) -> Option<String> {
        None
    }
}
