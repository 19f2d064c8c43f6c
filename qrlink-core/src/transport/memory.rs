//! In-process transport: two linked endpoints over tokio channels.
//! Used by the session tests and by hosts that embed both roles.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{PairingError, PairingInfo, PeerCandidate, Transport, TransportError};
use crate::protocol::Role;

const COORDINATOR_ADDRESS: &str = "mem:coordinator";
const PEER_ADDRESS: &str = "mem:peer";

struct Link {
    up: watch::Sender<bool>,
    roles: [watch::Sender<Option<Role>>; 2],
}

/// One end of an in-memory back-channel. Create both ends with [`MemoryTransport::linked`].
pub struct MemoryTransport {
    side: usize,
    address: &'static str,
    peer_address: &'static str,
    link: Arc<Link>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    pairing_failures: std::sync::Mutex<VecDeque<PairingError>>,
}

impl MemoryTransport {
    /// Two linked endpoints. The first one is the coordinating side.
    pub fn linked() -> (MemoryTransport, MemoryTransport) {
        let link = Arc::new(Link {
            up: watch::channel(true).0,
            roles: [watch::channel(None).0, watch::channel(None).0],
        });
        let (to_coordinator, coordinator_rx) = mpsc::unbounded_channel();
        let (to_peer, peer_rx) = mpsc::unbounded_channel();
        let coordinator = MemoryTransport {
            side: 0,
            address: COORDINATOR_ADDRESS,
            peer_address: PEER_ADDRESS,
            link: link.clone(),
            outbound: to_peer,
            inbound: Mutex::new(coordinator_rx),
            pairing_failures: std::sync::Mutex::new(VecDeque::new()),
        };
        let peer = MemoryTransport {
            side: 1,
            address: PEER_ADDRESS,
            peer_address: COORDINATOR_ADDRESS,
            link,
            outbound: to_coordinator,
            inbound: Mutex::new(peer_rx),
            pairing_failures: std::sync::Mutex::new(VecDeque::new()),
        };
        (coordinator, peer)
    }

    pub fn address(&self) -> &str {
        self.address
    }

    /// Drop the link for both ends, as if the radio went away.
    pub fn disconnect(&self) {
        self.link.up.send_replace(false);
    }

    /// Make the next `pair` call on this end fail with `err`.
    pub fn fail_next_pairing(&self, err: PairingError) {
        match self.pairing_failures.lock() {
            Ok(mut q) => q.push_back(err),
            Err(poisoned) => poisoned.into_inner().push_back(err),
        }
    }

    fn is_up(&self) -> bool {
        *self.link.up.borrow()
    }

    fn take_injected_failure(&self) -> Option<PairingError> {
        match self.pairing_failures.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

async fn wait_for_role(mut rx: watch::Receiver<Option<Role>>) -> Option<Role> {
    match rx.wait_for(|role| role.is_some()).await {
        Ok(role) => *role,
        Err(_) => None,
    }
}

async fn wait_for_link_down(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|up| !*up).await;
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn discover(&self) -> mpsc::Receiver<PeerCandidate> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(PeerCandidate::new(self.peer_address));
        rx
    }

    async fn pair(
        &self,
        role: Role,
        candidate: Option<PeerCandidate>,
    ) -> Result<PairingInfo, PairingError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        if !self.is_up() {
            return Err(PairingError::Transport("link down".into()));
        }
        if let Some(c) = &candidate {
            if c.address != self.peer_address {
                return Err(PairingError::Rejected(format!("no peer at {}", c.address)));
            }
        }
        self.link.roles[self.side].send_replace(Some(role));
        let peer_role = tokio::select! {
            r = wait_for_role(self.link.roles[1 - self.side].subscribe()) => r,
            _ = wait_for_link_down(self.link.up.subscribe()) => None,
        };
        match peer_role {
            Some(r) if r == role => Err(PairingError::RoleConflict),
            Some(_) => Ok(PairingInfo {
                peer_address: self.peer_address.to_string(),
                is_coordinator: self.side == 0,
            }),
            None => Err(PairingError::Transport("link dropped".into())),
        }
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        // bytes sent before the link dropped are still delivered
        if let Ok(msg) = inbound.try_recv() {
            return Ok(msg);
        }
        if !self.is_up() {
            return Err(TransportError::Closed);
        }
        let down = wait_for_link_down(self.link.up.subscribe());
        tokio::select! {
            biased;
            msg = inbound.recv() => msg.ok_or(TransportError::Closed),
            _ = down => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.disconnect();
    }

    fn invitation_address(&self) -> Option<String> {
        (self.side == 0).then(|| self.address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pairs_with_distinct_roles() {
        let (a, b) = MemoryTransport::linked();
        let (ra, rb) = tokio::join!(
            a.pair(Role::Sender, None),
            b.pair(Role::Receiver, Some(PeerCandidate::new(COORDINATOR_ADDRESS)))
        );
        assert!(ra.unwrap().is_coordinator);
        let rb = rb.unwrap();
        assert!(!rb.is_coordinator);
        assert_eq!(rb.peer_address, COORDINATOR_ADDRESS);
    }

    #[tokio::test]
    async fn same_roles_conflict() {
        let (a, b) = MemoryTransport::linked();
        let (ra, rb) = tokio::join!(a.pair(Role::Sender, None), b.pair(Role::Sender, None));
        assert_eq!(ra, Err(PairingError::RoleConflict));
        assert_eq!(rb, Err(PairingError::RoleConflict));
    }

    #[tokio::test]
    async fn unknown_candidate_rejected() {
        let (_a, b) = MemoryTransport::linked();
        let r = b
            .pair(Role::Receiver, Some(PeerCandidate::new("mem:elsewhere")))
            .await;
        assert!(matches!(r, Err(PairingError::Rejected(_))));
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (a, b) = MemoryTransport::linked();
        a.send(b"to peer").await.unwrap();
        b.send(b"to coordinator").await.unwrap();
        assert_eq!(b.receive().await.unwrap(), b"to peer".to_vec());
        assert_eq!(a.receive().await.unwrap(), b"to coordinator".to_vec());
    }

    #[tokio::test]
    async fn disconnect_wakes_pending_receive() {
        let (a, b) = MemoryTransport::linked();
        let pending = tokio::spawn(async move { b.receive().await });
        tokio::task::yield_now().await;
        a.disconnect();
        assert_eq!(pending.await.unwrap(), Err(TransportError::Closed));
        assert_eq!(a.send(b"late").await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn queued_bytes_survive_the_drop() {
        let (a, b) = MemoryTransport::linked();
        b.send(b"last ack").await.unwrap();
        b.close().await;
        assert_eq!(a.receive().await.unwrap(), b"last ack".to_vec());
        assert_eq!(a.receive().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn disconnect_wakes_pending_pair() {
        let (a, b) = MemoryTransport::linked();
        let pending = tokio::spawn(async move { b.pair(Role::Receiver, None).await });
        tokio::task::yield_now().await;
        a.disconnect();
        assert_eq!(
            pending.await.unwrap(),
            Err(PairingError::Transport("link dropped".into()))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = MemoryTransport::linked();
        a.close().await;
        a.close().await;
        assert!(!a.is_up());
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let (a, b) = MemoryTransport::linked();
        a.fail_next_pairing(PairingError::Timeout);
        assert_eq!(a.pair(Role::Sender, None).await, Err(PairingError::Timeout));
        let (ra, rb) = tokio::join!(a.pair(Role::Sender, None), b.pair(Role::Receiver, None));
        assert!(ra.is_ok() && rb.is_ok());
    }

    #[tokio::test]
    async fn discovery_reports_the_other_end() {
        let (a, b) = MemoryTransport::linked();
        assert_eq!(
            b.discover().await.recv().await,
            Some(PeerCandidate::new(a.address()))
        );
        assert_eq!(a.invitation_address().as_deref(), Some(COORDINATOR_ADDRESS));
        assert_eq!(b.invitation_address(), None);
    }
}
