//! LAN back-channel: the sender listens on TCP, the receiver connects to a
//! discovered (or scanned) address, and both exchange a Hello before any ack.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use qrlink_core::wire::{decode_message, encode_message};
use qrlink_core::{
    Message, PairingError, PairingInfo, PeerCandidate, Role, Transport, TransportError,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{self, Advert, MULTICAST_GROUP};

const LEN_SIZE: usize = 4;
const MAX_HANDSHAKE_LEN: usize = 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanConfig {
    pub discovery_port: u16,
    /// Port the sender accepts on; 0 picks an ephemeral port.
    pub transport_port: u16,
    pub beacon_interval: Duration,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            discovery_port: 45680,
            transport_port: 45681,
            beacon_interval: Duration::from_secs(2),
        }
    }
}

/// TCP back-channel plus multicast discovery for one device.
pub struct LanTransport {
    config: LanConfig,
    role: Role,
    instance: u64,
    listener: Mutex<Option<TcpListener>>,
    listen_port: u16,
    invitation: Option<String>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    discovery: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LanTransport {
    /// Prepare a transport for `role`. The sender binds its listener up front
    /// so the address can go into the invitation frame.
    pub async fn bind(config: LanConfig, role: Role) -> std::io::Result<Self> {
        let (listener, listen_port) = match role {
            Role::Sender => {
                let l = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.transport_port)).await?;
                let port = l.local_addr()?.port();
                info!(port, "back-channel listening");
                (Some(l), port)
            }
            Role::Receiver => (None, 0),
        };
        let invitation = match role {
            Role::Sender => match local_lan_ip(config.discovery_port) {
                Ok(ip) => Some(SocketAddr::new(ip.into(), listen_port).to_string()),
                Err(e) => {
                    warn!(error = %e, "no LAN address for the invitation frame");
                    None
                }
            },
            Role::Receiver => None,
        };
        Ok(Self {
            config,
            role,
            instance: rand::random(),
            listener: Mutex::new(listener),
            listen_port,
            invitation,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            discovery: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn replace_discovery(&self, task: Option<JoinHandle<()>>) {
        let mut slot = match self.discovery.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = std::mem::replace(&mut *slot, task) {
            old.abort();
        }
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), PairingError> {
        let listener = self.listener.lock().await;
        let Some(listener) = listener.as_ref() else {
            return Err(PairingError::Transport("not listening".into()));
        };
        listener
            .accept()
            .await
            .map_err(|e| PairingError::Transport(e.to_string()))
    }

    async fn install(&self, stream: TcpStream) {
        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
    }
}

/// Local interface address that routes to the LAN (no packet is sent).
fn local_lan_ip(discovery_port: u16) -> std::io::Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect((MULTICAST_GROUP, discovery_port))?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no IPv4 route to the LAN",
        )),
    }
}

async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> std::io::Result<()> {
    let bytes = encode_message(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Read exactly one length-prefixed message, leaving later bytes in the stream.
async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Message> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake too large",
        ));
    }
    let mut frame = vec![0u8; LEN_SIZE + len];
    frame[..LEN_SIZE].copy_from_slice(&len_buf);
    r.read_exact(&mut frame[LEN_SIZE..]).await?;
    decode_message(&frame)
        .map(|(msg, _)| msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn hello(role: Role) -> Message {
    Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        role,
    }
}

/// Validate the peer's Hello against our role.
fn check_hello(msg: Message, mine: Role) -> Result<(), PairingError> {
    match msg {
        Message::Hello {
            protocol_version,
            role,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(PairingError::Rejected(format!(
                    "unsupported protocol version {protocol_version}"
                )));
            }
            if role == mine {
                return Err(PairingError::RoleConflict);
            }
            Ok(())
        }
        other => Err(PairingError::Rejected(format!(
            "expected hello, got {other:?}"
        ))),
    }
}

fn io_to_pairing(e: std::io::Error) -> PairingError {
    PairingError::Transport(e.to_string())
}

/// Both sides send their Hello first, then check the peer's.
async fn handshake(stream: &mut TcpStream, mine: Role) -> Result<(), PairingError> {
    write_message(stream, &hello(mine))
        .await
        .map_err(io_to_pairing)?;
    let theirs = read_message(stream).await.map_err(io_to_pairing)?;
    check_hello(theirs, mine)
}

#[async_trait]
impl Transport for LanTransport {
    async fn discover(&self) -> mpsc::Receiver<PeerCandidate> {
        let (tx, rx) = mpsc::channel(16);
        let advert = Advert {
            instance: self.instance,
            role: self.role,
            listen_port: self.listen_port,
        };
        let port = self.config.discovery_port;
        let interval = self.config.beacon_interval;
        let task = tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(advert, port, interval, tx).await {
                warn!(error = %e, port, "multicast discovery unavailable");
            }
        });
        self.replace_discovery(Some(task));
        rx
    }

    async fn pair(
        &self,
        role: Role,
        candidate: Option<PeerCandidate>,
    ) -> Result<PairingInfo, PairingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PairingError::Transport("transport closed".into()));
        }
        if role != self.role {
            return Err(PairingError::RoleConflict);
        }
        match (role, candidate) {
            (Role::Sender, candidate) => {
                if let Some(c) = candidate {
                    debug!(peer = %c.address, "coordinator ignores the candidate and accepts");
                }
                let (mut stream, peer) = self.accept().await?;
                debug!(%peer, "incoming back-channel");
                handshake(&mut stream, role).await?;
                self.install(stream).await;
                info!(%peer, "back-channel paired");
                Ok(PairingInfo {
                    peer_address: peer.to_string(),
                    is_coordinator: true,
                })
            }
            (Role::Receiver, Some(candidate)) => {
                let addr: SocketAddr = candidate.address.parse().map_err(|_| {
                    PairingError::Rejected(format!("bad address {}", candidate.address))
                })?;
                let mut stream = TcpStream::connect(addr).await.map_err(io_to_pairing)?;
                handshake(&mut stream, role).await?;
                self.install(stream).await;
                info!(peer = %addr, "back-channel paired");
                Ok(PairingInfo {
                    peer_address: addr.to_string(),
                    is_coordinator: false,
                })
            }
            (Role::Receiver, None) => Err(PairingError::Rejected(
                "receiver needs a sender address".into(),
            )),
        }
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(if self.closed.load(Ordering::SeqCst) {
                TransportError::Closed
            } else {
                TransportError::NotPaired
            });
        };
        w.write_all(bytes).await?;
        w.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        let Some(r) = reader.as_mut() else {
            return Err(if self.closed.load(Ordering::SeqCst) {
                TransportError::Closed
            } else {
                TransportError::NotPaired
            });
        };
        let mut buf = vec![0u8; READ_CHUNK];
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.replace_discovery(None);
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        // a reader still held by an aborting worker is dropped with it
        if let Ok(mut r) = self.reader.try_lock() {
            r.take();
        }
        if let Ok(mut l) = self.listener.try_lock() {
            l.take();
        }
        debug!("back-channel closed");
    }

    fn invitation_address(&self) -> Option<String> {
        self.invitation.clone()
    }
}
