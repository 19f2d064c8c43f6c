//! LAN discovery: UDP multicast beacon, report peers playing the opposite role.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use qrlink_core::wire::{decode_message, encode_message};
use qrlink_core::{Message, PeerCandidate, Role, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 61, 61);

/// Who we are on the LAN, as carried in every beacon.
#[derive(Debug, Clone, Copy)]
pub struct Advert {
    pub instance: u64,
    pub role: Role,
    /// Back-channel port; 0 on the receiver, which never accepts.
    pub listen_port: u16,
}

impl Advert {
    fn beacon(&self) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            instance: self.instance,
            role: self.role,
            listen_port: self.listen_port,
        }
    }
}

/// Beacon and listen until the receiver side of `found` is dropped or the task is aborted.
pub async fn run_discovery(
    advert: Advert,
    discovery_port: u16,
    beacon_interval: Duration,
    found: mpsc::Sender<PeerCandidate>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);
    let beacon = tokio::spawn(beacon_loop(
        socket.clone(),
        advert,
        discovery_port,
        beacon_interval,
    ));
    let result = recv_loop(socket, advert, found).await;
    beacon.abort();
    result
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    advert: Advert,
    discovery_port: u16,
    interval: Duration,
) -> std::io::Result<()> {
    let frame = encode_message(&advert.beacon())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    advert: Advert,
    found: mpsc::Sender<PeerCandidate>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    let mut reported = HashSet::new();
    loop {
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => r?,
            _ = found.closed() => return Ok(()),
        };
        let Ok((msg, _)) = decode_message(&buf[..n]) else {
            trace!(%from, "ignoring undecodable datagram");
            continue;
        };
        if let Some(candidate) = candidate_from(&msg, from, &advert) {
            if reported.insert(candidate.address.clone()) {
                debug!(peer = %candidate.address, "peer beacon");
                if found.send(candidate).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// A beacon from another instance playing the other role, as a pairing candidate.
fn candidate_from(msg: &Message, from: SocketAddr, me: &Advert) -> Option<PeerCandidate> {
    match msg {
        Message::Beacon {
            protocol_version,
            instance,
            role,
            listen_port,
        } => {
            if *protocol_version != PROTOCOL_VERSION || *instance == me.instance || *role == me.role
            {
                return None;
            }
            Some(PeerCandidate::new(
                SocketAddr::new(from.ip(), *listen_port).to_string(),
            ))
        }
        _ => None,
    }
}
