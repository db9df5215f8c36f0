//! LAN discovery: UDP multicast beacon, unicast responses, peer liveness.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use p2pstream_core::{Announcement, PeerId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Sent for every beacon or response from another node, not only the first.
    Found { peer: PeerId, addrs: Vec<SocketAddr> },
    /// Nothing heard from the peer for a while.
    Lost { peer: PeerId },
}

pub struct Discovery {
    socket: UdpSocket,
    port: u16,
}

impl Discovery {
    /// Join the multicast group on `port`. Needs a running tokio runtime.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }

    /// Announce ourselves and report other nodes until the socket fails or `events` closes.
    pub async fn run<E>(
        self,
        local: PeerId,
        listen_port: u16,
        events: mpsc::UnboundedSender<E>,
    ) -> std::io::Result<()>
    where
        E: From<DiscoveryEvent>,
    {
        let beacon = encode(&Announcement::Beacon {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local,
            listen_port,
        })?;
        let response = encode(&Announcement::DiscoveryResponse {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local,
            listen_port,
        })?;
        let group = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, self.port));
        tokio::try_join!(
            beacon_loop(&self.socket, &beacon, group),
            recv_loop(&self.socket, local, &response, &events),
        )?;
        Ok(())
    }
}

fn encode(announcement: &Announcement) -> std::io::Result<Vec<u8>> {
    bincode::serialize(announcement)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn beacon_loop(socket: &UdpSocket, beacon: &[u8], group: SocketAddr) -> std::io::Result<()> {
    let mut tick = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = socket.send_to(beacon, group).await {
            debug!("beacon send failed: {e}");
        }
    }
}

async fn recv_loop<E>(
    socket: &UdpSocket,
    local: PeerId,
    response: &[u8],
    events: &mpsc::UnboundedSender<E>,
) -> std::io::Result<()>
where
    E: From<DiscoveryEvent>,
{
    let mut buf = vec![0u8; 65536];
    let mut table = PeerTable::default();
    let mut sweep = tokio::time::interval(BEACON_INTERVAL);
    loop {
        let out = tokio::select! {
            r = socket.recv_from(&mut buf) => {
                let (n, from) = r?;
                let Some(found) = classify(&buf[..n], from, local) else {
                    continue;
                };
                if found.is_beacon {
                    if let Err(e) = socket.send_to(response, from).await {
                        debug!(%from, "discovery response failed: {e}");
                    }
                }
                table.seen(found.peer, Instant::now());
                vec![DiscoveryEvent::Found {
                    peer: found.peer,
                    addrs: vec![found.addr],
                }]
            }
            _ = sweep.tick() => table
                .expire(Instant::now())
                .into_iter()
                .map(|peer| DiscoveryEvent::Lost { peer })
                .collect(),
        };
        for event in out {
            if events.send(event.into()).is_err() {
                return Ok(());
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Found {
    peer: PeerId,
    /// Session address: datagram source IP plus the advertised listen port.
    addr: SocketAddr,
    is_beacon: bool,
}

/// Decode a datagram. Drops garbage, other protocol versions, and our own beacons
/// (multicast loops back to the sender).
fn classify(datagram: &[u8], from: SocketAddr, local: PeerId) -> Option<Found> {
    let announcement: Announcement = match bincode::deserialize(datagram) {
        Ok(a) => a,
        Err(e) => {
            trace!(%from, "ignoring datagram: {e}");
            return None;
        }
    };
    if announcement.protocol_version() != PROTOCOL_VERSION || announcement.peer_id() == local {
        return None;
    }
    Some(Found {
        peer: announcement.peer_id(),
        addr: SocketAddr::new(from.ip(), announcement.listen_port()),
        is_beacon: matches!(announcement, Announcement::Beacon { .. }),
    })
}

#[derive(Default)]
struct PeerTable {
    last_seen: HashMap<PeerId, Instant>,
}

impl PeerTable {
    fn seen(&mut self, peer: PeerId, now: Instant) {
        self.last_seen.insert(peer, now);
    }

    /// Remove and return peers silent for `PEER_TIMEOUT` or longer.
    fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let gone: Vec<PeerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= PEER_TIMEOUT)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &gone {
            self.last_seen.remove(peer);
        }
        gone
    }
}
