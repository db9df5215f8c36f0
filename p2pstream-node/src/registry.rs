//! Live peer set: one record per identity, owning that peer's connection and alias.

use std::collections::HashMap;

use p2pstream_core::PeerId;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionId};

/// Snapshot of known peers and their aliases, for observers.
pub type Directory = HashMap<PeerId, String>;

#[derive(Debug)]
struct PeerRecord {
    alias: String,
    connection: Connection,
}

/// Outcome of offering a connection to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First connection for this peer.
    Added,
    /// Peer was known; the new connection won the duplicate tie-break and replaced the old one.
    Replaced,
    /// Self, or a duplicate that lost the tie-break. The connection was dropped.
    Rejected,
}

#[derive(Debug)]
pub struct Registry {
    local: PeerId,
    peers: HashMap<PeerId, PeerRecord>,
    directory: watch::Sender<Directory>,
}

impl Registry {
    pub fn new(local: PeerId) -> Self {
        let (directory, _) = watch::channel(Directory::new());
        Self {
            local,
            peers: HashMap::new(),
            directory,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Directory> {
        self.directory.subscribe()
    }

    /// Register an active connection.
    ///
    /// When both ends dial each other at once there are two streams for one pair. Both nodes keep
    /// the stream opened by the smaller peer ID, so they settle on the same one.
    pub fn register(&mut self, connection: Connection) -> Registration {
        let peer = connection.peer_id();
        if peer == self.local {
            return Registration::Rejected;
        }
        let preferred = self.local.min(peer);
        let outcome = match self.peers.get_mut(&peer) {
            None => {
                self.peers.insert(
                    peer,
                    PeerRecord {
                        alias: peer.to_string(),
                        connection,
                    },
                );
                Registration::Added
            }
            Some(record)
                if record.connection.initiator() != preferred
                    && connection.initiator() == preferred =>
            {
                record.connection = connection;
                Registration::Replaced
            }
            Some(_) => Registration::Rejected,
        };
        if outcome == Registration::Added {
            self.publish();
        }
        outcome
    }

    /// Forget `peer` if `id` is its registered connection. Closing a connection that lost the
    /// duplicate tie-break must not drop the peer.
    pub fn remove(&mut self, peer: &PeerId, id: ConnectionId) -> bool {
        match self.peers.get(peer) {
            Some(record) if record.connection.id() == id => {
                self.peers.remove(peer);
                self.publish();
                true
            }
            _ => false,
        }
    }

    /// Last write wins. Unknown peers are ignored.
    pub fn set_alias(&mut self, peer: &PeerId, alias: String) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.alias = alias;
                self.publish();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn send_text(&self, peer: &PeerId, text: &str) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|r| r.connection.send_text(text))
    }

    /// False for unknown peers and for frames dropped by a full outbound backlog.
    pub fn send_frame(&self, peer: &PeerId, bytes: &[u8]) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|r| r.connection.send_frame(bytes))
    }

    /// Queue `text` to every registered peer. Returns how many accepted it.
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.peers
            .values()
            .filter(|r| r.connection.send_text(text))
            .count()
    }

    /// Drop every peer, closing their connections.
    pub fn clear(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.publish();
        }
    }

    fn publish(&self) {
        self.directory.send_replace(
            self.peers
                .iter()
                .map(|(id, r)| (*id, r.alias.clone()))
                .collect(),
        );
    }
}
