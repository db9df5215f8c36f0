//! p2pstream protocol: identifiers, versions, and the messages exchanged outside of chat.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};

/// Current protocol version. Used in beacons and the hello handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Application protocol identifier negotiated when a stream is opened.
/// Path-like, with the version as the final component.
pub const PROTOCOL_ID: &str = "/p2pstream/proto/0.0.1";

/// How often a node picks and announces a fresh alias.
pub const ALIAS_INTERVAL: Duration = Duration::from_secs(10);

/// Application-facing message: everything inbound that is not consumed as a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text { peer_id: PeerId, body: String },
    /// Raw encoded video access unit.
    Frame { peer_id: PeerId, bytes: Vec<u8> },
}

impl Message {
    pub fn peer_id(&self) -> PeerId {
        match self {
            Message::Text { peer_id, .. } | Message::Frame { peer_id, .. } => *peer_id,
        }
    }
}

/// LAN discovery datagrams. Encoding is bincode, one datagram per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Announcement {
    /// Multicast: advertise presence and the TCP port we accept sessions on.
    Beacon {
        protocol_version: u8,
        peer_id: PeerId,
        listen_port: u16,
    },
    /// Unicast reply to a beacon so the sender learns about us without waiting a full interval.
    DiscoveryResponse {
        protocol_version: u8,
        peer_id: PeerId,
        listen_port: u16,
    },
}

impl Announcement {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Announcement::Beacon {
                protocol_version, ..
            }
            | Announcement::DiscoveryResponse {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Announcement::Beacon { peer_id, .. }
            | Announcement::DiscoveryResponse { peer_id, .. } => *peer_id,
        }
    }

    pub fn listen_port(&self) -> u16 {
        match self {
            Announcement::Beacon { listen_port, .. }
            | Announcement::DiscoveryResponse { listen_port, .. } => *listen_port,
        }
    }
}

/// First record on every session stream, sent by both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub protocol_id: String,
    pub peer_id: PeerId,
    pub public_key: PublicKey,
}

impl Hello {
    pub fn new(peer_id: PeerId, public_key: PublicKey) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            protocol_id: PROTOCOL_ID.to_string(),
            peer_id,
            public_key,
        }
    }

    /// Check the remote hello: same protocol and a peer ID that really belongs to the key.
    pub fn verify(&self) -> Result<PeerId, HelloError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(HelloError::Version(self.protocol_version));
        }
        if self.protocol_id != PROTOCOL_ID {
            return Err(HelloError::Protocol(self.protocol_id.clone()));
        }
        if PeerId::from_public_key(&self.public_key) != self.peer_id {
            return Err(HelloError::IdentityMismatch);
        }
        Ok(self.peer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HelloError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unsupported protocol {0}")]
    Protocol(String),
    #[error("peer id does not match public key")]
    IdentityMismatch,
}
