//! Node identity: X25519 keypair generated at startup and the peer ID derived from it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const PEER_ID_LEN: usize = 16;

/// Node public key (32 bytes, X25519). Carried in the hello handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: truncated SHA-256 of the public key. Stable for the lifetime of the process,
/// independent of the network address the peer is reached on.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; PEER_ID_LEN]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    /// Derive the peer ID from a public key (same derivation `Keypair` uses).
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        PeerId(id)
    }

    /// Short form for logs: first 8 hex chars.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerIdParseError {
    #[error("expected 32 hex characters, got {0}")]
    Length(usize),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != PEER_ID_LEN * 2 {
            return Err(PeerIdParseError::Length(s.len()));
        }
        let mut id = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(PeerId(id))
    }
}

/// X25519 keypair. The secret never leaves this struct; only the public key and peer ID are exposed.
pub struct Keypair {
    #[allow(dead_code)]
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a new random keypair and derive the peer ID from its public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(&public);
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_peer_id_derivation() {
        let kp = Keypair::generate();
        assert_eq!(PeerId::from_public_key(kp.public_key()), kp.peer_id());
    }

    #[test]
    fn distinct_keypairs_distinct_ids() {
        assert_ne!(Keypair::generate().peer_id(), Keypair::generate().peer_id());
    }

    #[test]
    fn display_parse_roundtrip() {
        let id = Keypair::generate().peer_id();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<PeerId>().unwrap(), id);
        assert!(s.starts_with(&id.short()));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("abc".parse::<PeerId>(), Err(PeerIdParseError::Length(3)));
        let bad = "zz".repeat(16);
        assert_eq!(
            bad.parse::<PeerId>(),
            Err(PeerIdParseError::Hex(hex::FromHexError::InvalidHexCharacter {
                c: 'z',
                index: 0
            }))
        );
        // Every character must be a hex digit, signs included.
        assert!("+f".repeat(16).parse::<PeerId>().is_err());
        let multibyte = "é".repeat(16);
        assert!(multibyte.parse::<PeerId>().is_err());
    }

    #[test]
    fn parse_accepts_uppercase_and_surrounding_space() {
        let id = Keypair::generate().peer_id();
        let upper = format!(" {} ", id.to_string().to_uppercase());
        assert_eq!(upper.parse::<PeerId>(), Ok(id));
    }
}
