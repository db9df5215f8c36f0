//! One session stream to one peer.
//!
//! The connection task owns the socket. It runs the hello handshake, announces the connection to
//! its owner with [`ConnectionEvent::Opened`], signals readiness to whoever is waiting in
//! [`establish`], and then dispatches every inbound record in arrival order. Outbound records go
//! through one ordered queue drained by a writer task, so senders never wait on the network. At
//! most [`MAX_QUEUED_FRAMES`] video frames may wait in it; further frames are dropped until the
//! writer catches up. Text is never dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use p2pstream_core::wire::{self, TypeTag};
use p2pstream_core::{Keypair, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::transport::{self, HandshakeError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames a stalled peer may have waiting before new ones are dropped.
pub const MAX_QUEUED_FRAMES: usize = 64;

/// Distinguishes successive connections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which end opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Everything a connection reports to its owner, in stream order.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened(Connection),
    Text { peer: PeerId, body: String },
    Frame { peer: PeerId, bytes: Vec<u8> },
    Closed { peer: PeerId, id: ConnectionId },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect: {0}")]
    Connect(std::io::Error),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("expected peer {expected}, got {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
    #[error("connection closed before activation")]
    Closed,
}

/// A record waiting for the writer.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) record: Vec<u8>,
    frame: bool,
}

/// Handle to an active connection. Dropping it closes the stream.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerId,
    initiator: PeerId,
    outbound: mpsc::UnboundedSender<Outbound>,
    queued_frames: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Identity of the node that opened the stream.
    pub fn initiator(&self) -> PeerId {
        self.initiator
    }

    /// Queue a MESSAGE frame. Returns false when the connection is already gone.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(TypeTag::MESSAGE, text.as_bytes())
    }

    /// Queue a FRAME frame. Returns false when the connection is already gone or the frame was
    /// dropped because [`MAX_QUEUED_FRAMES`] are already waiting.
    pub fn send_frame(&self, bytes: &[u8]) -> bool {
        if self.queued_frames.fetch_add(1, Ordering::AcqRel) >= MAX_QUEUED_FRAMES {
            self.queued_frames.fetch_sub(1, Ordering::AcqRel);
            debug!(peer = %self.peer.short(), "outbound backlog full, dropping frame");
            return false;
        }
        let queued = self.send(TypeTag::FRAME, bytes);
        if !queued {
            self.queued_frames.fetch_sub(1, Ordering::AcqRel);
        }
        queued
    }

    fn send(&self, tag: TypeTag, payload: &[u8]) -> bool {
        match wire::encode_record(&wire::encode(tag, payload)) {
            Ok(record) => self
                .outbound
                .send(Outbound {
                    record,
                    frame: tag == TypeTag::FRAME,
                })
                .is_ok(),
            Err(e) => {
                warn!(peer = %self.peer.short(), "not sending: {e}");
                false
            }
        }
    }

    /// Handle with no socket behind it; queued records land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        peer: PeerId,
        initiator: PeerId,
    ) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            id: ConnectionId::next(),
            peer,
            initiator,
            outbound,
            queued_frames: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(Notify::new()),
        };
        (conn, rx)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Start a connection task on `stream` and wait until it is active (handshake done and the
/// owner notified) or has failed. Resolves exactly once.
///
/// `expected` pins the remote identity for outbound dials to a discovered peer.
pub async fn establish<E>(
    stream: TcpStream,
    role: Role,
    keypair: Arc<Keypair>,
    expected: Option<PeerId>,
    events: mpsc::UnboundedSender<E>,
) -> Result<PeerId, ConnectionError>
where
    E: From<ConnectionEvent> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(drive(stream, role, keypair, expected, events, ready_tx));
    match ready_rx.await {
        Ok(r) => r,
        Err(_) => Err(ConnectionError::Closed),
    }
}

async fn activate(
    stream: &mut TcpStream,
    keypair: &Keypair,
    expected: Option<PeerId>,
) -> Result<PeerId, ConnectionError> {
    let peer = transport::handshake(stream, keypair).await?;
    if peer == keypair.peer_id() {
        return Err(ConnectionError::SelfConnection);
    }
    if let Some(expected) = expected {
        if expected != peer {
            return Err(ConnectionError::UnexpectedPeer {
                expected,
                actual: peer,
            });
        }
    }
    Ok(peer)
}

async fn drive<E>(
    mut stream: TcpStream,
    role: Role,
    keypair: Arc<Keypair>,
    expected: Option<PeerId>,
    events: mpsc::UnboundedSender<E>,
    ready: oneshot::Sender<Result<PeerId, ConnectionError>>,
) where
    E: From<ConnectionEvent> + Send + 'static,
{
    let peer = match activate(&mut stream, &keypair, expected).await {
        Ok(peer) => peer,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let initiator = match role {
        Role::Initiator => keypair.peer_id(),
        Role::Responder => peer,
    };
    let (reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    let queued_frames = Arc::new(AtomicUsize::new(0));
    let id = ConnectionId::next();
    let conn = Connection {
        id,
        peer,
        initiator,
        outbound,
        queued_frames: queued_frames.clone(),
        shutdown: shutdown.clone(),
    };
    tokio::spawn(write_loop(writer, outbound_rx, queued_frames, peer));

    if events.send(ConnectionEvent::Opened(conn).into()).is_err() {
        let _ = ready.send(Err(ConnectionError::Closed));
        return;
    }
    let _ = ready.send(Ok(peer));
    debug!(peer = %peer.short(), ?role, "connection active");

    read_loop(reader, peer, &shutdown, &events).await;
    let _ = events.send(ConnectionEvent::Closed { peer, id }.into());
}

async fn read_loop<E>(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    shutdown: &Notify,
    events: &mpsc::UnboundedSender<E>,
) where
    E: From<ConnectionEvent>,
{
    loop {
        let record = tokio::select! {
            r = transport::read_record(&mut reader) => r,
            _ = shutdown.notified() => {
                debug!(peer = %peer.short(), "connection closed locally");
                return;
            }
        };
        let record = match record {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %peer.short(), "peer closed the stream");
                return;
            }
            Err(e) => {
                warn!(peer = %peer.short(), "read failed: {e}");
                return;
            }
        };
        let event = match wire::decode(&record) {
            Ok((TypeTag::MESSAGE, payload)) => ConnectionEvent::Text {
                peer,
                body: String::from_utf8_lossy(payload).into_owned(),
            },
            Ok((TypeTag::FRAME, payload)) => ConnectionEvent::Frame {
                peer,
                bytes: payload.to_vec(),
            },
            Ok((TypeTag(tag), _)) => {
                warn!(peer = %peer.short(), tag, "dropping frame with unknown type");
                continue;
            }
            Err(e) => {
                warn!(peer = %peer.short(), "dropping frame: {e}");
                continue;
            }
        };
        if events.send(event.into()).is_err() {
            return;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    queued_frames: Arc<AtomicUsize>,
    peer: PeerId,
) {
    while let Some(Outbound { record, frame }) = outbound.recv().await {
        if frame {
            queued_frames.fetch_sub(1, Ordering::AcqRel);
        }
        if let Err(e) = transport::write_record(&mut writer, &record).await {
            debug!(peer = %peer.short(), "write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
