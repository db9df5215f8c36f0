//! Session transport: TCP listener and dialer, length-prefixed records, hello handshake.

use std::net::SocketAddr;
use std::time::Duration;

use p2pstream_core::protocol::HelloError;
use p2pstream_core::wire::{self, RecordError};
use p2pstream_core::{Hello, Keypair, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("hello encoding: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Hello(#[from] HelloError),
    #[error("handshake timed out")]
    TimedOut,
}

/// Listen for inbound sessions on all interfaces. Port 0 picks an ephemeral port.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Open a stream to a discovered peer address.
pub async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(r) => {
            let stream = r?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// Exchange hellos. Both ends send first and then read, so the same code runs on either side.
/// Returns the remote peer ID once its hello checks out.
pub async fn handshake(stream: &mut TcpStream, keypair: &Keypair) -> Result<PeerId, HandshakeError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange_hello(stream, keypair)).await {
        Ok(r) => r,
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

async fn exchange_hello(stream: &mut TcpStream, keypair: &Keypair) -> Result<PeerId, HandshakeError> {
    let hello = Hello::new(keypair.peer_id(), keypair.public_key().clone());
    let out = wire::encode_record(&bincode::serialize(&hello)?)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    let body = read_record(stream).await?;
    let remote: Hello = bincode::deserialize(&body)?;
    Ok(remote.verify()?)
}

/// Read one length-prefixed record. Oversized records are reported as `InvalidData`:
/// the stream cannot be resynchronised after one.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = wire::record_len(header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one already-encoded record and flush.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &[u8]) -> std::io::Result<()> {
    writer.write_all(record).await?;
    writer.flush().await
}
