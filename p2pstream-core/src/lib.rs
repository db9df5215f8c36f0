//! p2pstream session protocol.
//! Host-driven: no I/O; the host owns sockets and timers and feeds events in.

pub mod call;
pub mod command;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use call::{AttemptId, Call, CallError, CallQueue, CallState};
pub use command::{Answer, Command};
pub use identity::{Keypair, PeerId, PublicKey};
pub use protocol::{Announcement, Hello, Message, PROTOCOL_ID, PROTOCOL_VERSION};
pub use wire::{FrameDecodeError, RecordError, TypeTag};
