//! p2pstream session node: LAN discovery, authenticated TCP sessions, chat and call signaling.
//!
//! [`Node`] is the entry point. Protocol types come from `p2pstream_core`.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod node;
pub mod registry;
pub mod transport;

pub use config::Config;
pub use node::{DialError, Node, NodeError, SendError};
pub use registry::Directory;
