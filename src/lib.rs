//! # udpc
//!
//! Encrypted, connection-oriented transport over UDP.
//!
//! Peers run an X25519 handshake, then exchange ChaCha20-Poly1305 sealed datagrams that
//! carry messages on three channels: unreliable, reliable unordered and reliable ordered.
//! Large messages are fragmented, lost datagrams are retransmitted and every datagram
//! piggybacks acknowledgements for what its sender has received.
//!
//! ## Layers
//! - [`core`]: wire header codec and sequence arithmetic
//! - [`utils`]: session cipher, replay protection, logging, metrics
//! - [`protocol`]: handshake, channels, fragmentation, reliability, connection state
//! - [`transport`]: sans-IO [`Endpoint`] and the tokio [`Manager`]
//! - [`config`]: TOML / environment configuration

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::{AuthPolicy, UdpcConfig};
pub use error::{ProtocolError, Result};
pub use protocol::channel::Channel;
pub use protocol::connection::{ConnectionState, DisconnectReason};
pub use protocol::reliability::SendMode;
pub use transport::{ConnectionHandle, ConnectionInfo, Endpoint, Event, Manager, Received, Transmit};
