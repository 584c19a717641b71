//! # Protocol Layer
//!
//! Everything between an application message and a sealed datagram.
//!
//! ## Components
//! - **Handshake**: X25519 key exchange with optional Ed25519 identities
//! - **Channel**: delivery guarantees and the data frame
//! - **Fragment**: splitting and reassembly of large messages
//! - **Reliability**: acknowledgements, retransmission, RTT and send pacing
//! - **Connection**: the per-peer state machine tying the above together
//!
//! ## Data Flow
//! ```text
//! send ─▶ fragment ─▶ frame ─▶ sequence ─▶ seal ─▶ encode ─▶ socket
//! socket ─▶ decode ─▶ window ─▶ open ─▶ acks ─▶ reassemble ─▶ order ─▶ receive
//! ```

pub mod channel;
pub mod connection;
pub mod fragment;
pub mod handshake;
pub mod reliability;
