//! # Error Types
//!
//! Error handling for the UDP connection protocol.
//!
//! The variants follow the protocol's failure taxonomy and fall into three groups
//! that are propagated differently:
//!
//! ## Error Categories
//! - **Transport/Security**: malformed datagrams, authentication failures and replayed
//!   nonces. These are recovered locally: the datagram is dropped, counted and never
//!   surfaced to the peer or the application.
//! - **Connection-fatal**: handshake failures, retransmission exhaustion and inactivity.
//!   Surfaced exactly once per connection through an [`Event`](crate::transport::endpoint::Event).
//! - **Message-level**: reassembly timeouts and overflows. Surfaced as a dropped message,
//!   the connection stays alive.
//! - **API misuse**: oversized messages, unknown handles, full send queues, bad config.
//!
//! ## Example Usage
//! ```rust
//! use udpc::error::{ProtocolError, Result};
//!
//! fn check_len(payload: &[u8], max: usize) -> Result<()> {
//!     if payload.len() > max {
//!         return Err(ProtocolError::MessageTooLarge(payload.len()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_len(&[0u8; 4], 8).is_ok());
//! assert!(matches!(check_len(&[0u8; 16], 8), Err(ProtocolError::MessageTooLarge(16))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_SHORT_HEADER: &str = "datagram shorter than the fixed header";
    pub const ERR_LENGTH_MISMATCH: &str = "declared payload length does not match datagram";
    pub const ERR_UNKNOWN_FLAGS: &str = "unknown flag bits set";
    pub const ERR_CONFLICTING_FLAGS: &str = "conflicting datagram kind flags";
    pub const ERR_FRAGMENT_BOUNDS: &str = "fragment index outside fragment count";
    pub const ERR_OVERSIZED_DATAGRAM: &str = "datagram exceeds maximum size";
    pub const ERR_PAYLOAD_TOO_LONG: &str = "payload does not fit the length field";

    /// Frame and handshake body errors
    pub const ERR_SHORT_FRAME: &str = "data frame shorter than its header";
    pub const ERR_UNKNOWN_CHANNEL: &str = "unknown channel";
    pub const ERR_HANDSHAKE_BODY: &str = "malformed handshake body";
    pub const ERR_FRAGMENT_MISMATCH: &str = "fragment count disagrees with buffered fragments";

    /// Handshake rejection reasons
    pub const ERR_PROTOCOL_MISMATCH: &str = "protocol id mismatch";
    pub const ERR_INVALID_TIMESTAMP: &str = "invalid or stale timestamp";
    pub const ERR_REPLAY_ATTACK: &str = "handshake nonce/timestamp already seen";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "peer failed to verify our nonce";
    pub const ERR_MISSING_IDENTITY: &str = "peer presented no identity under strict policy";
    pub const ERR_IDENTITY_MISMATCH: &str = "peer identity does not match the expected key";
    pub const ERR_NOT_WHITELISTED: &str = "peer identity not in whitelist";
    pub const ERR_BAD_SIGNATURE: &str = "identity signature verification failed";
    pub const ERR_BAD_PUBLIC_KEY: &str = "peer ephemeral public key rejected";
    pub const ERR_SYSTEM_TIME: &str = "system time error: time went backwards";
    pub const ERR_HANDSHAKE_STATE: &str = "handshake state already consumed";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Replayed nonce")]
    ReplayedNonce,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Reassembly timed out")]
    ReassemblyTimeout,

    #[error("Reassembly buffer overflow")]
    ReassemblyOverflow,

    #[error("Retransmission budget exhausted")]
    RetransmissionExhausted,

    #[error("Connection timed out (no activity)")]
    InactivityTimeout,

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Empty messages cannot be sent")]
    EmptyMessage,

    #[error("Send queue full")]
    QueueFull,

    #[error("Unknown connection")]
    UnknownConnection,

    #[error("Connection is not established")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl ProtocolError {
    /// Whether this error is a transport or security failure that must be dropped
    /// silently instead of being surfaced.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedPacket(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::AuthenticationFailed
                | ProtocolError::ReplayedNonce
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
