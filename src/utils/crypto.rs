//! Session encryption.
//!
//! Every datagram after the handshake is sealed with ChaCha20-Poly1305 under one of two
//! directional session keys. The 96-bit nonce is the direction tag followed by the
//! sender's 64-bit counter, both big-endian:
//!
//! ```text
//! [Direction(4)] [Counter(8)]
//! ```
//!
//! Counters never repeat within a session and the two directions use distinct keys and
//! tags, so no (key, nonce) pair is ever reused. The encoded packet header is passed as
//! associated data.

use crate::error::{ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Poly1305 authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Session key length.
pub const KEY_SIZE: usize = 32;

/// Nonce direction tag for datagrams sent by the initiating side.
pub const DIRECTION_INITIATOR: u32 = 0x494E_4954;
/// Nonce direction tag for datagrams sent by the responding side.
pub const DIRECTION_RESPONDER: u32 = 0x5245_5350;

/// The pair of directional keys negotiated by a handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send: [u8; KEY_SIZE],
    pub recv: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

/// Build the 96-bit nonce for a direction and counter.
#[inline]
pub fn nonce_bytes(direction: u32, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&direction.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Directional AEAD state of one established connection.
pub struct SessionCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_direction: u32,
    recv_direction: u32,
}

impl SessionCipher {
    /// Build the cipher pair. `initiator` selects which direction tag this side seals with.
    pub fn new(keys: &SessionKeys, initiator: bool) -> Self {
        let (send_direction, recv_direction) = if initiator {
            (DIRECTION_INITIATOR, DIRECTION_RESPONDER)
        } else {
            (DIRECTION_RESPONDER, DIRECTION_INITIATOR)
        };
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(&keys.send)),
            recv: ChaCha20Poly1305::new(Key::from_slice(&keys.recv)),
            send_direction,
            recv_direction,
        }
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it. The result carries the tag.
    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = nonce_bytes(self.send_direction, counter);
        self.send
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    /// Decrypt and authenticate a sealed payload received with `counter`.
    pub fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(ProtocolError::AuthenticationFailed);
        }
        let nonce = nonce_bytes(self.recv_direction, counter);
        self.recv
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| ProtocolError::AuthenticationFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("send_direction", &self.send_direction)
            .field("recv_direction", &self.recv_direction)
            .finish_non_exhaustive()
    }
}
