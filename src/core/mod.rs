//! # Core Protocol Components
//!
//! Low-level datagram handling: the fixed header, the pure codec around it, and the
//! modular sequence arithmetic everything above relies on.
//!
//! ## Components
//! - **Packet**: fixed 28-byte header plus payload, encode/decode with validation
//! - **Sequence**: wrapping comparisons, 64-bit counter recovery, sequence ring buffer
//!
//! ## Security
//! - Length validation before any payload is touched
//! - Unknown versions and flag bits are rejected at the codec
//! - The encoded header is authenticated as AEAD associated data

pub mod packet;
pub mod sequence;
