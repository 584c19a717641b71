//! # Utility Modules
//!
//! Supporting utilities for cryptography, replay protection, logging, and metrics.
//!
//! ## Components
//! - **Crypto**: ChaCha20-Poly1305 session sealing with directional keys
//! - **Replay Window**: sliding counter window, doubles as acknowledgement state
//! - **Replay Cache**: TTL-based handshake nonce deduplication
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (OsRng)
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod replay_window;

pub use replay_cache::{CacheKey, ReplayCache};
pub use replay_window::ReceiveWindow;
