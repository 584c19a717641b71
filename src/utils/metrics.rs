//! Observability and Metrics
//!
//! Per-endpoint counters for connection lifecycle, traffic and dropped datagrams.
//!
//! Counters are atomics so the async manager can read a snapshot without taking the
//! endpoint lock. Each counter appears once in the `counters!` table below, which
//! generates the live struct, its snapshot and the structured log record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Live counters of one endpoint.
        #[derive(Debug)]
        pub struct Metrics {
            $($(#[$doc])* $name: AtomicU64,)*
            started: Instant,
        }

        /// Point-in-time copy of [`Metrics`].
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
            pub uptime_seconds: u64,
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)*
                    started: Instant::now(),
                }
            }

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    uptime_seconds: self.started.elapsed().as_secs(),
                }
            }

            /// Emit every counter as one `info` record.
            pub fn log_metrics(&self) {
                let snapshot = self.snapshot();
                info!(
                    $($name = snapshot.$name,)*
                    uptime_seconds = snapshot.uptime_seconds,
                    "Endpoint metrics snapshot"
                );
            }
        }
    };
}

counters! {
    /// Handshakes that reached the connected state.
    connections_total,
    /// Currently established connections.
    connections_active,
    /// Handshakes started, in either role.
    handshakes_total,
    handshakes_success,
    /// Handshakes that timed out or were rejected.
    handshakes_failed,
    /// Application messages accepted for sending.
    messages_sent,
    /// Application messages delivered.
    messages_received,
    datagrams_sent,
    datagrams_received,
    bytes_sent,
    bytes_received,
    /// Reliable fragments sent again after their timer expired.
    retransmissions,
    /// Datagrams the codec refused.
    malformed_dropped,
    /// Datagrams whose tag did not verify.
    auth_failures,
    /// Datagrams rejected by the receive window.
    replays_dropped,
    /// Handshake requests caught by the replay cache.
    replay_cache_hits,
    /// Messages lost to reassembly timeout or overflow.
    messages_dropped,
    /// Established connections that ended with a fatal error.
    connection_errors,
}

#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Metrics {
    pub fn connection_established(&self) {
        bump(&self.connections_total, 1);
        bump(&self.connections_active, 1);
        bump(&self.handshakes_success, 1);
    }

    /// The active gauge saturates at zero.
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn handshake_attempt(&self) {
        bump(&self.handshakes_total, 1);
    }

    pub fn handshake_failed(&self) {
        bump(&self.handshakes_failed, 1);
    }

    pub fn message_sent(&self) {
        bump(&self.messages_sent, 1);
    }

    pub fn message_received(&self) {
        bump(&self.messages_received, 1);
    }

    pub fn message_dropped(&self) {
        bump(&self.messages_dropped, 1);
    }

    pub fn datagram_sent(&self, len: usize) {
        bump(&self.datagrams_sent, 1);
        bump(&self.bytes_sent, len as u64);
    }

    pub fn datagram_received(&self, len: usize) {
        bump(&self.datagrams_received, 1);
        bump(&self.bytes_received, len as u64);
    }

    pub fn retransmission(&self) {
        bump(&self.retransmissions, 1);
    }

    pub fn malformed(&self) {
        bump(&self.malformed_dropped, 1);
    }

    pub fn auth_failure(&self) {
        bump(&self.auth_failures, 1);
    }

    pub fn replay_dropped(&self) {
        bump(&self.replays_dropped, 1);
    }

    pub fn replay_cache_hit(&self) {
        bump(&self.replay_cache_hits, 1);
    }

    pub fn connection_error(&self) {
        bump(&self.connection_errors, 1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
