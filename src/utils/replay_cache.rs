//! Handshake replay cache.
//!
//! Handshake requests travel in the clear and carry a random nonce plus a wall-clock
//! timestamp. The timestamp window alone bounds how long a captured request stays
//! usable; this cache closes the remaining gap by remembering every (nonce, timestamp)
//! pair seen within the window. The source address is not part of the key, so a captured
//! request resent from another address is still caught.
//!
//! Entries age out after a TTL. When full, the oldest entry makes room for the newest.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// One remembered handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub nonce: [u8; 16],
    pub timestamp: u64,
}

#[derive(Debug)]
pub struct ReplayCache {
    seen: HashSet<CacheKey>,
    /// Arrival time of each key, oldest first.
    arrivals: VecDeque<(Instant, CacheKey)>,
    ttl: Duration,
    capacity: usize,
}

impl ReplayCache {
    pub fn with_settings(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            arrivals: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record a request and report whether the exact same request was already seen.
    #[instrument(level = "trace", skip(self, nonce))]
    pub fn is_replay(
        &mut self,
        peer: SocketAddr,
        nonce: &[u8; 16],
        timestamp: u64,
        now: Instant,
    ) -> bool {
        self.expire(now);

        let key = CacheKey {
            nonce: *nonce,
            timestamp,
        };
        if self.seen.contains(&key) {
            warn!(%peer, timestamp, "Replayed handshake request detected");
            return true;
        }

        if self.seen.len() >= self.capacity {
            if let Some((_, oldest)) = self.arrivals.pop_front() {
                self.seen.remove(&oldest);
                debug!(capacity = self.capacity, "Replay cache full, evicted oldest entry");
            }
        }
        self.seen.insert(key);
        self.arrivals.push_back((now, key));
        false
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(arrived, key)) = self.arrivals.front() {
            if now.saturating_duration_since(arrived) < self.ttl {
                break;
            }
            self.arrivals.pop_front();
            self.seen.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.arrivals.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::with_settings(Duration::from_secs(300), 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[test]
    fn test_same_request_twice_is_replay() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let now = Instant::now();

        assert!(!cache.is_replay(peer(), &[1u8; 16], 1234, now));
        assert!(cache.is_replay(peer(), &[1u8; 16], 1234, now));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_differing_nonce_or_timestamp_is_fresh() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let now = Instant::now();

        assert!(!cache.is_replay(peer(), &[1u8; 16], 1234, now));
        assert!(!cache.is_replay(peer(), &[2u8; 16], 1234, now));
        assert!(!cache.is_replay(peer(), &[1u8; 16], 1235, now));
    }

    #[test]
    fn test_replay_from_another_address_is_caught() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let now = Instant::now();
        let other = SocketAddr::from(([10, 0, 0, 9], 5555));

        assert!(!cache.is_replay(peer(), &[1u8; 16], 1234, now));
        assert!(cache.is_replay(other, &[1u8; 16], 1234, now));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entries_age_out() {
        let mut cache = ReplayCache::with_settings(Duration::from_millis(10), 100);
        let now = Instant::now();

        assert!(!cache.is_replay(peer(), &[1u8; 16], 1234, now));
        let later = now + Duration::from_millis(20);
        assert!(!cache.is_replay(peer(), &[1u8; 16], 1234, later));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 5);
        let now = Instant::now();

        for i in 0..10u8 {
            assert!(!cache.is_replay(peer(), &[i; 16], 1000, now));
        }
        assert_eq!(cache.len(), 5);
        // The first request was evicted and would be accepted again.
        assert!(!cache.is_replay(peer(), &[0u8; 16], 1000, now));
        assert!(cache.is_replay(peer(), &[9u8; 16], 1000, now));
    }
}
