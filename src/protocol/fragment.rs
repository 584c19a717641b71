//! Fragmentation and reassembly.
//!
//! Messages larger than one datagram's usable payload are cut into equal-size fragments
//! (the last one shorter) sharing a message id. The receiver buffers fragments per
//! `(channel, message id)` until all of them are present.
//!
//! ## Limits
//! Reliable and unreliable partial messages are accounted separately, so a flood of
//! never-completed unreliable messages cannot push out reliable data.
//!
//! - An unreliable partial message is dropped once it is older than the unreliable
//!   timeout; its missing fragments will never be resent.
//! - A reliable partial message is dropped only after going without a new fragment for
//!   the reliable stall timeout. Every fragment the receiver stored has already been
//!   acknowledged, so the sender will not resend it; this timeout must outlast the
//!   sender's whole retransmission schedule.
//! - The bytes buffered by each class may not exceed that class's budget.

use crate::config::UdpcConfig;
use crate::core::packet::HEADER_SIZE;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{Channel, FRAME_HEADER_SIZE};
use crate::utils::crypto::TAG_SIZE;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Application bytes that fit in one datagram of `max_datagram_size`.
pub fn fragment_capacity(max_datagram_size: usize) -> usize {
    max_datagram_size.saturating_sub(HEADER_SIZE + TAG_SIZE + FRAME_HEADER_SIZE)
}

/// Cut a message into fragments of at most `capacity` bytes.
pub fn split(message: &Bytes, capacity: usize) -> Result<Vec<Bytes>> {
    if message.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if capacity == 0 {
        return Err(ProtocolError::MessageTooLarge(message.len()));
    }
    let count = message.len().div_ceil(capacity);
    if count > usize::from(u16::MAX) {
        return Err(ProtocolError::MessageTooLarge(message.len()));
    }
    Ok((0..count)
        .map(|i| {
            let start = i * capacity;
            let end = (start + capacity).min(message.len());
            message.slice(start..end)
        })
        .collect())
}

/// Bounds applied to one connection's reassembly buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_message_size: usize,
    pub reliable_budget: usize,
    pub unreliable_budget: usize,
    /// Age from the first fragment at which an unreliable partial message is dropped.
    pub unreliable_timeout: Duration,
    /// Time without a new fragment after which a reliable partial message is dropped.
    pub reliable_stall_timeout: Duration,
}

impl ReassemblyLimits {
    pub fn from_config(config: &UdpcConfig) -> Self {
        let fragmentation = &config.fragmentation;
        Self {
            max_message_size: fragmentation.max_message_size,
            reliable_budget: fragmentation.reassembly_budget,
            unreliable_budget: fragmentation.unreliable_reassembly_budget,
            unreliable_timeout: fragmentation.reassembly_timeout,
            reliable_stall_timeout: fragmentation
                .reassembly_timeout
                .max(config.reliability.retransmission_span()),
        }
    }
}

#[derive(Debug)]
struct Partial {
    fragments: Vec<Option<Bytes>>,
    received: usize,
    bytes: usize,
    first_seen: Instant,
    last_progress: Instant,
}

/// Per-connection reassembly buffers.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<(Channel, u32), Partial>,
    reliable_buffered: usize,
    unreliable_buffered: usize,
    limits: ReassemblyLimits,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            partials: HashMap::new(),
            reliable_buffered: 0,
            unreliable_buffered: 0,
            limits,
        }
    }

    /// Bytes buffered and budget of the class `channel` belongs to.
    fn usage(&self, channel: Channel) -> (usize, usize) {
        if channel.is_reliable() {
            (self.reliable_buffered, self.limits.reliable_budget)
        } else {
            (self.unreliable_buffered, self.limits.unreliable_budget)
        }
    }

    fn buffered_mut(&mut self, channel: Channel) -> &mut usize {
        if channel.is_reliable() {
            &mut self.reliable_buffered
        } else {
            &mut self.unreliable_buffered
        }
    }

    /// Add one fragment. Returns the full message once every fragment is present.
    ///
    /// Fails with `ReassemblyOverflow` when the message outgrows the maximum message size
    /// or its class's budget; the partial message is discarded in that case.
    pub fn insert(
        &mut self,
        channel: Channel,
        message_id: u32,
        index: u16,
        count: u16,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Bytes>> {
        if count <= 1 {
            if data.len() > self.limits.max_message_size {
                return Err(ProtocolError::ReassemblyOverflow);
            }
            return Ok(Some(Bytes::copy_from_slice(data)));
        }

        let key = (channel, message_id);
        let (buffered, budget) = self.usage(channel);
        let max_message_size = self.limits.max_message_size;
        let partial = self.partials.entry(key).or_insert_with(|| Partial {
            fragments: vec![None; usize::from(count)],
            received: 0,
            bytes: 0,
            first_seen: now,
            last_progress: now,
        });

        if partial.fragments.len() != usize::from(count) {
            return Err(ProtocolError::MalformedPacket(
                constants::ERR_FRAGMENT_MISMATCH,
            ));
        }
        let slot = &mut partial.fragments[usize::from(index)];
        if slot.is_some() {
            return Ok(None);
        }

        if partial.bytes + data.len() > max_message_size || buffered + data.len() > budget {
            debug!(?channel, message_id, "Reassembly limits exceeded, dropping message");
            self.discard(channel, message_id);
            return Err(ProtocolError::ReassemblyOverflow);
        }

        *slot = Some(Bytes::copy_from_slice(data));
        partial.received += 1;
        partial.bytes += data.len();
        partial.last_progress = now;
        let complete = partial.received == partial.fragments.len();
        *self.buffered_mut(channel) += data.len();

        if !complete {
            return Ok(None);
        }

        let Some(partial) = self.partials.remove(&key) else {
            return Ok(None);
        };
        *self.buffered_mut(channel) -= partial.bytes;
        let mut message = BytesMut::with_capacity(partial.bytes);
        for fragment in partial.fragments.into_iter().flatten() {
            message.extend_from_slice(&fragment);
        }
        Ok(Some(message.freeze()))
    }

    /// Drop a partial message.
    pub fn discard(&mut self, channel: Channel, message_id: u32) {
        if let Some(partial) = self.partials.remove(&(channel, message_id)) {
            *self.buffered_mut(channel) -= partial.bytes;
        }
    }

    /// Drop every partial message past its timeout, returning their keys.
    pub fn expire(&mut self, now: Instant) -> Vec<(Channel, u32)> {
        let limits = self.limits;
        let expired: Vec<(Channel, u32)> = self
            .partials
            .iter()
            .filter(|((channel, _), p)| {
                if channel.is_reliable() {
                    now.saturating_duration_since(p.last_progress) >= limits.reliable_stall_timeout
                } else {
                    now.saturating_duration_since(p.first_seen) >= limits.unreliable_timeout
                }
            })
            .map(|(key, _)| *key)
            .collect();
        for (channel, message_id) in &expired {
            self.discard(*channel, *message_id);
        }
        expired
    }

    /// Bytes currently buffered across both classes.
    pub fn buffered(&self) -> usize {
        self.reliable_buffered + self.unreliable_buffered
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CAP: usize = 4;

    fn limits() -> ReassemblyLimits {
        ReassemblyLimits {
            max_message_size: 64,
            reliable_budget: 32,
            unreliable_budget: 32,
            unreliable_timeout: Duration::from_secs(5),
            reliable_stall_timeout: Duration::from_secs(5),
        }
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(limits())
    }

    #[test]
    fn test_capacity_accounts_for_overhead() {
        assert_eq!(fragment_capacity(1200), 1200 - 28 - 16 - 5);
        assert_eq!(fragment_capacity(10), 0);
    }

    #[test]
    fn test_split_sizes() {
        let message = Bytes::from_static(b"0123456789");
        let parts = split(&message, CAP).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(&parts[2][..], b"89");
        assert!(matches!(
            split(&Bytes::new(), CAP),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn test_reassembles_out_of_order_with_duplicates() {
        let mut r = reassembler();
        let now = Instant::now();
        let message = Bytes::from_static(b"0123456789");
        let parts = split(&message, CAP).unwrap();
        let c = Channel::ReliableOrdered;

        assert!(r.insert(c, 1, 2, 3, &parts[2], now).unwrap().is_none());
        assert!(r.insert(c, 1, 0, 3, &parts[0], now).unwrap().is_none());
        assert!(r.insert(c, 1, 0, 3, &parts[0], now).unwrap().is_none());
        let out = r.insert(c, 1, 1, 3, &parts[1], now).unwrap();
        assert_eq!(out, Some(message));
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_budget_overflow_discards_partial() {
        let mut r = reassembler();
        let now = Instant::now();
        let chunk = [0u8; 12];
        let c = Channel::ReliableUnordered;
        assert!(r.insert(c, 1, 0, 4, &chunk, now).unwrap().is_none());
        assert!(r.insert(c, 2, 0, 4, &chunk, now).unwrap().is_none());
        assert!(matches!(
            r.insert(c, 3, 0, 4, &chunk, now),
            Err(ProtocolError::ReassemblyOverflow)
        ));
        assert_eq!(r.buffered(), 24);
        assert_eq!(r.pending(), 2);
    }

    #[test]
    fn test_unreliable_flood_leaves_reliable_budget_alone() {
        let mut r = reassembler();
        let now = Instant::now();
        let chunk = [0u8; 12];
        let u = Channel::Unreliable;
        r.insert(u, 1, 0, 4, &chunk, now).unwrap();
        r.insert(u, 2, 0, 4, &chunk, now).unwrap();
        assert!(matches!(
            r.insert(u, 3, 0, 4, &chunk, now),
            Err(ProtocolError::ReassemblyOverflow)
        ));

        let c = Channel::ReliableOrdered;
        assert!(r.insert(c, 1, 0, 2, &chunk, now).unwrap().is_none());
        assert!(r.insert(c, 1, 1, 2, &chunk, now).unwrap().is_some());
        assert_eq!(r.buffered(), 24);
    }

    #[test]
    fn test_fragment_count_mismatch() {
        let mut r = reassembler();
        let now = Instant::now();
        let c = Channel::Unreliable;
        r.insert(c, 1, 0, 3, b"ab", now).unwrap();
        assert!(matches!(
            r.insert(c, 1, 1, 4, b"cd", now),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unreliable_partials_expire_by_age() {
        let mut r = reassembler();
        let now = Instant::now();
        let u = Channel::Unreliable;
        r.insert(u, 1, 0, 3, b"ab", now).unwrap();
        r.insert(u, 1, 1, 3, b"cd", now + Duration::from_secs(4)).unwrap();
        r.insert(u, 2, 0, 2, b"ef", now + Duration::from_secs(4)).unwrap();

        let expired = r.expire(now + Duration::from_secs(5));
        assert_eq!(expired, vec![(u, 1)]);
        assert_eq!(r.pending(), 1);
        assert_eq!(r.buffered(), 2);
    }

    #[test]
    fn test_reliable_partials_expire_only_when_stalled() {
        let mut r = reassembler();
        let now = Instant::now();
        let c = Channel::ReliableOrdered;
        r.insert(c, 1, 0, 3, b"ab", now).unwrap();
        r.insert(c, 1, 2, 3, b"ef", now + Duration::from_secs(4)).unwrap();

        assert!(r.expire(now + Duration::from_secs(8)).is_empty());
        let out = r.insert(c, 1, 1, 3, b"cd", now + Duration::from_secs(8)).unwrap();
        assert_eq!(out, Some(Bytes::from_static(b"abcdef")));

        r.insert(c, 2, 0, 2, b"gh", now).unwrap();
        assert_eq!(r.expire(now + Duration::from_secs(5)), vec![(c, 2)]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_stall_timeout_covers_retransmission_schedule() {
        let config = UdpcConfig::default();
        let limits = ReassemblyLimits::from_config(&config);
        assert_eq!(limits.unreliable_timeout, config.fragmentation.reassembly_timeout);
        assert!(limits.reliable_stall_timeout >= config.reliability.retransmission_span());
        assert!(limits.reliable_stall_timeout > limits.unreliable_timeout);
    }
}
