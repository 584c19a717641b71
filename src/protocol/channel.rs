//! Channels and the data frame.
//!
//! A connection multiplexes three channels with different delivery guarantees. Every
//! data datagram carries a small frame inside its encrypted payload:
//!
//! ```text
//! [Channel(1)] [MessageId(4)] [Fragment bytes...]
//! ```
//!
//! Message ids are assigned per channel and wrap. Reliable channels track which ids were
//! already consumed so a retransmitted message is never delivered twice; the ordered
//! channel additionally holds completed messages until every earlier id is consumed.
//! Senders keep at most [`MESSAGE_WINDOW`] reliable messages in flight per channel so
//! both sides agree on how to interpret a wrapped id.

use crate::core::sequence::{sequence_distance, sequence_less_than};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::collections::{HashMap, VecDeque};

/// Bytes of frame header inside each data payload.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Reliable messages a sender may have outstanding per channel.
pub const MESSAGE_WINDOW: u32 = 1024;

/// Delivery guarantee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Channel {
    /// At most once, in any order, never retransmitted.
    Unreliable = 0,
    /// Exactly once, in any order.
    ReliableUnordered = 1,
    /// Exactly once, in send order.
    ReliableOrdered = 2,
}

impl Channel {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Channel::Unreliable),
            1 => Ok(Channel::ReliableUnordered),
            2 => Ok(Channel::ReliableOrdered),
            _ => Err(ProtocolError::MalformedPacket(constants::ERR_UNKNOWN_CHANNEL)),
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_reliable(self) -> bool {
        !matches!(self, Channel::Unreliable)
    }

    #[inline]
    pub fn is_ordered(self) -> bool {
        matches!(self, Channel::ReliableOrdered)
    }
}

/// Build the plaintext body of a data datagram.
pub fn encode_frame(channel: Channel, message_id: u32, fragment: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + fragment.len());
    out.put_u8(channel.as_u8());
    out.put_u32(message_id);
    out.put_slice(fragment);
    out
}

/// Split a decrypted data body into its channel, message id and fragment bytes.
pub fn decode_frame(body: &[u8]) -> Result<(Channel, u32, &[u8])> {
    if body.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::MalformedPacket(constants::ERR_SHORT_FRAME));
    }
    let mut buf = body;
    let channel = Channel::from_u8(buf.get_u8())?;
    let message_id = buf.get_u32();
    Ok((channel, message_id, buf))
}

/// Receive-side message bookkeeping of one reliable channel.
#[derive(Debug)]
pub struct InboundChannel {
    ordered: bool,
    /// Every id before `base` is consumed.
    base: u32,
    /// Ids at or after `base` that are consumed (`None`) or complete and waiting for
    /// earlier ids (`Some`, ordered channel only).
    ahead: HashMap<u32, Option<Bytes>>,
}

impl InboundChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            ordered: channel.is_ordered(),
            base: 0,
            ahead: HashMap::new(),
        }
    }

    /// Whether the id lies in the range the sender may currently use.
    pub fn in_window(&self, message_id: u32) -> bool {
        sequence_distance(self.base, message_id) < MESSAGE_WINDOW
    }

    /// Whether the message was already delivered, discarded or is waiting for delivery.
    pub fn is_duplicate(&self, message_id: u32) -> bool {
        sequence_less_than(message_id, self.base) || self.ahead.contains_key(&message_id)
    }

    /// Record a complete message; returns the messages now deliverable, in order.
    pub fn complete(&mut self, message_id: u32, payload: Bytes) -> Vec<Bytes> {
        if self.is_duplicate(message_id) || !self.in_window(message_id) {
            return Vec::new();
        }
        if self.ordered {
            self.ahead.insert(message_id, Some(payload));
            self.advance()
        } else {
            self.ahead.insert(message_id, None);
            self.advance();
            vec![payload]
        }
    }

    /// Mark a message as consumed without delivering it.
    ///
    /// Returns ordered messages released because they were only waiting on this id.
    pub fn discard(&mut self, message_id: u32) -> Vec<Bytes> {
        if self.is_duplicate(message_id) || !self.in_window(message_id) {
            return Vec::new();
        }
        self.ahead.insert(message_id, None);
        self.advance()
    }

    fn advance(&mut self) -> Vec<Bytes> {
        let mut released = Vec::new();
        while let Some(entry) = self.ahead.remove(&self.base) {
            if let Some(payload) = entry {
                released.push(payload);
            }
            self.base = self.base.wrapping_add(1);
        }
        released
    }
}

/// Send-side message id allocation and in-flight window of one channel.
#[derive(Debug, Default)]
pub struct OutboundChannel {
    next_message_id: u32,
    /// Reliable message ids with unacknowledged fragments, oldest first.
    in_flight: VecDeque<u32>,
    /// Unacknowledged fragments and total size of each in-flight message.
    remaining: HashMap<u32, (u16, usize)>,
    in_flight_bytes: usize,
}

impl OutboundChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the id of the next message.
    pub fn allocate(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Whether a reliable message with this id may be put on the wire.
    pub fn admits(&self, message_id: u32) -> bool {
        match self.in_flight.front() {
            Some(&oldest) => sequence_distance(oldest, message_id) < MESSAGE_WINDOW,
            None => true,
        }
    }

    /// Start tracking a reliable message of `len` bytes cut into `fragment_count` fragments.
    pub fn track(&mut self, message_id: u32, fragment_count: u16, len: usize) {
        if self
            .remaining
            .insert(message_id, (fragment_count, len))
            .is_none()
        {
            self.in_flight.push_back(message_id);
            self.in_flight_bytes += len;
        }
    }

    /// A fragment of the message was acknowledged. Returns true when the whole message is.
    pub fn fragment_acked(&mut self, message_id: u32) -> bool {
        let done = match self.remaining.get_mut(&message_id) {
            Some((remaining, _)) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => return false,
        };
        if done {
            if let Some((_, len)) = self.remaining.remove(&message_id) {
                self.in_flight_bytes -= len;
            }
            while let Some(front) = self.in_flight.front() {
                if self.remaining.contains_key(front) {
                    break;
                }
                self.in_flight.pop_front();
            }
        }
        done
    }

    /// Reliable messages not yet fully acknowledged.
    pub fn in_flight(&self) -> usize {
        self.remaining.len()
    }

    /// Total size of the reliable messages not yet fully acknowledged.
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_frame_roundtrip_and_validation() {
        let body = encode_frame(Channel::ReliableOrdered, 77, b"abc");
        let (channel, id, fragment) = decode_frame(&body).unwrap();
        assert_eq!(channel, Channel::ReliableOrdered);
        assert_eq!(id, 77);
        assert_eq!(fragment, b"abc");

        assert!(decode_frame(&body[..4]).is_err());
        let mut bad = body.clone();
        bad[0] = 9;
        assert!(decode_frame(&bad).is_err());
    }

    #[test]
    fn test_ordered_holds_back_until_gap_filled() {
        let mut inbound = InboundChannel::new(Channel::ReliableOrdered);
        assert!(inbound.complete(1, msg("b")).is_empty());
        assert!(inbound.complete(2, msg("c")).is_empty());
        assert!(inbound.is_duplicate(2));
        assert_eq!(
            inbound.complete(0, msg("a")),
            vec![msg("a"), msg("b"), msg("c")]
        );
        assert!(inbound.is_duplicate(1));
        assert!(inbound.complete(1, msg("b")).is_empty());
    }

    #[test]
    fn test_unordered_delivers_immediately_once() {
        let mut inbound = InboundChannel::new(Channel::ReliableUnordered);
        assert_eq!(inbound.complete(3, msg("d")), vec![msg("d")]);
        assert!(inbound.complete(3, msg("d")).is_empty());
        assert_eq!(inbound.complete(0, msg("a")), vec![msg("a")]);
        assert!(inbound.is_duplicate(0));
        assert!(!inbound.is_duplicate(1));
    }

    #[test]
    fn test_discard_unblocks_ordered_delivery() {
        let mut inbound = InboundChannel::new(Channel::ReliableOrdered);
        assert!(inbound.complete(1, msg("b")).is_empty());
        assert_eq!(inbound.discard(0), vec![msg("b")]);
        assert!(inbound.is_duplicate(0));
    }

    #[test]
    fn test_ids_wrap() {
        let mut inbound = InboundChannel::new(Channel::ReliableOrdered);
        inbound.base = u32::MAX;
        assert!(inbound.complete(0, msg("b")).is_empty());
        assert_eq!(
            inbound.complete(u32::MAX, msg("a")),
            vec![msg("a"), msg("b")]
        );
        assert!(inbound.is_duplicate(u32::MAX));
        assert!(!inbound.in_window(MESSAGE_WINDOW + 1));
    }

    #[test]
    fn test_outbound_window() {
        let mut outbound = OutboundChannel::new();
        let first = outbound.allocate();
        outbound.track(first, 2, 100);
        for _ in 1..MESSAGE_WINDOW {
            let id = outbound.allocate();
            assert!(outbound.admits(id));
            outbound.track(id, 1, 10);
        }
        let blocked = outbound.allocate();
        assert!(!outbound.admits(blocked));
        assert_eq!(outbound.in_flight(), MESSAGE_WINDOW as usize);

        assert!(!outbound.fragment_acked(first));
        assert_eq!(outbound.in_flight_bytes(), 100 + 10 * (MESSAGE_WINDOW as usize - 1));
        assert!(outbound.fragment_acked(first));
        assert!(outbound.admits(blocked));
        assert_eq!(outbound.in_flight(), MESSAGE_WINDOW as usize - 1);
        assert_eq!(outbound.in_flight_bytes(), 10 * (MESSAGE_WINDOW as usize - 1));
    }
}
