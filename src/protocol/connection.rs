//! # Connection State Machine
//!
//! Per-peer protocol state, free of any I/O. A [`Connection`] is fed datagrams and clock
//! ticks and produces datagrams to transmit, delivered messages and events; the endpoint
//! owning it moves bytes to and from the socket.
//!
//! ## States
//! ```text
//! Idle ─▶ Handshaking ─▶ Connected ─▶ Disconnecting ─▶ Closed
//!              │             │              │
//!              └─────────────┴──────────────┴─▶ Failed
//! ```
//!
//! - Handshake datagrams are retransmitted on a fixed interval until answered or the retry
//!   budget runs out (`HandshakeTimeout`). A response that fails verification fails the
//!   connection with `HandshakeRejected`.
//! - While connected, every flush emits fresh data first, then due retransmissions, and
//!   falls back to an ack-only datagram when there is something to acknowledge or the
//!   link has been idle for the heartbeat interval.
//! - Hearing nothing for the inactivity timeout fails the connection.
//! - A local disconnect drains queued reliable data for a bounded time, then tells the
//!   peer. A remote disconnect closes immediately.
//!
//! Datagrams that fail decoding, authentication or the replay window are reported as
//! errors to the caller, which drops them; they never change connection state.

use crate::config::UdpcConfig;
use crate::core::packet::{self, Flags, Header};
use crate::core::sequence::{extend_counter, truncate_counter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::{decode_frame, encode_frame, Channel, InboundChannel, OutboundChannel};
use crate::protocol::fragment::{fragment_capacity, split, ReassemblyLimits, Reassembler};
use crate::protocol::handshake::{
    client_handshake_init, client_handshake_verify, server_handshake_finalize,
    server_handshake_response, Authenticator, ClientHandshakeState, HandshakeConfirm,
    HandshakeRequest, HandshakeResponse, ServerHandshakeState,
};
use crate::protocol::reliability::{
    FlowControl, OutboundUnit, ReliabilityEngine, SendMode, UnitKey,
};
use crate::utils::crypto::{SessionCipher, TAG_SIZE};
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

/// Why a connection ended without a protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application disconnected.
    Local,
    /// The peer sent a disconnect.
    Remote,
    /// Nothing was heard from the peer for the inactivity timeout.
    Timeout,
}

/// Notifications a connection raises for the application.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(DisconnectReason),
    Failed(ProtocolError),
    MessageDropped {
        channel: Channel,
        error: ProtocolError,
    },
    ModeChanged(SendMode),
}

enum Phase {
    Idle,
    Initiating {
        state: Option<ClientHandshakeState>,
        request_nonce: [u8; 16],
        request: Bytes,
        retries: u32,
        last_sent: Instant,
    },
    Responding {
        state: ServerHandshakeState,
        request_nonce: [u8; 16],
        response: Bytes,
        retries: u32,
        last_sent: Instant,
    },
    Connected,
    Disconnecting {
        deadline: Instant,
    },
    Closed,
    Failed,
}

#[derive(Debug)]
struct QueuedMessage {
    channel: Channel,
    message_id: u32,
    len: usize,
    fragments: Vec<Bytes>,
    next: usize,
}

pub struct Connection {
    local_id: u32,
    remote_id: u32,
    peer: SocketAddr,
    /// Handshake role: this side sent the request.
    initiator: bool,
    /// The local application asked for this connection.
    initiated_locally: bool,
    /// Identity key the peer proved, or the one it must prove when pinned.
    peer_identity: Option<[u8; 32]>,
    phase: Phase,
    config: Arc<UdpcConfig>,
    metrics: Arc<Metrics>,
    cipher: Option<SessionCipher>,
    /// Initiator's sealed confirmation, resent when the response is repeated.
    confirm: Option<Bytes>,
    reliability: ReliabilityEngine,
    flow: FlowControl,
    reassembler: Reassembler,
    ordered: InboundChannel,
    unordered: InboundChannel,
    outbound: [OutboundChannel; 3],
    send_queue: VecDeque<QueuedMessage>,
    fragment_capacity: usize,
    last_received: Instant,
    last_sent: Instant,
    next_flush: Instant,
    ack_pending: bool,
    transmits: VecDeque<Bytes>,
    delivered: VecDeque<(Channel, Bytes)>,
    events: VecDeque<ConnectionEvent>,
}

fn handshake_datagram(connection_id: u32, body: &[u8]) -> Result<Bytes> {
    packet::encode(&Header::new(connection_id, 0, Flags::HANDSHAKE), body)
}

fn sealed_len(body_len: usize) -> Result<u16> {
    u16::try_from(body_len + TAG_SIZE)
        .map_err(|_| ProtocolError::MalformedPacket(constants::ERR_PAYLOAD_TOO_LONG))
}

impl Connection {
    fn with_parts(
        config: Arc<UdpcConfig>,
        metrics: Arc<Metrics>,
        local_id: u32,
        peer: SocketAddr,
        initiator: bool,
        now: Instant,
    ) -> Self {
        Self {
            local_id,
            remote_id: 0,
            peer,
            initiator,
            initiated_locally: initiator,
            peer_identity: None,
            phase: Phase::Idle,
            cipher: None,
            confirm: None,
            reliability: ReliabilityEngine::new(&config.reliability),
            flow: FlowControl::new(&config.reliability, now),
            reassembler: Reassembler::new(ReassemblyLimits::from_config(&config)),
            ordered: InboundChannel::new(Channel::ReliableOrdered),
            unordered: InboundChannel::new(Channel::ReliableUnordered),
            outbound: Default::default(),
            send_queue: VecDeque::new(),
            fragment_capacity: fragment_capacity(config.reliability.max_datagram_size),
            last_received: now,
            last_sent: now,
            next_flush: now,
            ack_pending: false,
            transmits: VecDeque::new(),
            delivered: VecDeque::new(),
            events: VecDeque::new(),
            config,
            metrics,
        }
    }

    /// Start a handshake towards `peer`. The request is queued for transmission.
    ///
    /// With `expected_identity` set, the handshake fails unless the peer proves it holds
    /// that identity key.
    pub fn initiate(
        config: Arc<UdpcConfig>,
        metrics: Arc<Metrics>,
        auth: &Authenticator,
        local_id: u32,
        peer: SocketAddr,
        expected_identity: Option<[u8; 32]>,
        now: Instant,
    ) -> Result<Self> {
        let (state, request) = client_handshake_init(auth, local_id, expected_identity)?;
        let datagram = handshake_datagram(0, &request.to_vec())?;

        metrics.handshake_attempt();
        let mut conn = Self::with_parts(config, metrics, local_id, peer, true, now);
        conn.peer_identity = expected_identity;
        conn.phase = Phase::Initiating {
            state: Some(state),
            request_nonce: request.nonce,
            request: datagram.clone(),
            retries: 0,
            last_sent: now,
        };
        conn.transmits.push_back(datagram);
        debug!(local_id, %peer, "Connection request queued");
        Ok(conn)
    }

    /// Answer a handshake request from `peer`. The response is queued for transmission.
    #[allow(clippy::too_many_arguments)]
    pub fn accept(
        config: Arc<UdpcConfig>,
        metrics: Arc<Metrics>,
        auth: &Authenticator,
        replay_cache: &mut ReplayCache,
        local_id: u32,
        peer: SocketAddr,
        request: &HandshakeRequest,
        now: Instant,
    ) -> Result<Self> {
        metrics.handshake_attempt();
        let (state, response, keys) = match server_handshake_response(
            auth,
            request,
            local_id,
            peer,
            replay_cache,
            config.security.handshake_max_age,
            now,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                metrics.handshake_failed();
                return Err(e);
            }
        };
        let datagram = handshake_datagram(request.connection_id, &response.to_vec())?;

        let mut conn = Self::with_parts(config, metrics, local_id, peer, false, now);
        conn.remote_id = request.connection_id;
        conn.peer_identity = Some(request.identity).filter(|id| id.iter().any(|&b| b != 0));
        conn.cipher = Some(SessionCipher::new(&keys, false));
        conn.phase = Phase::Responding {
            state,
            request_nonce: request.nonce,
            response: datagram.clone(),
            retries: 0,
            last_sent: now,
        };
        conn.transmits.push_back(datagram);
        debug!(local_id, %peer, remote_id = conn.remote_id, "Handshake response queued");
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Idle => ConnectionState::Idle,
            Phase::Initiating { .. } | Phase::Responding { .. } => ConnectionState::Handshaking,
            Phase::Connected => ConnectionState::Connected,
            Phase::Disconnecting { .. } => ConnectionState::Disconnecting,
            Phase::Closed => ConnectionState::Closed,
            Phase::Failed => ConnectionState::Failed,
        }
    }

    /// Closed or failed; the owner may release the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Closed | Phase::Failed)
    }

    /// Whether the application has been told about this connection.
    fn is_surfaced(&self) -> bool {
        self.initiated_locally || matches!(self.phase, Phase::Connected | Phase::Disconnecting { .. })
    }

    /// Whether this side should abandon its own handshake and answer `request` instead.
    ///
    /// When both peers connect to each other at once, each one's request reaches a
    /// connection that is itself initiating. The side whose request nonce is lower
    /// yields and becomes the responder; the other keeps initiating.
    pub fn yields_to(&self, request: &HandshakeRequest) -> bool {
        matches!(&self.phase, Phase::Initiating { request_nonce, .. } if request.nonce < *request_nonce)
    }

    /// Report this responder connection as one the local application asked for.
    pub fn mark_initiated_locally(&mut self) {
        self.initiated_locally = true;
    }

    /// Handle a repeated request from the peer while the handshake is in progress.
    pub fn handle_repeated_request(&mut self, request: &HandshakeRequest) {
        if let Phase::Responding {
            request_nonce,
            response,
            ..
        } = &self.phase
        {
            if *request_nonce == request.nonce {
                trace!(local_id = self.local_id, "Resending handshake response");
                self.transmits.push_back(response.clone());
            }
        }
    }

    /// Process one decoded datagram addressed to this connection.
    pub fn handle_datagram(
        &mut self,
        auth: &Authenticator,
        header: &Header,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        if header.flags.contains(Flags::HANDSHAKE) {
            return if self.initiator {
                self.handle_response(auth, payload, now)
            } else {
                self.handle_confirm(auth, header, payload, now)
            };
        }

        match &self.phase {
            Phase::Connected | Phase::Disconnecting { .. } => {}
            Phase::Responding { state, .. } if !state.requires_confirmation() => {}
            _ => return Err(ProtocolError::NotConnected),
        }

        if header.flags.contains(Flags::FRAGMENT) != (header.fragment_count > 1) {
            return Err(ProtocolError::MalformedPacket(constants::ERR_FRAGMENT_BOUNDS));
        }

        let plaintext = self.open(header, payload, now)?;
        self.apply_acks(header, now);

        if matches!(self.phase, Phase::Responding { .. }) {
            self.establish(now);
        }

        if header.flags.contains(Flags::DATA) {
            self.ack_pending = true;
            self.receive_data(header, &plaintext, now)?;
        } else if header.flags.contains(Flags::DISCONNECT) {
            self.close(DisconnectReason::Remote);
        }
        Ok(())
    }

    fn handle_response(&mut self, auth: &Authenticator, payload: &[u8], now: Instant) -> Result<()> {
        let response = HandshakeResponse::decode(payload)?;
        match &mut self.phase {
            Phase::Initiating { state, .. } => {
                let state = state
                    .take()
                    .ok_or(ProtocolError::Internal(constants::ERR_HANDSHAKE_STATE))?;
                match client_handshake_verify(auth, state, &response) {
                    Ok((keys, confirm)) => {
                        let cipher = SessionCipher::new(&keys, true);
                        self.remote_id = response.connection_id;
                        self.peer_identity =
                            Some(response.identity).filter(|id| id.iter().any(|&b| b != 0));

                        let body = confirm.to_vec();
                        let mut header = Header::new(self.remote_id, 0, Flags::HANDSHAKE);
                        header.payload_len = sealed_len(body.len())?;
                        let sealed = cipher.seal(0, &header.to_array(), &body)?;
                        let datagram = packet::encode(&header, &sealed)?;

                        self.cipher = Some(cipher);
                        self.confirm = Some(datagram.clone());
                        self.transmits.push_back(datagram);
                        self.last_received = now;
                        self.establish(now);
                    }
                    Err(e) => {
                        warn!(local_id = self.local_id, peer = %self.peer, error = %e, "Handshake response rejected");
                        self.fail(e);
                    }
                }
                Ok(())
            }
            Phase::Connected | Phase::Disconnecting { .. } => {
                if response.connection_id == self.remote_id {
                    if let Some(confirm) = &self.confirm {
                        trace!(local_id = self.local_id, "Resending handshake confirmation");
                        self.transmits.push_back(confirm.clone());
                    }
                }
                Ok(())
            }
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn handle_confirm(
        &mut self,
        auth: &Authenticator,
        header: &Header,
        payload: &[u8],
        now: Instant,
    ) -> Result<()> {
        if !matches!(self.phase, Phase::Responding { .. }) {
            return Err(ProtocolError::NotConnected);
        }
        let plaintext = self.open(header, payload, now)?;
        let confirm = HandshakeConfirm::decode(&plaintext)?;
        let verdict = match &self.phase {
            Phase::Responding { state, .. } => server_handshake_finalize(auth, state, &confirm),
            _ => return Err(ProtocolError::NotConnected),
        };
        match verdict {
            Ok(()) => self.establish(now),
            Err(e) => {
                warn!(local_id = self.local_id, peer = %self.peer, error = %e, "Handshake confirmation rejected");
                self.fail(e);
            }
        }
        Ok(())
    }

    /// Authenticate and decrypt, then record the counter in the receive window.
    fn open(&mut self, header: &Header, payload: &[u8], now: Instant) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::NotConnected)?;
        let window = self.reliability.window();
        let counter = extend_counter(window.expected(), header.sequence);
        window.check(counter)?;
        let plaintext = cipher.open(counter, &header.to_array(), payload)?;
        self.reliability.window_mut().record(counter);
        self.last_received = now;
        Ok(plaintext)
    }

    fn apply_acks(&mut self, header: &Header, now: Instant) {
        for key in self
            .reliability
            .process_acks(header.ack, header.ack_bits, now)
        {
            self.outbound[key.channel.index()].fragment_acked(key.message_id);
        }
    }

    fn inbound_mut(&mut self, channel: Channel) -> Option<&mut InboundChannel> {
        match channel {
            Channel::Unreliable => None,
            Channel::ReliableUnordered => Some(&mut self.unordered),
            Channel::ReliableOrdered => Some(&mut self.ordered),
        }
    }

    fn receive_data(&mut self, header: &Header, plaintext: &[u8], now: Instant) -> Result<()> {
        let (channel, message_id, fragment) = decode_frame(plaintext)?;

        if let Some(inbound) = self.inbound_mut(channel) {
            if inbound.is_duplicate(message_id) || !inbound.in_window(message_id) {
                trace!(?channel, message_id, "Ignoring already consumed message");
                return Ok(());
            }
        }

        match self.reassembler.insert(
            channel,
            message_id,
            header.fragment_index,
            header.fragment_count,
            fragment,
            now,
        ) {
            Ok(Some(message)) => self.deliver(channel, message_id, message),
            Ok(None) => {}
            Err(error @ ProtocolError::MalformedPacket(_)) => return Err(error),
            Err(error) => self.drop_message(channel, message_id, error),
        }
        Ok(())
    }

    fn deliver(&mut self, channel: Channel, message_id: u32, message: Bytes) {
        let ready = match self.inbound_mut(channel) {
            Some(inbound) => inbound.complete(message_id, message),
            None => vec![message],
        };
        self.push_delivered(channel, ready);
    }

    fn push_delivered(&mut self, channel: Channel, messages: Vec<Bytes>) {
        for message in messages {
            self.metrics.message_received();
            self.delivered.push_back((channel, message));
        }
    }

    fn drop_message(&mut self, channel: Channel, message_id: u32, error: ProtocolError) {
        debug!(local_id = self.local_id, ?channel, message_id, error = %error, "Message dropped");
        self.metrics.message_dropped();
        let released = match self.inbound_mut(channel) {
            Some(inbound) => inbound.discard(message_id),
            None => Vec::new(),
        };
        self.push_delivered(channel, released);
        self.events
            .push_back(ConnectionEvent::MessageDropped { channel, error });
    }

    fn establish(&mut self, now: Instant) {
        self.phase = Phase::Connected;
        self.next_flush = now;
        self.last_received = now;
        self.metrics.connection_established();
        self.events.push_back(ConnectionEvent::Connected);
        info!(
            local_id = self.local_id,
            remote_id = self.remote_id,
            peer = %self.peer,
            initiated_locally = self.initiated_locally,
            "Connection established"
        );
    }

    fn close(&mut self, reason: DisconnectReason) {
        let was_connected = matches!(self.phase, Phase::Connected | Phase::Disconnecting { .. });
        let surfaced = self.is_surfaced();
        if self.is_terminal() {
            return;
        }
        self.phase = Phase::Closed;
        if was_connected {
            self.metrics.connection_closed();
        }
        info!(local_id = self.local_id, peer = %self.peer, ?reason, "Connection closed");
        if surfaced {
            self.events
                .push_back(ConnectionEvent::Disconnected(reason));
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        let was_connected = matches!(self.phase, Phase::Connected | Phase::Disconnecting { .. });
        let surfaced = self.is_surfaced();
        if self.is_terminal() {
            return;
        }
        self.phase = Phase::Failed;
        if was_connected {
            self.metrics.connection_closed();
            self.metrics.connection_error();
        } else {
            self.metrics.handshake_failed();
        }
        warn!(local_id = self.local_id, peer = %self.peer, error = %error, "Connection failed");
        if surfaced {
            let event = match error {
                ProtocolError::InactivityTimeout => {
                    ConnectionEvent::Disconnected(DisconnectReason::Timeout)
                }
                other => ConnectionEvent::Failed(other),
            };
            self.events.push_back(event);
        }
    }

    /// Queue a message for transmission on `channel`.
    pub fn send(&mut self, channel: Channel, payload: Bytes) -> Result<()> {
        match self.phase {
            Phase::Initiating { .. } | Phase::Responding { .. } | Phase::Connected => {}
            Phase::Idle => return Err(ProtocolError::NotConnected),
            _ => return Err(ProtocolError::ConnectionClosed),
        }
        if payload.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        if payload.len() > self.config.fragmentation.max_message_size {
            return Err(ProtocolError::MessageTooLarge(payload.len()));
        }
        if self.send_queue.len() >= self.config.endpoint.max_send_queue {
            return Err(ProtocolError::QueueFull);
        }
        let fragments = split(&payload, self.fragment_capacity)?;
        let message_id = self.outbound[channel.index()].allocate();
        self.send_queue.push_back(QueuedMessage {
            channel,
            message_id,
            len: payload.len(),
            fragments,
            next: 0,
        });
        self.metrics.message_sent();
        Ok(())
    }

    /// Begin a local disconnect.
    ///
    /// A connected peer stops accepting new messages, drains queued reliable data for at
    /// most the drain timeout and then notifies the peer. A handshake is abandoned.
    pub fn disconnect(&mut self, now: Instant) {
        match self.phase {
            Phase::Connected => {
                let drain = self.config.reliability.disconnect_drain_timeout;
                self.phase = Phase::Disconnecting {
                    deadline: now + drain,
                };
                self.send_queue.retain(|m| m.channel.is_reliable());
                debug!(local_id = self.local_id, "Disconnecting");
            }
            Phase::Idle | Phase::Initiating { .. } | Phase::Responding { .. } => {
                self.close(DisconnectReason::Local);
            }
            _ => {}
        }
    }

    /// Drive timers: handshake retries, inactivity, reassembly expiry, retransmission,
    /// send pacing and heartbeats.
    pub fn tick(&mut self, now: Instant) {
        if matches!(self.phase, Phase::Connected | Phase::Disconnecting { .. }) {
            self.tick_established(now);
            return;
        }

        let retry_interval = self.config.reliability.handshake_retry_interval;
        let max_retries = self.config.reliability.handshake_max_retries;
        let resend = match &mut self.phase {
            Phase::Initiating {
                request: datagram,
                retries,
                last_sent,
                ..
            }
            | Phase::Responding {
                response: datagram,
                retries,
                last_sent,
                ..
            } => {
                if now.saturating_duration_since(*last_sent) < retry_interval {
                    return;
                }
                if *retries >= max_retries {
                    None
                } else {
                    *retries += 1;
                    *last_sent = now;
                    Some(datagram.clone())
                }
            }
            _ => return,
        };

        match resend {
            Some(datagram) => {
                trace!(local_id = self.local_id, "Retransmitting handshake");
                self.transmits.push_back(datagram);
            }
            None => self.fail(ProtocolError::HandshakeTimeout),
        }
    }

    fn tick_established(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_received) >= self.config.reliability.inactivity_timeout {
            self.fail(ProtocolError::InactivityTimeout);
            return;
        }

        for (channel, message_id) in self.reassembler.expire(now) {
            self.drop_message(channel, message_id, ProtocolError::ReassemblyTimeout);
        }

        if let Some(mode) = self.flow.update(self.reliability.rtt(), now) {
            debug!(local_id = self.local_id, ?mode, rtt_ms = self.reliability.rtt().as_millis() as u64, "Send mode changed");
            self.events.push_back(ConnectionEvent::ModeChanged(mode));
        }

        if let Phase::Disconnecting { deadline } = self.phase {
            let drained = !self.reliability.has_pending() && self.send_queue.is_empty();
            if drained || now >= deadline {
                if let Err(e) = self.emit(Flags::DISCONNECT, 0, 1, &[], None, now) {
                    debug!(local_id = self.local_id, error = %e, "Failed to send disconnect");
                }
                self.close(DisconnectReason::Local);
                return;
            }
        }

        if now < self.next_flush {
            return;
        }
        self.next_flush = now + self.flow.send_interval();

        if let Err(e) = self.flush(now) {
            self.fail(e);
        }
    }

    /// Whether a reliable message of `len` bytes fits beside the unacknowledged ones.
    ///
    /// Every fragment the peer acknowledged stays buffered there until its message is
    /// complete, so unacknowledged reliable bytes are kept within the reassembly budget.
    /// A message is always admitted when nothing else is in flight.
    fn reliable_bytes_admit(&self, len: usize) -> bool {
        let in_flight = self.in_flight_bytes();
        in_flight == 0 || in_flight + len <= self.config.fragmentation.reassembly_budget
    }

    /// Emit fresh data, then retransmissions, then an ack or heartbeat if nothing was sent.
    fn flush(&mut self, now: Instant) -> Result<()> {
        let burst = self.flow.burst();
        let mut emitted = 0usize;

        while emitted < burst {
            let Some(front) = self.send_queue.front() else {
                break;
            };
            let channel = front.channel;
            let message_id = front.message_id;
            let count = front.fragments.len() as u16;
            if channel.is_reliable() && front.next == 0 {
                let len = front.len;
                if !self.outbound[channel.index()].admits(message_id)
                    || !self.reliable_bytes_admit(len)
                {
                    break;
                }
                self.outbound[channel.index()].track(message_id, count, len);
            }
            let Some(front) = self.send_queue.front_mut() else {
                break;
            };
            let index = front.next;
            let fragment = front.fragments[index].clone();
            front.next += 1;
            if front.next == front.fragments.len() {
                self.send_queue.pop_front();
            }

            let body = Bytes::from(encode_frame(channel, message_id, &fragment));
            let key = UnitKey {
                channel,
                message_id,
                fragment_index: index as u16,
            };
            let mut flags = Flags::DATA;
            if count > 1 {
                flags = flags | Flags::FRAGMENT;
            }
            let reliable = channel.is_reliable();
            self.emit(flags, index as u16, count, &body, reliable.then_some(key), now)?;
            if reliable {
                self.reliability.track(
                    OutboundUnit {
                        key,
                        fragment_count: count,
                        body,
                    },
                    now,
                );
            }
            emitted += 1;
        }

        let due = self
            .reliability
            .due_retransmissions(now, burst.saturating_sub(emitted))?;
        for unit in due {
            let mut flags = Flags::DATA | Flags::RESENT;
            if unit.fragment_count > 1 {
                flags = flags | Flags::FRAGMENT;
            }
            self.emit(
                flags,
                unit.key.fragment_index,
                unit.fragment_count,
                &unit.body,
                Some(unit.key),
                now,
            )?;
            self.reliability.mark_resent(&unit.key, now);
            self.metrics.retransmission();
            emitted += 1;
        }

        let heartbeat_due = now.saturating_duration_since(self.last_sent)
            >= self.config.reliability.heartbeat_interval;
        if emitted == 0 && (self.ack_pending || heartbeat_due) {
            self.emit(Flags::ACK_ONLY, 0, 1, &[], None, now)?;
        }
        Ok(())
    }

    /// Seal one datagram under a fresh counter and queue it.
    fn emit(
        &mut self,
        flags: Flags,
        fragment_index: u16,
        fragment_count: u16,
        body: &[u8],
        unit: Option<UnitKey>,
        now: Instant,
    ) -> Result<u64> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::NotConnected)?;
        let counter = self.reliability.next_counter();
        let (ack, ack_bits) = self.reliability.window().ack_fields();

        let mut header = Header::new(self.remote_id, truncate_counter(counter), flags);
        header.ack = ack;
        header.ack_bits = ack_bits;
        header.fragment_index = fragment_index;
        header.fragment_count = fragment_count;
        header.payload_len = sealed_len(body.len())?;

        let sealed = cipher.seal(counter, &header.to_array(), body)?;
        let datagram = packet::encode(&header, &sealed)?;

        self.reliability.on_sent(counter, now, unit);
        self.last_sent = now;
        self.ack_pending = false;
        self.transmits.push_back(datagram);
        Ok(counter)
    }

    /// Next datagram to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    /// Next message delivered to the application.
    pub fn poll_delivered(&mut self) -> Option<(Channel, Bytes)> {
        self.delivered.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    pub fn rtt(&self) -> Duration {
        self.reliability.rtt()
    }

    pub fn send_mode(&self) -> SendMode {
        self.flow.mode()
    }

    /// Messages waiting to be put on the wire.
    pub fn queued_messages(&self) -> usize {
        self.send_queue.len()
    }

    /// Reliable fragments awaiting acknowledgement.
    pub fn unacked_units(&self) -> usize {
        self.reliability.pending_units()
    }

    /// Reliable messages sent but not yet fully acknowledged.
    pub fn in_flight_messages(&self) -> usize {
        self.outbound.iter().map(OutboundChannel::in_flight).sum()
    }

    fn in_flight_bytes(&self) -> usize {
        self.outbound.iter().map(OutboundChannel::in_flight_bytes).sum()
    }

    /// Identity key of the peer: the one it proved, or the one it must prove when pinned.
    pub fn peer_identity(&self) -> Option<[u8; 32]> {
        self.peer_identity
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("initiator", &self.initiator)
            .field("initiated_locally", &self.initiated_locally)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{AuthPolicy, DEFAULT_PROTOCOL_ID};

    struct Pair {
        a: Connection,
        b: Connection,
        auth: Authenticator,
        now: Instant,
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7001))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7002))
    }

    /// Deliver every queued datagram of `from` into `to`, returning how many moved.
    fn pump(from: &mut Connection, to: &mut Connection, auth: &Authenticator, now: Instant) -> usize {
        let mut moved = 0;
        while let Some(datagram) = from.poll_transmit() {
            let (header, payload) = packet::decode(&datagram).unwrap();
            if header.connection_id == 0 {
                let request = HandshakeRequest::decode(payload).unwrap();
                to.handle_repeated_request(&request);
            } else {
                let _ = to.handle_datagram(auth, &header, payload, now);
            }
            moved += 1;
        }
        moved
    }

    fn connected_pair() -> Pair {
        connected_pair_with(UdpcConfig::default())
    }

    fn connected_pair_with(config: UdpcConfig) -> Pair {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let auth = Authenticator::new(DEFAULT_PROTOCOL_ID, AuthPolicy::Fallback);
        let mut cache = ReplayCache::default();
        let now = Instant::now();

        let mut a = Connection::initiate(
            config.clone(),
            metrics.clone(),
            &auth,
            11,
            server_addr(),
            None,
            now,
        )
        .unwrap();
        let datagram = a.poll_transmit().unwrap();
        let (_, payload) = packet::decode(&datagram).unwrap();
        let request = HandshakeRequest::decode(payload).unwrap();
        let mut b = Connection::accept(
            config,
            metrics,
            &auth,
            &mut cache,
            22,
            client_addr(),
            &request,
            now,
        )
        .unwrap();

        pump(&mut b, &mut a, &auth, now);
        assert_eq!(a.state(), ConnectionState::Connected);
        pump(&mut a, &mut b, &auth, now);
        assert_eq!(b.state(), ConnectionState::Connected);
        assert!(matches!(a.poll_event(), Some(ConnectionEvent::Connected)));
        assert!(matches!(b.poll_event(), Some(ConnectionEvent::Connected)));

        Pair { a, b, auth, now }
    }

    #[test]
    fn test_handshake_assigns_ids() {
        let pair = connected_pair();
        assert_eq!(pair.a.remote_id(), 22);
        assert_eq!(pair.b.remote_id(), 11);
    }

    #[test]
    fn test_reliable_message_delivered_and_acked() {
        let mut pair = connected_pair();
        pair.a
            .send(Channel::ReliableOrdered, Bytes::from_static(b"hello"))
            .unwrap();
        pair.a.tick(pair.now);
        assert_eq!(pump(&mut pair.a, &mut pair.b, &pair.auth, pair.now), 1);
        assert_eq!(
            pair.b.poll_delivered(),
            Some((Channel::ReliableOrdered, Bytes::from_static(b"hello")))
        );
        assert_eq!(pair.a.unacked_units(), 1);

        // B acknowledges on its next flush.
        pair.b.tick(pair.now);
        pump(&mut pair.b, &mut pair.a, &pair.auth, pair.now);
        assert_eq!(pair.a.unacked_units(), 0);
    }

    #[test]
    fn test_replayed_datagram_is_ignored() {
        let mut pair = connected_pair();
        pair.a
            .send(Channel::Unreliable, Bytes::from_static(b"once"))
            .unwrap();
        pair.a.tick(pair.now);
        let datagram = pair.a.poll_transmit().unwrap();
        let (header, payload) = packet::decode(&datagram).unwrap();

        pair.b
            .handle_datagram(&pair.auth, &header, payload, pair.now)
            .unwrap();
        assert!(matches!(
            pair.b.handle_datagram(&pair.auth, &header, payload, pair.now),
            Err(ProtocolError::ReplayedNonce)
        ));
        assert!(pair.b.poll_delivered().is_some());
        assert!(pair.b.poll_delivered().is_none());
    }

    #[test]
    fn test_tampered_header_fails_authentication() {
        let mut pair = connected_pair();
        pair.a
            .send(Channel::ReliableOrdered, Bytes::from_static(b"x"))
            .unwrap();
        pair.a.tick(pair.now);
        let datagram = pair.a.poll_transmit().unwrap();
        let (mut header, payload) = packet::decode(&datagram).unwrap();
        header.ack_bits ^= 1;
        assert!(matches!(
            pair.b.handle_datagram(&pair.auth, &header, payload, pair.now),
            Err(ProtocolError::AuthenticationFailed)
        ));
        assert!(pair.b.poll_delivered().is_none());
        assert_eq!(pair.b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_local_disconnect_drains_then_notifies_peer() {
        let mut pair = connected_pair();
        pair.a
            .send(Channel::ReliableOrdered, Bytes::from_static(b"last"))
            .unwrap();
        pair.a.disconnect(pair.now);
        assert_eq!(pair.a.state(), ConnectionState::Disconnecting);
        assert!(matches!(
            pair.a.send(Channel::ReliableOrdered, Bytes::from_static(b"late")),
            Err(ProtocolError::ConnectionClosed)
        ));

        // Queued data still goes out.
        pair.a.tick(pair.now);
        pump(&mut pair.a, &mut pair.b, &pair.auth, pair.now);
        assert!(pair.b.poll_delivered().is_some());

        let later = pair.now + Duration::from_millis(200);
        pair.b.tick(later);
        pump(&mut pair.b, &mut pair.a, &pair.auth, later);
        pair.a.tick(later);
        assert_eq!(pair.a.state(), ConnectionState::Closed);
        assert!(matches!(
            pair.a.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Local))
        ));

        pump(&mut pair.a, &mut pair.b, &pair.auth, later);
        assert_eq!(pair.b.state(), ConnectionState::Closed);
        assert!(matches!(
            pair.b.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Remote))
        ));
    }

    #[test]
    fn test_inactivity_fails_connection() {
        let mut pair = connected_pair();
        let later = pair.now + UdpcConfig::default().reliability.inactivity_timeout;
        pair.a.tick(later);
        assert_eq!(pair.a.state(), ConnectionState::Failed);
        assert!(matches!(
            pair.a.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Timeout))
        ));
    }

    #[test]
    fn test_handshake_times_out() {
        let config = Arc::new(UdpcConfig::default());
        let auth = Authenticator::new(DEFAULT_PROTOCOL_ID, AuthPolicy::Fallback);
        let start = Instant::now();
        let mut conn = Connection::initiate(
            config.clone(),
            Arc::new(Metrics::new()),
            &auth,
            5,
            server_addr(),
            None,
            start,
        )
        .unwrap();

        let interval = config.reliability.handshake_retry_interval;
        let mut now = start;
        for _ in 0..=config.reliability.handshake_max_retries {
            now += interval;
            conn.tick(now);
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(matches!(
            conn.poll_event(),
            Some(ConnectionEvent::Failed(ProtocolError::HandshakeTimeout))
        ));
        // Initial request plus every retry.
        let mut sent = 0;
        while conn.poll_transmit().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 1 + config.reliability.handshake_max_retries as usize);
    }

    #[test]
    fn test_oversized_and_empty_messages_rejected() {
        let mut pair = connected_pair();
        let max = UdpcConfig::default().fragmentation.max_message_size;
        assert!(matches!(
            pair.a
                .send(Channel::ReliableOrdered, Bytes::from(vec![0u8; max + 1])),
            Err(ProtocolError::MessageTooLarge(_))
        ));
        assert!(matches!(
            pair.a.send(Channel::Unreliable, Bytes::new()),
            Err(ProtocolError::EmptyMessage)
        ));
    }

    #[test]
    fn test_unacked_reliable_bytes_stay_within_budget() {
        let config = UdpcConfig::default_with_overrides(|c| {
            c.fragmentation.max_message_size = 4000;
            c.fragmentation.reassembly_budget = 5000;
        });
        let mut pair = connected_pair_with(config);
        for byte in [1u8, 2] {
            pair.a
                .send(Channel::ReliableOrdered, Bytes::from(vec![byte; 3000]))
                .unwrap();
        }

        pair.a.tick(pair.now);
        assert_eq!(pump(&mut pair.a, &mut pair.b, &pair.auth, pair.now), 3);
        assert_eq!(pair.a.in_flight_messages(), 1);
        assert_eq!(pair.a.queued_messages(), 1);
        assert_eq!(pair.b.poll_delivered().unwrap().1, Bytes::from(vec![1u8; 3000]));

        pair.b.tick(pair.now);
        pump(&mut pair.b, &mut pair.a, &pair.auth, pair.now);
        assert_eq!(pair.a.in_flight_messages(), 0);
        assert_eq!(pair.a.unacked_units(), 0);

        let later = pair.now + Duration::from_millis(100);
        pair.a.tick(later);
        assert_eq!(pump(&mut pair.a, &mut pair.b, &pair.auth, later), 3);
        assert_eq!(pair.a.queued_messages(), 0);
        assert_eq!(pair.b.poll_delivered().unwrap().1, Bytes::from(vec![2u8; 3000]));
    }

    #[test]
    fn test_exactly_one_side_yields_on_crossed_requests() {
        let config = Arc::new(UdpcConfig::default());
        let metrics = Arc::new(Metrics::new());
        let auth = Authenticator::new(DEFAULT_PROTOCOL_ID, AuthPolicy::Fallback);
        let now = Instant::now();
        let request_of = |id, peer| {
            let mut conn =
                Connection::initiate(config.clone(), metrics.clone(), &auth, id, peer, None, now)
                    .unwrap();
            let datagram = conn.poll_transmit().unwrap();
            let (_, payload) = packet::decode(&datagram).unwrap();
            (conn, HandshakeRequest::decode(payload).unwrap())
        };
        let (a, a_request) = request_of(11, server_addr());
        let (b, b_request) = request_of(22, client_addr());

        assert_ne!(a.yields_to(&b_request), b.yields_to(&a_request));
        assert!(!a.yields_to(&a_request));

        let pair = connected_pair();
        assert!(!pair.a.yields_to(&b_request));
    }

    #[test]
    fn test_pinned_identity_must_match() {
        let config = Arc::new(UdpcConfig::default());
        let metrics = Arc::new(Metrics::new());
        let client = Authenticator::new(DEFAULT_PROTOCOL_ID, AuthPolicy::Fallback);
        let mut server = Authenticator::new(DEFAULT_PROTOCOL_ID, AuthPolicy::Fallback);
        server.set_identity(ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]));
        let server_identity = server.identity().unwrap();
        let now = Instant::now();

        for (expected, connects) in [(server_identity, true), ([9u8; 32], false)] {
            let mut cache = ReplayCache::default();
            let mut a = Connection::initiate(
                config.clone(),
                metrics.clone(),
                &client,
                11,
                server_addr(),
                Some(expected),
                now,
            )
            .unwrap();
            let datagram = a.poll_transmit().unwrap();
            let (_, payload) = packet::decode(&datagram).unwrap();
            let request = HandshakeRequest::decode(payload).unwrap();
            let mut b = Connection::accept(
                config.clone(),
                metrics.clone(),
                &server,
                &mut cache,
                22,
                client_addr(),
                &request,
                now,
            )
            .unwrap();

            pump(&mut b, &mut a, &client, now);
            if connects {
                assert_eq!(a.state(), ConnectionState::Connected);
                assert_eq!(a.peer_identity(), Some(server_identity));
            } else {
                assert_eq!(a.state(), ConnectionState::Failed);
                assert!(matches!(
                    a.poll_event(),
                    Some(ConnectionEvent::Failed(ProtocolError::HandshakeRejected(_)))
                ));
            }
        }
    }
}
