//! # Endpoint
//!
//! The connection manager without a socket. An [`Endpoint`] owns every [`Connection`] of
//! one local address, routes inbound datagrams to them and collects their output.
//!
//! ## Demultiplexing
//! - Header connection id `0` is a handshake request; it creates a connection when the
//!   endpoint accepts new peers and has room, or is answered by the existing handshake for
//!   that address.
//! - A request from a peer we are ourselves connecting to means both sides opened at
//!   once. The side with the greater request nonce turns its attempt into the responder,
//!   keeping the handle it already gave out.
//! - Any other id is the receiver's local id and must arrive from the address that
//!   connection was established with.
//! - Anything that fails to decode, authenticate or pass the replay window is counted and
//!   dropped without a reply.
//!
//! ## Driving
//! Feed socket input to [`Endpoint::handle_datagram`], call [`Endpoint::tick`] on a short
//! interval and drain [`Endpoint::poll_transmit`]. Delivered messages come out of
//! [`Endpoint::receive`] and lifecycle notifications out of [`Endpoint::poll_event`].
//! [`Manager`](crate::transport::manager::Manager) does all of this on a tokio task.

use crate::config::{AuthPolicy, UdpcConfig, MAX_DATAGRAM_SIZE};
use crate::core::packet::{self, Flags, Header};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::Channel;
use crate::protocol::connection::{Connection, ConnectionEvent, ConnectionState, DisconnectReason};
use crate::protocol::handshake::{Authenticator, HandshakeRequest};
use crate::protocol::reliability::SendMode;
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace};

/// Opaque reference to one connection of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A datagram ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: Bytes,
}

/// A message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
    pub channel: Channel,
    pub payload: Bytes,
    /// Round-trip estimate of the connection when the message was delivered.
    pub rtt: Duration,
}

/// Connection lifecycle notifications.
#[derive(Debug)]
pub enum Event {
    Connected {
        handle: ConnectionHandle,
        addr: SocketAddr,
        initiated_locally: bool,
    },
    Disconnected {
        handle: ConnectionHandle,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Failed {
        handle: ConnectionHandle,
        addr: SocketAddr,
        error: ProtocolError,
    },
    MessageDropped {
        handle: ConnectionHandle,
        channel: Channel,
        error: ProtocolError,
    },
    GoodMode {
        handle: ConnectionHandle,
    },
    BadMode {
        handle: ConnectionHandle,
    },
}

/// Snapshot of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: ConnectionHandle,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub rtt: Duration,
    pub send_mode: SendMode,
    pub initiated_locally: bool,
    /// Messages accepted by `send` but not yet on the wire.
    pub queued_messages: usize,
    /// Reliable fragments awaiting acknowledgement.
    pub unacked_units: usize,
    /// Reliable messages on the wire but not fully acknowledged.
    pub in_flight_messages: usize,
    pub peer_identity: Option<[u8; 32]>,
}

pub struct Endpoint {
    config: Arc<UdpcConfig>,
    auth: Authenticator,
    replay_cache: ReplayCache,
    metrics: Arc<Metrics>,
    connections: HashMap<u32, Connection>,
    by_addr: HashMap<SocketAddr, u32>,
    accept_new: bool,
    transmits: VecDeque<Transmit>,
    received: VecDeque<Received>,
    events: VecDeque<Event>,
}

impl Endpoint {
    /// Create an endpoint; the configuration must pass strict validation.
    pub fn new(config: UdpcConfig) -> Result<Self> {
        config.validate_strict()?;
        let auth = Authenticator::new(config.endpoint.protocol_id, config.security.auth_policy);
        let replay_cache = ReplayCache::with_settings(
            config.security.replay_cache_ttl,
            config.security.replay_cache_entries,
        );
        Ok(Self {
            accept_new: config.endpoint.accept_new_connections,
            config: Arc::new(config),
            auth,
            replay_cache,
            metrics: Arc::new(Metrics::new()),
            connections: HashMap::new(),
            by_addr: HashMap::new(),
            transmits: VecDeque::new(),
            received: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &UdpcConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Open a connection to `addr`. Returns the existing handle if one is already live.
    #[instrument(level = "debug", skip(self, now))]
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> Result<ConnectionHandle> {
        self.open(addr, None, now)
    }

    /// Open a connection that only completes if the peer proves it holds `expected`.
    ///
    /// An existing connection to `addr` is returned only when its peer identity is that
    /// key; otherwise the call fails with `HandshakeRejected`.
    #[instrument(level = "debug", skip(self, expected, now))]
    pub fn connect_with_identity(
        &mut self,
        addr: SocketAddr,
        expected: [u8; 32],
        now: Instant,
    ) -> Result<ConnectionHandle> {
        if expected == [0u8; 32] {
            return Err(ProtocolError::HandshakeRejected(
                constants::ERR_MISSING_IDENTITY.into(),
            ));
        }
        self.open(addr, Some(expected), now)
    }

    fn open(
        &mut self,
        addr: SocketAddr,
        expected: Option<[u8; 32]>,
        now: Instant,
    ) -> Result<ConnectionHandle> {
        if let Some(&id) = self.by_addr.get(&addr) {
            if let (Some(expected), Some(conn)) = (expected, self.connections.get(&id)) {
                if conn.peer_identity() != Some(expected) {
                    return Err(ProtocolError::HandshakeRejected(
                        constants::ERR_IDENTITY_MISMATCH.into(),
                    ));
                }
            }
            return Ok(ConnectionHandle(id));
        }
        let local_id = self.allocate_id();
        let conn = Connection::initiate(
            self.config.clone(),
            self.metrics.clone(),
            &self.auth,
            local_id,
            addr,
            expected,
            now,
        )?;
        self.connections.insert(local_id, conn);
        self.by_addr.insert(addr, local_id);
        self.collect(local_id);
        info!(handle = %ConnectionHandle(local_id), %addr, "Connecting");
        Ok(ConnectionHandle(local_id))
    }

    /// Process one datagram received from `from`.
    ///
    /// Invalid datagrams are counted and dropped; they never produce an error.
    #[instrument(level = "trace", skip(self, now, data), fields(len = data.len()))]
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, data: &[u8]) {
        self.metrics.datagram_received(data.len());
        if data.len() > MAX_DATAGRAM_SIZE {
            self.record_drop(
                &ProtocolError::MalformedPacket(constants::ERR_OVERSIZED_DATAGRAM),
                from,
            );
            return;
        }
        let (header, payload) = match packet::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.record_drop(&e, from);
                return;
            }
        };

        let result = if header.connection_id == 0 {
            self.handle_request(now, from, &header, payload)
        } else {
            self.dispatch(now, from, &header, payload)
        };
        if let Err(e) = result {
            self.record_drop(&e, from);
        }
    }

    fn handle_request(
        &mut self,
        now: Instant,
        from: SocketAddr,
        header: &Header,
        payload: &[u8],
    ) -> Result<()> {
        if !header.flags.contains(Flags::HANDSHAKE) {
            return Err(ProtocolError::MalformedPacket(constants::ERR_HANDSHAKE_BODY));
        }
        let request = HandshakeRequest::decode(payload)?;
        if request.connection_id == 0 {
            return Err(ProtocolError::MalformedPacket(constants::ERR_HANDSHAKE_BODY));
        }

        if let Some(&id) = self.by_addr.get(&from) {
            let Some(conn) = self.connections.get_mut(&id) else {
                return Ok(());
            };
            if !conn.yields_to(&request) {
                conn.handle_repeated_request(&request);
                self.collect(id);
                return Ok(());
            }
            let pinned = conn.peer_identity();
            self.connections.remove(&id);
            self.by_addr.remove(&from);
            debug!(handle = %ConnectionHandle(id), %from, "Simultaneous open, answering the peer's request");
            if pinned.is_some_and(|key| key != request.identity) {
                self.fail_handle(
                    id,
                    from,
                    ProtocolError::HandshakeRejected(constants::ERR_IDENTITY_MISMATCH.into()),
                );
                return Ok(());
            }
            return self.accept_request(now, from, &request, Some(id));
        }

        if !self.accept_new {
            debug!(%from, "Not accepting new connections, ignoring request");
            return Ok(());
        }
        if self.connections.len() >= self.config.endpoint.max_connections {
            debug!(%from, limit = self.config.endpoint.max_connections, "Connection limit reached, ignoring request");
            return Ok(());
        }
        self.accept_request(now, from, &request, None)
    }

    /// Answer a request, either under a fresh id or under `reuse`, the id of our own
    /// attempt to reach the same peer.
    fn accept_request(
        &mut self,
        now: Instant,
        from: SocketAddr,
        request: &HandshakeRequest,
        reuse: Option<u32>,
    ) -> Result<()> {
        let local_id = match reuse {
            Some(id) => id,
            None => self.allocate_id(),
        };
        match Connection::accept(
            self.config.clone(),
            self.metrics.clone(),
            &self.auth,
            &mut self.replay_cache,
            local_id,
            from,
            request,
            now,
        ) {
            Ok(mut conn) => {
                if reuse.is_some() {
                    conn.mark_initiated_locally();
                }
                self.connections.insert(local_id, conn);
                self.by_addr.insert(from, local_id);
                self.collect(local_id);
            }
            Err(ProtocolError::HandshakeRejected(reason)) => {
                if reason == constants::ERR_REPLAY_ATTACK {
                    self.metrics.replay_cache_hit();
                }
                debug!(%from, %reason, "Handshake request rejected");
                if reuse.is_some() {
                    self.fail_handle(local_id, from, ProtocolError::HandshakeRejected(reason));
                }
            }
            Err(e) if reuse.is_some() => self.fail_handle(local_id, from, e),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Report a handle the application holds as failed after its connection is gone.
    fn fail_handle(&mut self, id: u32, addr: SocketAddr, error: ProtocolError) {
        info!(handle = %ConnectionHandle(id), %addr, error = %error, "Connection attempt failed");
        if self.config.endpoint.events_enabled {
            self.events.push_back(Event::Failed {
                handle: ConnectionHandle(id),
                addr,
                error,
            });
        }
    }

    fn dispatch(
        &mut self,
        now: Instant,
        from: SocketAddr,
        header: &Header,
        payload: &[u8],
    ) -> Result<()> {
        let id = header.connection_id;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownConnection)?;
        if conn.peer() != from {
            return Err(ProtocolError::UnknownConnection);
        }
        let result = conn.handle_datagram(&self.auth, header, payload, now);
        self.collect(id);
        result
    }

    fn record_drop(&self, error: &ProtocolError, from: SocketAddr) {
        if !error.is_silent_drop() {
            debug!(%from, error = %error, "Datagram rejected");
            return;
        }
        match error {
            ProtocolError::MalformedPacket(_) | ProtocolError::UnsupportedVersion(_) => {
                self.metrics.malformed()
            }
            ProtocolError::AuthenticationFailed => self.metrics.auth_failure(),
            ProtocolError::ReplayedNonce => self.metrics.replay_dropped(),
            _ => {}
        }
        trace!(%from, error = %error, "Dropped datagram");
    }

    /// Move a connection's output into the endpoint queues and release it once terminal.
    fn collect(&mut self, id: u32) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let handle = ConnectionHandle(id);
        let addr = conn.peer();

        while let Some(contents) = conn.poll_transmit() {
            self.metrics.datagram_sent(contents.len());
            self.transmits.push_back(Transmit {
                destination: addr,
                contents,
            });
        }
        while let Some((channel, payload)) = conn.poll_delivered() {
            self.received.push_back(Received {
                handle,
                addr,
                channel,
                payload,
                rtt: conn.rtt(),
            });
        }
        while let Some(event) = conn.poll_event() {
            if !self.config.endpoint.events_enabled {
                continue;
            }
            let event = match event {
                ConnectionEvent::Connected => Event::Connected {
                    handle,
                    addr,
                    initiated_locally: conn.initiated_locally(),
                },
                ConnectionEvent::Disconnected(reason) => Event::Disconnected {
                    handle,
                    addr,
                    reason,
                },
                ConnectionEvent::Failed(error) => Event::Failed {
                    handle,
                    addr,
                    error,
                },
                ConnectionEvent::MessageDropped { channel, error } => Event::MessageDropped {
                    handle,
                    channel,
                    error,
                },
                ConnectionEvent::ModeChanged(SendMode::Good) => Event::GoodMode { handle },
                ConnectionEvent::ModeChanged(SendMode::Bad) => Event::BadMode { handle },
            };
            self.events.push_back(event);
        }

        if conn.is_terminal() {
            self.connections.remove(&id);
            if self.by_addr.get(&addr) == Some(&id) {
                self.by_addr.remove(&addr);
            }
            debug!(%handle, %addr, "Connection released");
        }
    }

    /// Run timers of every connection.
    pub fn tick(&mut self, now: Instant) {
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.tick(now);
            }
            self.collect(id);
        }
    }

    /// Queue a message on `channel` of a connection.
    pub fn send(
        &mut self,
        handle: ConnectionHandle,
        channel: Channel,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.connections
            .get_mut(&handle.0)
            .ok_or(ProtocolError::UnknownConnection)?
            .send(channel, payload.into())
    }

    /// Start disconnecting a connection.
    pub fn disconnect(&mut self, handle: ConnectionHandle, now: Instant) -> Result<()> {
        self.connections
            .get_mut(&handle.0)
            .ok_or(ProtocolError::UnknownConnection)?
            .disconnect(now);
        self.collect(handle.0);
        Ok(())
    }

    /// Disconnect every connection whose peer has this IP. Returns how many were affected.
    pub fn disconnect_addr(&mut self, ip: IpAddr, now: Instant) -> usize {
        let ids: Vec<u32> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.peer().ip() == ip)
            .map(|(&id, _)| id)
            .collect();
        for &id in &ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.disconnect(now);
            }
            self.collect(id);
        }
        ids.len()
    }

    /// Next datagram for the socket.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next delivered message, if any is ready.
    pub fn receive(&mut self) -> Option<Received> {
        self.received.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn set_accept_new_connections(&mut self, accept: bool) {
        self.accept_new = accept;
    }

    pub fn accepts_new_connections(&self) -> bool {
        self.accept_new
    }

    pub fn has_connection(&self, handle: ConnectionHandle) -> bool {
        self.connections.contains_key(&handle.0)
    }

    /// Connected peers.
    pub fn connections(&self) -> Vec<(ConnectionHandle, SocketAddr)> {
        let mut peers: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state() == ConnectionState::Connected)
            .map(|(&id, conn)| (ConnectionHandle(id), conn.peer()))
            .collect();
        peers.sort();
        peers
    }

    pub fn connection_info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        self.connections.get(&handle.0).map(|conn| ConnectionInfo {
            handle,
            addr: conn.peer(),
            state: conn.state(),
            rtt: conn.rtt(),
            send_mode: conn.send_mode(),
            initiated_locally: conn.initiated_locally(),
            queued_messages: conn.queued_messages(),
            unacked_units: conn.unacked_units(),
            in_flight_messages: conn.in_flight_messages(),
            peer_identity: conn.peer_identity(),
        })
    }

    /// Sign handshakes with this identity from now on.
    pub fn set_identity(&mut self, key: SigningKey) {
        self.auth.set_identity(key);
    }

    pub fn clear_identity(&mut self) {
        self.auth.clear_identity();
    }

    /// Public identity of this endpoint, if one is set.
    pub fn identity(&self) -> Option<[u8; 32]> {
        self.auth.identity()
    }

    pub fn set_auth_policy(&mut self, policy: AuthPolicy) {
        self.auth.set_policy(policy);
    }

    /// Only accept peers presenting one of the whitelisted identities.
    pub fn add_to_whitelist(&mut self, identity: [u8; 32]) -> bool {
        self.auth.add_to_whitelist(identity)
    }

    pub fn remove_from_whitelist(&mut self, identity: &[u8; 32]) -> bool {
        self.auth.remove_from_whitelist(identity)
    }

    pub fn whitelist_contains(&self, identity: &[u8; 32]) -> bool {
        self.auth.whitelist_contains(identity)
    }

    pub fn clear_whitelist(&mut self) {
        self.auth.clear_whitelist();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("connections", &self.connections.len())
            .field("accept_new", &self.accept_new)
            .field("queued_transmits", &self.transmits.len())
            .finish_non_exhaustive()
    }
}
