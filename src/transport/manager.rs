//! # UDP Manager
//!
//! Binds a UDP socket and drives an [`Endpoint`] from a background tokio task.
//!
//! ## Driver loop
//! One task owns the socket. It wakes on an inbound datagram, on the tick interval, when
//! the application queued work, or on shutdown. Each wake-up takes the endpoint lock only
//! long enough to update state and drain outgoing datagrams; sends happen after the lock
//! is released.
//!
//! ## Example
//! ```rust,no_run
//! use udpc::{Channel, Event, Manager, UdpcConfig};
//!
//! # async fn demo() -> udpc::Result<()> {
//! let manager = Manager::bind(UdpcConfig::default()).await?;
//! let handle = manager.connect("127.0.0.1:9000".parse().unwrap()).await?;
//! while let Some(event) = manager.listen().await {
//!     if let Event::Connected { .. } = event {
//!         manager.send(handle, Channel::ReliableOrdered, &b"hello"[..]).await?;
//!         break;
//!     }
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::UdpcConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::Channel;
use crate::transport::endpoint::{
    ConnectionHandle, ConnectionInfo, Endpoint, Event, Received, Transmit,
};
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::BytesCodec;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, warn};

struct Shared {
    endpoint: Mutex<Endpoint>,
    /// Application queued outbound work.
    wake: Notify,
    /// Messages or events became available.
    ready: Notify,
    closed: AtomicBool,
}

/// Async front end of one endpoint.
pub struct Manager {
    shared: Arc<Shared>,
    metrics: Arc<Metrics>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    driver: JoinHandle<()>,
}

impl Manager {
    /// Bind `config.endpoint.address` and start the driver task.
    #[instrument(skip(config), fields(address = %config.endpoint.address))]
    pub async fn bind(config: UdpcConfig) -> Result<Self> {
        let address: SocketAddr = config.endpoint.address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!("Invalid endpoint address: {e}"))
        })?;
        let tick_interval = config.endpoint.tick_interval;
        let endpoint = Endpoint::new(config)?;
        let metrics = endpoint.metrics();

        let socket = UdpSocket::bind(address).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "UDP endpoint bound");

        let shared = Arc::new(Shared {
            endpoint: Mutex::new(endpoint),
            wake: Notify::new(),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let driver = tokio::spawn(drive(
            shared.clone(),
            UdpFramed::new(socket, BytesCodec::new()),
            tick_interval,
            shutdown_rx,
        ));

        Ok(Self {
            shared,
            metrics,
            local_addr,
            shutdown_tx,
            driver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// Start a handshake with `addr`; completion is reported as [`Event::Connected`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionHandle> {
        self.ensure_open()?;
        let handle = self
            .shared
            .endpoint
            .lock()
            .await
            .connect(addr, Instant::now())?;
        self.shared.wake.notify_one();
        Ok(handle)
    }

    /// Like [`connect`](Self::connect), but the handshake only completes if the peer
    /// signs with the identity key `expected`.
    pub async fn connect_with_identity(
        &self,
        addr: SocketAddr,
        expected: [u8; 32],
    ) -> Result<ConnectionHandle> {
        self.ensure_open()?;
        let handle = self
            .shared
            .endpoint
            .lock()
            .await
            .connect_with_identity(addr, expected, Instant::now())?;
        self.shared.wake.notify_one();
        Ok(handle)
    }

    pub async fn send(
        &self,
        handle: ConnectionHandle,
        channel: Channel,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .endpoint
            .lock()
            .await
            .send(handle, channel, payload)?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Next delivered message, if one is ready.
    pub async fn receive(&self) -> Option<Received> {
        self.shared.endpoint.lock().await.receive()
    }

    /// Wait for the next delivered message. Returns `None` after shutdown.
    pub async fn recv(&self) -> Option<Received> {
        loop {
            let notified = self.shared.ready.notified();
            if let Some(received) = self.shared.endpoint.lock().await.receive() {
                return Some(received);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Wait for the next connection event. Returns `None` after shutdown.
    pub async fn listen(&self) -> Option<Event> {
        loop {
            let notified = self.shared.ready.notified();
            if let Some(event) = self.shared.endpoint.lock().await.poll_event() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub async fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        self.shared
            .endpoint
            .lock()
            .await
            .disconnect(handle, Instant::now())?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Disconnect every peer at `ip`.
    pub async fn disconnect_addr(&self, ip: IpAddr) -> usize {
        let count = self
            .shared
            .endpoint
            .lock()
            .await
            .disconnect_addr(ip, Instant::now());
        self.shared.wake.notify_one();
        count
    }

    pub async fn set_accept_new_connections(&self, accept: bool) {
        self.shared
            .endpoint
            .lock()
            .await
            .set_accept_new_connections(accept);
    }

    pub async fn has_connection(&self, handle: ConnectionHandle) -> bool {
        self.shared.endpoint.lock().await.has_connection(handle)
    }

    pub async fn connections(&self) -> Vec<(ConnectionHandle, SocketAddr)> {
        self.shared.endpoint.lock().await.connections()
    }

    pub async fn connection_info(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        self.shared.endpoint.lock().await.connection_info(handle)
    }

    /// Run `f` with exclusive access to the endpoint, e.g. to configure identities.
    pub async fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> R {
        let result = f(&mut *self.shared.endpoint.lock().await);
        self.shared.wake.notify_one();
        result
    }

    /// Stop the driver task. Connections are dropped without notifying peers.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.driver.await {
            warn!(error = %e, "UDP driver task ended abnormally");
        }
        self.metrics.log_metrics();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut framed: UdpFramed<BytesCodec>,
    tick_interval: std::time::Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let outgoing: Vec<Transmit> = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("UDP endpoint shutting down");
                break;
            }
            _ = interval.tick() => {
                let mut endpoint = shared.endpoint.lock().await;
                endpoint.tick(Instant::now());
                drain(&mut endpoint)
            }
            _ = shared.wake.notified() => {
                let mut endpoint = shared.endpoint.lock().await;
                endpoint.tick(Instant::now());
                drain(&mut endpoint)
            }
            frame = framed.next() => match frame {
                Some(Ok((data, from))) => {
                    let mut endpoint = shared.endpoint.lock().await;
                    endpoint.handle_datagram(Instant::now(), from, &data);
                    drain(&mut endpoint)
                }
                Some(Err(e)) => {
                    debug!(error = %e, "UDP receive error");
                    Vec::new()
                }
                None => break,
            },
        };

        for transmit in outgoing {
            if let Err(e) = framed
                .send((transmit.contents, transmit.destination))
                .await
            {
                debug!(error = %e, destination = %transmit.destination, "UDP send failed");
            }
        }
        shared.ready.notify_waiters();
    }

    shared.closed.store(true, Ordering::Release);
    shared.ready.notify_waiters();
}

fn drain(endpoint: &mut Endpoint) -> Vec<Transmit> {
    std::iter::from_fn(|| endpoint.poll_transmit()).collect()
}
