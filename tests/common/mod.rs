//! Deterministic in-memory network for driving two endpoints.
//!
//! Datagrams travel through a fault model (loss, duplication, latency with jitter) driven
//! by a seeded RNG, so every run of a test sees the same sequence of faults. Time is
//! simulated: each [`Network::step`] advances the clock by [`STEP`] and ticks both sides.

#![allow(dead_code, clippy::unwrap_used)]

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use udpc::utils::logging::init_test_logging;
use udpc::{ConnectionHandle, Endpoint, Event, Received, UdpcConfig};

pub const STEP: Duration = Duration::from_millis(10);

/// Fault model applied to every datagram.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub latency: Duration,
    pub jitter: Duration,
}

impl Link {
    pub fn perfect() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::perfect()
        }
    }

    pub fn chaotic(loss_rate: f64, duplicate_rate: f64, jitter: Duration) -> Self {
        Self {
            loss_rate,
            duplicate_rate,
            latency: Duration::from_millis(10),
            jitter,
        }
    }

    pub fn dead() -> Self {
        Self::lossy(1.0)
    }
}

struct InFlight {
    deliver_at: Instant,
    from: SocketAddr,
    to: SocketAddr,
    data: Bytes,
}

pub struct Network {
    pub a: Endpoint,
    pub b: Endpoint,
    pub a_addr: SocketAddr,
    pub b_addr: SocketAddr,
    pub now: Instant,
    pub link: Link,
    /// Datagrams for which this returns true are lost, on top of the link's fault model.
    pub drop_if: Option<fn(&[u8]) -> bool>,
    rng: StdRng,
    in_flight: Vec<InFlight>,
}

impl Network {
    pub fn new(seed: u64) -> Self {
        Self::with_configs(seed, UdpcConfig::default(), UdpcConfig::default())
    }

    pub fn with_configs(seed: u64, a: UdpcConfig, b: UdpcConfig) -> Self {
        init_test_logging();
        Self {
            a: Endpoint::new(a).unwrap(),
            b: Endpoint::new(b).unwrap(),
            a_addr: "10.0.0.1:5000".parse().unwrap(),
            b_addr: "10.0.0.2:6000".parse().unwrap(),
            now: Instant::now(),
            link: Link::perfect(),
            drop_if: None,
            rng: StdRng::seed_from_u64(seed),
            in_flight: Vec::new(),
        }
    }

    fn route(&mut self) {
        let mut outgoing = Vec::new();
        while let Some(t) = self.a.poll_transmit() {
            outgoing.push((self.a_addr, t.destination, t.contents));
        }
        while let Some(t) = self.b.poll_transmit() {
            outgoing.push((self.b_addr, t.destination, t.contents));
        }

        for (from, to, data) in outgoing {
            if self.rng.random_bool(self.link.loss_rate) {
                continue;
            }
            if self.drop_if.is_some_and(|filter| filter(&data)) {
                continue;
            }
            let copies = if self.rng.random_bool(self.link.duplicate_rate) {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let jitter_us = self.link.jitter.as_micros() as u64;
                let jitter = Duration::from_micros(self.rng.random_range(0..=jitter_us));
                self.in_flight.push(InFlight {
                    deliver_at: self.now + self.link.latency + jitter,
                    from,
                    to,
                    data: data.clone(),
                });
            }
        }
    }

    /// Move datagrams until nothing more is due at the current instant.
    pub fn pump(&mut self) {
        loop {
            self.route();
            let now = self.now;
            let (mut due, pending): (Vec<_>, Vec<_>) = self
                .in_flight
                .drain(..)
                .partition(|d| d.deliver_at <= now);
            self.in_flight = pending;
            if due.is_empty() {
                break;
            }
            due.sort_by_key(|d| d.deliver_at);
            for d in due {
                if d.to == self.b_addr {
                    self.b.handle_datagram(now, d.from, &d.data);
                } else if d.to == self.a_addr {
                    self.a.handle_datagram(now, d.from, &d.data);
                }
            }
        }
    }

    /// Advance the clock one step, tick both endpoints and move traffic.
    pub fn step(&mut self) {
        self.now += STEP;
        self.a.tick(self.now);
        self.b.tick(self.now);
        self.pump();
    }

    /// Step until `done` holds or `limit` of simulated time passes. Returns whether it held.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now + duration;
        while self.now < deadline {
            self.step();
        }
    }

    /// Connect `a` to `b` over the current link and wait for both sides.
    pub fn connect(&mut self) -> ConnectionHandle {
        let handle = self.a.connect(self.b_addr, self.now).unwrap();
        self.pump();
        let connected = self.run_until(Duration::from_secs(10), |net| {
            net.a.connections().len() == 1 && net.b.connections().len() == 1
        });
        assert!(connected, "handshake did not complete");
        handle
    }

    /// Handle `b` uses for its connection to `a`.
    pub fn b_handle(&self) -> ConnectionHandle {
        self.b.connections()[0].0
    }
}

pub fn drain_received(endpoint: &mut Endpoint) -> Vec<Received> {
    std::iter::from_fn(|| endpoint.receive()).collect()
}

pub fn drain_events(endpoint: &mut Endpoint) -> Vec<Event> {
    std::iter::from_fn(|| endpoint.poll_event()).collect()
}

/// Payload whose bytes encode its index, so reordering and corruption are visible.
pub fn numbered_payload(index: usize, len: usize) -> Bytes {
    let mut data = vec![0u8; len.max(4)];
    data[..4].copy_from_slice(&(index as u32).to_be_bytes());
    for (i, byte) in data.iter_mut().enumerate().skip(4) {
        *byte = (index.wrapping_mul(31) + i) as u8;
    }
    Bytes::from(data)
}

pub fn payload_index(payload: &[u8]) -> usize {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize
}
