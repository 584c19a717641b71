//! Reliability engine.
//!
//! Tracks everything a connection needs to turn lossy datagrams into reliable channels:
//!
//! - the outbound counter and a ring of recently sent datagrams, so piggybacked
//!   acknowledgements can be matched back to what they carried;
//! - the set of reliable units (one fragment of one message) still awaiting an ack,
//!   with per-unit exponential-backoff retransmission timers and a retry budget;
//! - the receive window (duplicate rejection and the ack fields we send back);
//! - a smoothed round-trip time and the good/bad send-mode controller derived from it.
//!
//! Retransmissions never reuse a counter: a resent unit is sealed again under a fresh
//! counter and the unit is considered delivered as soon as any of its transmissions is
//! acknowledged.

use crate::config::ReliabilityConfig;
use crate::core::sequence::{extend_counter, SequenceBuffer};
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::Channel;
use crate::utils::replay_window::{ReceiveWindow, WINDOW_SIZE};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Sent datagrams remembered for acknowledgement matching.
const SENT_BUFFER_SIZE: usize = 512;

/// Identifies one reliable fragment of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub channel: Channel,
    pub message_id: u32,
    pub fragment_index: u16,
}

/// A reliable unit awaiting acknowledgement, with everything needed to resend it.
#[derive(Debug, Clone)]
pub struct OutboundUnit {
    pub key: UnitKey,
    pub fragment_count: u16,
    /// Plaintext frame body.
    pub body: Bytes,
}

#[derive(Debug)]
struct PendingUnit {
    unit: OutboundUnit,
    last_sent: Instant,
    retries: u32,
    timeout: Duration,
}

#[derive(Debug)]
struct SentRecord {
    sent_at: Instant,
    unit: Option<UnitKey>,
}

#[derive(Debug)]
pub struct ReliabilityEngine {
    next_counter: u64,
    sent: SequenceBuffer<SentRecord>,
    pending: BTreeMap<UnitKey, PendingUnit>,
    window: ReceiveWindow,
    rtt: Duration,
    rtt_sampled: bool,
    initial_timeout: Duration,
    max_timeout: Duration,
    max_retries: u32,
}

impl ReliabilityEngine {
    /// Data counters start at 1; counter 0 belongs to the handshake.
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            next_counter: 1,
            sent: SequenceBuffer::new(SENT_BUFFER_SIZE),
            pending: BTreeMap::new(),
            window: ReceiveWindow::new(),
            rtt: Duration::ZERO,
            rtt_sampled: false,
            initial_timeout: config.retransmit_timeout,
            max_timeout: config.max_retransmit_timeout,
            max_retries: config.max_retries,
        }
    }

    /// Allocate the counter for the next outgoing datagram.
    pub fn next_counter(&mut self) -> u64 {
        let counter = self.next_counter;
        self.next_counter += 1;
        counter
    }

    /// Remember a transmitted datagram and which reliable unit it carried, if any.
    pub fn on_sent(&mut self, counter: u64, now: Instant, unit: Option<UnitKey>) {
        if let Some((old, record)) = self.sent.insert(counter, SentRecord { sent_at: now, unit }) {
            if record.unit.is_some() {
                trace!(old, counter, "Sent slot reused before acknowledgement");
            }
        }
    }

    /// Start the retransmission timer of a freshly sent reliable unit.
    pub fn track(&mut self, unit: OutboundUnit, now: Instant) {
        self.pending.insert(
            unit.key,
            PendingUnit {
                unit,
                last_sent: now,
                retries: 0,
                timeout: self.initial_timeout,
            },
        );
    }

    /// Apply a piggybacked acknowledgement. Returns the reliable units it completed.
    pub fn process_acks(&mut self, ack: u32, ack_bits: u64, now: Instant) -> Vec<UnitKey> {
        let mut acked = Vec::new();
        if self.next_counter <= 1 {
            return acked;
        }
        let newest = extend_counter(self.next_counter - 1, ack);
        if newest >= self.next_counter {
            return acked;
        }

        if let Some(record) = self.sent.remove(newest) {
            self.update_rtt(now.saturating_duration_since(record.sent_at));
            self.complete(record.unit, &mut acked);
        }

        for i in 0..WINDOW_SIZE {
            if ack_bits & (1u64 << i) == 0 {
                continue;
            }
            let Some(counter) = newest.checked_sub(i + 1) else {
                break;
            };
            if let Some(record) = self.sent.remove(counter) {
                self.complete(record.unit, &mut acked);
            }
        }
        acked
    }

    fn complete(&mut self, unit: Option<UnitKey>, acked: &mut Vec<UnitKey>) {
        if let Some(key) = unit {
            if self.pending.remove(&key).is_some() {
                acked.push(key);
            }
        }
    }

    /// Smoothed towards each sample by a tenth of the difference.
    fn update_rtt(&mut self, sample: Duration) {
        if !self.rtt_sampled {
            self.rtt = sample;
            self.rtt_sampled = true;
            return;
        }
        if sample > self.rtt {
            self.rtt += (sample - self.rtt) / 10;
        } else {
            self.rtt -= (self.rtt - sample) / 10;
        }
        trace!(rtt_ms = self.rtt.as_millis() as u64, "RTT updated");
    }

    /// Reliable units whose timer expired, oldest first, at most `limit` of them.
    ///
    /// Fails with `RetransmissionExhausted` once a due unit has used its retry budget.
    pub fn due_retransmissions(&self, now: Instant, limit: usize) -> Result<Vec<OutboundUnit>> {
        let mut due: Vec<&PendingUnit> = self
            .pending
            .values()
            .filter(|p| now.saturating_duration_since(p.last_sent) >= p.timeout)
            .collect();
        if let Some(exhausted) = due.iter().find(|p| p.retries >= self.max_retries) {
            debug!(
                message_id = exhausted.unit.key.message_id,
                retries = exhausted.retries,
                "Retransmission budget exhausted"
            );
            return Err(ProtocolError::RetransmissionExhausted);
        }
        due.sort_by_key(|p| p.last_sent);
        Ok(due.into_iter().take(limit).map(|p| p.unit.clone()).collect())
    }

    /// Restart the timer of a unit that was just resent, doubling its timeout.
    pub fn mark_resent(&mut self, key: &UnitKey, now: Instant) {
        if let Some(pending) = self.pending.get_mut(key) {
            pending.last_sent = now;
            pending.retries += 1;
            pending.timeout = (pending.timeout * 2).min(self.max_timeout);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_units(&self) -> usize {
        self.pending.len()
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn window(&self) -> &ReceiveWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut ReceiveWindow {
        &mut self.window
    }
}

/// Pacing mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Good,
    Bad,
}

/// Good/bad mode controller.
///
/// A connection starts in bad mode. Round-trip times above the limit while in good mode
/// drop it back to bad mode immediately; good round-trip times in bad mode must persist
/// for the toggle period before good mode is entered again. Losing good mode shortly
/// after entering it doubles the period, every ten seconds of good mode halves it.
#[derive(Debug)]
pub struct FlowControl {
    mode: SendMode,
    good_rtt_limit: Duration,
    toggle_period: Duration,
    /// Time since the last mode change, or since the good streak began in bad mode.
    toggled_since: Instant,
    /// Time since the toggle period was last halved.
    halved_since: Instant,
    good_interval: Duration,
    bad_interval: Duration,
    good_burst: usize,
    bad_burst: usize,
}

const TEN_SECONDS: Duration = Duration::from_secs(10);
const MIN_TOGGLE_PERIOD: Duration = Duration::from_secs(1);

impl FlowControl {
    pub fn new(config: &ReliabilityConfig, now: Instant) -> Self {
        Self {
            mode: SendMode::Bad,
            good_rtt_limit: config.good_rtt_limit,
            toggle_period: config.mode_toggle_period,
            toggled_since: now,
            halved_since: now,
            good_interval: config.good_send_interval,
            bad_interval: config.bad_send_interval,
            good_burst: config.good_mode_burst,
            bad_burst: config.bad_mode_burst,
        }
    }

    /// Feed the current RTT. Returns the new mode when it changed.
    pub fn update(&mut self, rtt: Duration, now: Instant) -> Option<SendMode> {
        let good_rtt = rtt <= self.good_rtt_limit;
        match (self.mode, good_rtt) {
            (SendMode::Good, false) => {
                if now.saturating_duration_since(self.toggled_since) <= TEN_SECONDS {
                    self.toggle_period = self.toggle_period.saturating_mul(2);
                }
                self.mode = SendMode::Bad;
                self.toggled_since = now;
                Some(SendMode::Bad)
            }
            (SendMode::Good, true) => {
                if now.saturating_duration_since(self.halved_since) >= TEN_SECONDS {
                    self.halved_since = now;
                    self.toggle_period = (self.toggle_period / 2).max(MIN_TOGGLE_PERIOD);
                }
                None
            }
            (SendMode::Bad, true) => {
                if now.saturating_duration_since(self.toggled_since) >= self.toggle_period {
                    self.mode = SendMode::Good;
                    self.toggled_since = now;
                    self.halved_since = now;
                    Some(SendMode::Good)
                } else {
                    None
                }
            }
            (SendMode::Bad, false) => {
                self.toggled_since = now;
                None
            }
        }
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    pub fn toggle_period(&self) -> Duration {
        self.toggle_period
    }

    /// Interval between flushes in the current mode.
    pub fn send_interval(&self) -> Duration {
        match self.mode {
            SendMode::Good => self.good_interval,
            SendMode::Bad => self.bad_interval,
        }
    }

    /// Datagrams a single flush may emit in the current mode.
    pub fn burst(&self) -> usize {
        match self.mode {
            SendMode::Good => self.good_burst,
            SendMode::Bad => self.bad_burst,
        }
    }
}
