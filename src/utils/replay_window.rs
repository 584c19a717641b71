//! Sliding receive window.
//!
//! One structure serves two purposes on the receive path of a connection: it rejects
//! counters that were already accepted or fell behind the window (replay protection),
//! and it produces the `(ack, ack_bits)` pair piggybacked on every outgoing datagram.
//!
//! Bit `i` of the bitmap stands for counter `highest - 1 - i`, matching the wire
//! meaning of `ack_bits`.

use crate::core::sequence::truncate_counter;
use crate::error::{ProtocolError, Result};

/// Counters accepted behind the highest one.
pub const WINDOW_SIZE: u64 = 64;

#[derive(Debug, Clone, Default)]
pub struct ReceiveWindow {
    highest: Option<u64>,
    bits: u64,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a counter already recorded or too old to tell. Does not modify the window.
    pub fn check(&self, counter: u64) -> Result<()> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if counter > highest {
            return Ok(());
        }
        if counter == highest {
            return Err(ProtocolError::ReplayedNonce);
        }
        let delta = highest - counter;
        if delta > WINDOW_SIZE {
            return Err(ProtocolError::ReplayedNonce);
        }
        if self.bits & (1u64 << (delta - 1)) != 0 {
            return Err(ProtocolError::ReplayedNonce);
        }
        Ok(())
    }

    /// Mark a counter as accepted. Call only after the datagram authenticated.
    pub fn record(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bits = 0;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bits = if shift > WINDOW_SIZE {
                    0
                } else if shift == WINDOW_SIZE {
                    1u64 << 63
                } else {
                    (self.bits << shift) | (1u64 << (shift - 1))
                };
                self.highest = Some(counter);
            }
            Some(highest) => {
                let delta = highest - counter;
                if delta >= 1 && delta <= WINDOW_SIZE {
                    self.bits |= 1u64 << (delta - 1);
                }
            }
        }
    }

    /// Next counter the window expects; the reference point for counter recovery.
    pub fn expected(&self) -> u64 {
        self.highest.map_or(0, |h| h.saturating_add(1))
    }

    /// Acknowledgement fields for the next outgoing datagram.
    pub fn ack_fields(&self) -> (u32, u64) {
        match self.highest {
            Some(highest) => (truncate_counter(highest), self.bits),
            None => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(window: &mut ReceiveWindow, counter: u64) -> bool {
        if window.check(counter).is_err() {
            return false;
        }
        window.record(counter);
        true
    }

    #[test]
    fn test_sequential() {
        let mut window = ReceiveWindow::new();
        for i in 1..200 {
            assert!(accept(&mut window, i), "counter {i} should be accepted");
        }
        assert_eq!(window.ack_fields(), (199, u64::MAX));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut window = ReceiveWindow::new();
        assert!(accept(&mut window, 42));
        assert!(!accept(&mut window, 42));
        assert!(accept(&mut window, 40));
        assert!(!accept(&mut window, 40));
    }

    #[test]
    fn test_out_of_order() {
        let mut window = ReceiveWindow::new();
        let counters = [100u64, 50, 75, 99, 37];
        for c in counters {
            assert!(accept(&mut window, c), "counter {c} should be accepted");
        }
        for c in counters {
            assert!(!accept(&mut window, c), "counter {c} should be rejected");
        }
    }

    #[test]
    fn test_window_boundary() {
        let mut window = ReceiveWindow::new();
        assert!(accept(&mut window, 1000));
        assert!(accept(&mut window, 1000 - WINDOW_SIZE));
        assert!(!accept(&mut window, 1000 - WINDOW_SIZE - 1));
    }

    #[test]
    fn test_ack_bits_layout() {
        let mut window = ReceiveWindow::new();
        for c in [10u64, 8, 12] {
            window.record(c);
        }
        // 12 highest; 11 missing (bit 0), 10 present (bit 1), 9 missing, 8 present (bit 3).
        assert_eq!(window.ack_fields(), (12, 0b1010));
    }

    #[test]
    fn test_large_jump_clears_history() {
        let mut window = ReceiveWindow::new();
        window.record(5);
        window.record(5 + WINDOW_SIZE);
        assert_eq!(window.ack_fields().1, 1u64 << 63);
        window.record(1000);
        assert_eq!(window.ack_fields(), (1000, 0));
        assert_eq!(window.expected(), 1001);
    }
}
