//! Sequence number arithmetic.
//!
//! Sequence numbers travel as 32-bit values and wrap. Every comparison goes through
//! the helpers here; comparing raw `u32`s is never correct across the wrap point.
//!
//! Internally each direction keeps a 64-bit counter that never wraps. The wire carries
//! its low 32 bits and the receiver recovers the full value relative to the highest
//! counter it has authenticated so far ([`extend_counter`]).

/// Half of the 32-bit sequence space. Two sequence numbers further apart than this
/// are interpreted as having wrapped.
const HALF_RANGE: u32 = 1 << 31;

/// Returns true if `a` comes after `b` in modular sequence order.
#[inline]
pub fn sequence_greater_than(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < HALF_RANGE
}

/// Returns true if `a` comes before `b` in modular sequence order.
#[inline]
pub fn sequence_less_than(a: u32, b: u32) -> bool {
    sequence_greater_than(b, a)
}

/// Forward distance from `from` to `to`, wrapping.
#[inline]
pub fn sequence_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// Recover a full 64-bit counter from its truncated 32-bit form.
///
/// `expected` is the counter the receiver expects next (highest seen + 1). The
/// candidate closest to `expected` is chosen.
pub fn extend_counter(expected: u64, truncated: u32) -> u64 {
    const WINDOW: u64 = 1 << 32;
    const HALF: u64 = WINDOW / 2;

    let candidate = (expected & !(WINDOW - 1)) | u64::from(truncated);
    if candidate.saturating_add(HALF) <= expected && candidate <= u64::MAX - WINDOW {
        candidate + WINDOW
    } else if candidate > expected.saturating_add(HALF) && candidate >= WINDOW {
        candidate - WINDOW
    } else {
        candidate
    }
}

/// Truncate a counter to its on-wire sequence number.
#[inline]
pub fn truncate_counter(counter: u64) -> u32 {
    counter as u32
}

struct Entry<T> {
    counter: u64,
    item: Option<T>,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            counter: u64::MAX,
            item: None,
        }
    }
}

/// Fixed-size ring indexed by counter modulo capacity.
///
/// Inserting a counter silently replaces whatever older counter occupied the slot.
pub struct SequenceBuffer<T> {
    entries: Vec<Entry<T>>,
}

impl<T> SequenceBuffer<T> {
    pub fn new(size: usize) -> Self {
        let mut entries = Vec::with_capacity(size);
        entries.resize_with(size.max(1), Default::default);
        Self { entries }
    }

    #[inline]
    fn index(&self, counter: u64) -> usize {
        (counter % self.entries.len() as u64) as usize
    }

    /// Get the entry for `counter`, if the slot still holds it.
    pub fn get(&self, counter: u64) -> Option<&T> {
        let entry = &self.entries[self.index(counter)];
        if entry.counter == counter {
            entry.item.as_ref()
        } else {
            None
        }
    }

    /// Get the entry for `counter` mutably, if the slot still holds it.
    pub fn get_mut(&mut self, counter: u64) -> Option<&mut T> {
        let index = self.index(counter);
        let entry = &mut self.entries[index];
        if entry.counter == counter {
            entry.item.as_mut()
        } else {
            None
        }
    }

    /// Insert an entry, returning the previous occupant of the slot if any.
    pub fn insert(&mut self, counter: u64, item: T) -> Option<(u64, T)> {
        let index = self.index(counter);
        let entry = &mut self.entries[index];
        let previous = entry.item.take().map(|old| (entry.counter, old));
        entry.counter = counter;
        entry.item = Some(item);
        previous
    }

    /// Remove the entry for `counter`.
    pub fn remove(&mut self, counter: u64) -> Option<T> {
        let index = self.index(counter);
        let entry = &mut self.entries[index];
        if entry.counter == counter {
            entry.counter = u64::MAX;
            entry.item.take()
        } else {
            None
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SequenceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .filter_map(|e| e.item.as_ref().map(|item| (e.counter, item))),
            )
            .finish()
    }
}
