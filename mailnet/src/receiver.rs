//! Inbound data sequencing.
//!
//! The [`Receiver`] sits between a connection's receiver loop and the
//! application's `read()`: it takes data segments in arrival order and hands
//! back the payload chunks that may be delivered now.  It does **not** send
//! ACKs; every data segment is acknowledged by the caller regardless of what
//! the receiver decides to do with it.

use std::collections::BTreeMap;

use crate::window::WINDOW_CAPACITY;

/// Ahead-of-sequence segments kept while waiting for a gap to fill.  An
/// honest sender never has more than a window in flight.
const MAX_AHEAD: usize = 2 * WINDOW_CAPACITY;

/// What to do with a data segment whose sequence number is not the one
/// expected next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderPolicy {
    /// Buffer segments that arrive early and deliver strictly in sequence
    /// order; discard duplicates.
    #[default]
    Reorder,
    /// Deliver in arrival order, log the anomaly and resynchronise
    /// `expected` to `seq + 1`.
    AcceptAnyway,
}

/// Returns `true` when `a` precedes `b` in wrap-around sequence space.
#[inline]
fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) <= u32::MAX / 2
}

/// Receive-side sequence state for one connection.
#[derive(Debug)]
pub struct Receiver {
    policy: OrderPolicy,
    /// Sequence number of the next in-order segment.
    expected: u32,
    /// Early arrivals keyed by sequence number.
    ahead: BTreeMap<u32, Vec<u8>>,
}

impl Receiver {
    pub fn new(policy: OrderPolicy) -> Self {
        Self {
            policy,
            expected: 0,
            ahead: BTreeMap::new(),
        }
    }

    /// Sequence number expected next.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of early segments waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.ahead.len()
    }

    /// `true` once every segment numbered below `end` has been handed out.
    ///
    /// Arrival-order delivery never holds anything back, so it always
    /// reports `true`.
    pub fn delivered_before(&self, end: u32) -> bool {
        match self.policy {
            OrderPolicy::AcceptAnyway => true,
            OrderPolicy::Reorder => !seq_lt(self.expected, end),
        }
    }

    /// Accept one data segment and return the chunks now deliverable, in
    /// order.
    pub fn on_segment(&mut self, seq: u32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        match self.policy {
            OrderPolicy::AcceptAnyway => {
                if seq != self.expected {
                    log::warn!(
                        "[recv] out of order segment: seq={seq} expected={}",
                        self.expected
                    );
                }
                self.expected = seq.wrapping_add(1);
                vec![payload]
            }
            OrderPolicy::Reorder => self.reorder(seq, payload),
        }
    }

    fn reorder(&mut self, seq: u32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if seq_lt(seq, self.expected) {
            log::debug!("[recv] duplicate segment seq={seq} discarded");
            return Vec::new();
        }

        if seq != self.expected {
            log::warn!(
                "[recv] out of order segment: seq={seq} expected={}; buffering",
                self.expected
            );
            if self.ahead.len() < MAX_AHEAD || self.ahead.contains_key(&seq) {
                self.ahead.entry(seq).or_insert(payload);
            } else {
                log::warn!("[recv] reorder buffer full; dropping seq={seq}");
            }
            return Vec::new();
        }

        let mut ready = vec![payload];
        self.expected = self.expected.wrapping_add(1);
        while let Some(next) = self.ahead.remove(&self.expected) {
            ready.push(next);
            self.expected = self.expected.wrapping_add(1);
        }
        ready
    }
}
