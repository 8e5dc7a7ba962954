//! Tunable parameters shared by the post office and every connection.

use std::time::Duration;

use crate::receiver::OrderPolicy;

/// Default number of messages a port's mailbox holds before new arrivals are
/// dropped.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Transport configuration.
///
/// The binary fills this from command-line flags; tests usually shorten the
/// timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Capacity of each per-port mailbox.
    pub mailbox_capacity: usize,
    /// Resend unacknowledged SYN, STP and data segments.  When `false` the
    /// transport waits forever, like a link that never loses packets.
    pub retransmit: bool,
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Floor applied to the estimated RTO.
    pub min_rto: Duration,
    /// Ceiling for the RTO after repeated back-off.
    pub max_rto: Duration,
    /// Retransmissions of one SYN, STP or segment before giving up.
    pub max_retries: u32,
    /// How often a receiver loop scans its window for expired segments.
    pub tick: Duration,
    /// Handling of data segments that arrive out of sequence.
    pub order: OrderPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            retransmit: true,
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
            tick: Duration::from_millis(50),
            order: OrderPolicy::default(),
        }
    }
}
