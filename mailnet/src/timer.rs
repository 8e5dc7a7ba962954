//! Retransmission timeout (RTO) estimation.
//!
//! The link may silently lose any packet, so SYN, STP and data segments that
//! go unanswered are re-sent once they have been outstanding for longer than
//! the current RTO.  The RTO follows Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! clamped to `[min_rto, max_rto]`, and doubles on each consecutive timeout.
//!
//! Only segments transmitted exactly once feed RTT samples (Karn's rule);
//! that filtering is the caller's job.

use std::time::Duration;

use crate::config::Config;

/// RTO state for one connection or one handshake.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
}

impl RetransmitTimer {
    pub fn new(config: &Config) -> Self {
        Self {
            initial_rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            current_rto: config.initial_rto,
            srtt: None,
            rttvar: None,
        }
    }

    /// Current timeout.
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        let (srtt, rttvar) = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                (srtt * 7 / 8 + sample / 8, rttvar * 3 / 4 + diff / 4)
            }
            _ => (sample, sample / 2),
        };
        self.srtt = Some(srtt);
        self.rttvar = Some(rttvar);
        self.reset();
    }

    /// Double the RTO after a timeout (RFC 6298 §5.5), capped at `max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.max_rto);
    }

    /// Restore the RTO from the current estimates, or `initial_rto` before
    /// the first sample.
    pub fn reset(&mut self) {
        self.current_rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4).clamp(self.min_rto, self.max_rto),
            _ => self.initial_rto,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(8),
            ..Config::default()
        }
    }

    #[test]
    fn starts_at_initial_rto() {
        assert_eq!(RetransmitTimer::new(&config()).rto(), Duration::from_millis(1000));
    }

    #[test]
    fn first_sample_sets_srtt_and_rttvar() {
        let mut timer = RetransmitTimer::new(&config());
        timer.record_rtt_sample(Duration::from_millis(200));
        // 200 + 4 * 100
        assert_eq!(timer.rto(), Duration::from_millis(600));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut timer = RetransmitTimer::new(&config());
        timer.record_rtt_sample(Duration::from_millis(200));
        timer.record_rtt_sample(Duration::from_millis(200));
        // SRTT stays 200, RTTVAR decays to 75.
        assert_eq!(timer.rto(), Duration::from_millis(500));
    }

    #[test]
    fn rto_never_drops_below_floor() {
        let mut timer = RetransmitTimer::new(&config());
        timer.record_rtt_sample(Duration::from_micros(10));
        assert_eq!(timer.rto(), Duration::from_millis(100));
    }

    #[test]
    fn back_off_doubles_up_to_ceiling() {
        let mut timer = RetransmitTimer::new(&config());
        timer.back_off();
        assert_eq!(timer.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            timer.back_off();
        }
        assert_eq!(timer.rto(), Duration::from_secs(8));
    }

    #[test]
    fn reset_without_samples_returns_to_initial() {
        let mut timer = RetransmitTimer::new(&config());
        timer.back_off();
        timer.reset();
        assert_eq!(timer.rto(), Duration::from_millis(1000));
    }
}
