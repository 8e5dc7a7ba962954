//! Connection finite-state machine (FSM) types.
//!
//! Transitions are driven by [`crate::connection`]; this module only names
//! the states.
//!
//! ```text
//!            connect(): send SYN            SYN|ACK received
//!  CLOSED ─────────────────────▶ SYN_SENT ──────────────────▶ ESTABLISHED
//!    │                                                          ▲     │
//!    │ accept(): SYN received              reply SYN|ACK        │     │ close():
//!    └──────────────────────────▶ SYN_RCVD ─────────────────────┘     │ send STP
//!                                                                     ▼
//!  CLOSED ◀─── FIN received (or STP received: simultaneous close) ── CLOSING
//!    ▲
//!    └──── STP received while ESTABLISHED: reply FIN
//! ```
//!
//! `Closed` is both the initial and the terminal state.  A connection that
//! has been torn down is never reopened.

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; initial and terminal state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for an ACK-bearing reply.
    SynSent,
    /// SYN received; the ACK-bearing reply is on its way.
    SynReceived,
    /// Handshake complete; data may flow in both directions.
    Established,
    /// Local side sent STP; waiting for the peer's FIN.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}
