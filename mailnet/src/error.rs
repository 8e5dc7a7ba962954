//! Errors surfaced to callers of the post office and of connections.
//!
//! Loss is deliberately absent: dropped packets, overflowing mailboxes and
//! missing ACKs are silent protocol events, visible only as data that never
//! arrives or a window that never drains.

use thiserror::Error;

use crate::link::LinkError;
use crate::packet::{FramingError, Port};
use crate::state::ConnectionState;

#[derive(Debug, Error)]
pub enum ConnError {
    /// An outbound message could not be framed.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The link adapter refused the packet or is gone.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// The operation is not valid in the connection's current state.
    #[error("cannot {op} while {state}")]
    BadState {
        op: &'static str,
        state: ConnectionState,
    },

    /// No free port is left for a new connection.
    #[error("no free port available")]
    ResourceExhausted,

    /// Another connection or listener holds the port.
    #[error("port {0} is already in use")]
    PortInUse(Port),

    /// The port number is outside the valid range.
    #[error("port {0} is out of range")]
    InvalidPort(Port),

    /// The peer did not answer the SYN with an ACK-bearing reply.
    #[error("handshake failed")]
    HandshakeFailed,

    /// The connection was torn down while the operation was in progress.
    #[error("connection reset")]
    Reset,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConnError>;
