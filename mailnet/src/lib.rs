//! `mailnet` — reliable, port-addressed connections over a lossy,
//! single-hop packet link.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────┐
//!  │                 Connection                   │
//!  │  handshake / teardown FSM, read / write,     │
//!  │  Window (16 slots), receiver loop            │
//!  └────┬─────────────────────────────────▲───────┘
//!       │ send(Message)                   │ receive(port)
//!  ┌────▼─────────────────────────────────┴───────┐
//!  │                 PostOffice                   │
//!  │  send gate, 128 mailboxes, delivery loop,    │
//!  │  port pool                                   │
//!  └────┬─────────────────────────────────▲───────┘
//!       │ encode                          │ decode
//!  ┌────▼─────────────────────────────────┴───────┐
//!  │                   Link                       │
//!  │  (simulator::Network or socket::UdpLink)     │
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`link`]         — link adapter boundary (raw packets)
//! - [`packet`]       — wire format (8-byte header + payload)
//! - [`post_office`]  — per-port mailboxes, serialised sends, port leases
//! - [`window`]       — send-side sliding window
//! - [`receiver`]     — inbound sequencing policy
//! - [`connection`]   — per-connection lifecycle and data transfer
//! - [`state`]        — finite-state-machine types
//! - [`timer`]        — retransmission timeout estimation
//! - [`config`]       — tunable parameters
//! - [`error`]        — error taxonomy
//! - [`simulator`]    — in-process lossy network for testing
//! - [`socket`]       — UDP link adapter

pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod packet;
pub mod post_office;
pub mod receiver;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;
pub mod window;

pub use config::Config;
pub use connection::Connection;
pub use error::{ConnError, Result};
pub use link::{Link, LinkAddr, Packet};
pub use packet::{Endpoint, Flags, Message, Port};
pub use post_office::PostOffice;
pub use state::ConnectionState;
