//! Link adapter boundary.
//!
//! A [`Link`] is the single point where the transport touches the "hardware":
//! an unreliable, single-hop packet pipe.  Packets handed to it may be lost,
//! but a packet that does arrive is never corrupted or duplicated.
//!
//! The two interrupt callbacks of a classic network device map onto futures:
//! - [`Link::send`] resolves once the wire has taken the packet
//!   (*send complete*); it says nothing about delivery.
//! - [`Link::receive`] resolves when a packet is ready to be dequeued
//!   (*receive ready*).
//!
//! Hardware adapters ([`crate::simulator::Network`], [`crate::socket::UdpLink`])
//! sit on the other side of the pair of queues built by [`channel`] and move
//! packets between the [`Wire`] and whatever medium they model.

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Machine-wide address of one end of the link.
pub type LinkAddr = u8;

/// Largest number of bytes a single packet may carry by default.
///
/// With the 8-byte message header this leaves 23 bytes of payload per
/// message.
pub const DEFAULT_MAX_PACKET_PAYLOAD: usize = 31;

/// Packets buffered in the "receive register" before the adapter starts
/// dropping them.
const INBOUND_DEPTH: usize = 64;

/// One raw packet on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_link: LinkAddr,
    pub dst_link: LinkAddr,
    pub bytes: Vec<u8>,
}

/// Errors reported by [`Link::send`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The packet is longer than the link can carry.
    #[error("packet of {len} bytes exceeds the link maximum of {max}")]
    Oversized { len: usize, max: usize },
    /// The adapter driving the wire has gone away.
    #[error("link is detached from the wire")]
    Detached,
}

/// Transport-side handle of a link.
#[derive(Debug)]
pub struct Link {
    addr: LinkAddr,
    max_payload: usize,
    outbound: mpsc::Sender<Packet>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
}

/// Adapter-side handle of a link: the far end of [`Link`]'s queues.
#[derive(Debug)]
pub struct Wire {
    /// Packets the transport has asked to send.
    pub outbound: mpsc::Receiver<Packet>,
    /// Packets arriving from the medium.
    pub inbound: mpsc::Sender<Packet>,
}

/// Build a connected [`Link`] / [`Wire`] pair for link address `addr`.
///
/// The outbound queue holds a single packet, so the hardware never has more
/// than one send in progress.
pub fn channel(addr: LinkAddr, max_payload: usize) -> (Link, Wire) {
    let (out_tx, out_rx) = mpsc::channel(1);
    let (in_tx, in_rx) = mpsc::channel(INBOUND_DEPTH);
    let link = Link {
        addr,
        max_payload,
        outbound: out_tx,
        inbound: Mutex::new(in_rx),
    };
    let wire = Wire {
        outbound: out_rx,
        inbound: in_tx,
    };
    (link, wire)
}

impl Link {
    /// Address of this end of the link.
    pub fn addr(&self) -> LinkAddr {
        self.addr
    }

    /// Maximum packet payload, in bytes.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Hand `packet` to the hardware.
    pub async fn send(&self, packet: Packet) -> Result<(), LinkError> {
        if packet.bytes.len() > self.max_payload {
            return Err(LinkError::Oversized {
                len: packet.bytes.len(),
                max: self.max_payload,
            });
        }
        self.outbound
            .send(packet)
            .await
            .map_err(|_| LinkError::Detached)
    }

    /// Wait for the next inbound packet.
    ///
    /// Returns `None` once the adapter has dropped its end of the wire.
    pub async fn receive(&self) -> Option<Packet> {
        self.inbound.lock().await.recv().await
    }
}

impl Wire {
    /// Push an arriving packet into the receive register.
    ///
    /// Returns `false` when the register is full or the transport is gone;
    /// the packet is lost either way, as on real hardware.
    pub fn deliver(&self, packet: Packet) -> bool {
        self.inbound.try_send(packet).is_ok()
    }
}
