//! UDP link adapter.
//!
//! [`UdpLink`] drives a [`Link`] over a `tokio::net::UdpSocket`, so two
//! processes (or two machines) can talk through the transport.  Each link
//! packet travels as one datagram:
//!
//! ```text
//! +----------+----------+------------------------+
//! | dst_link | src_link | packet bytes ...       |
//! +----------+----------+------------------------+
//! ```
//!
//! Link addresses are mapped to socket addresses by a static peer table.
//! UDP itself may drop datagrams, which is exactly the loss model the
//! transport expects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::{self, Link, LinkAddr, Packet};

/// Bytes of link addressing in front of every datagram.
const ADDR_PREFIX: usize = 2;

/// Errors that can arise while setting up the socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Background tasks pumping a [`Link`] over UDP; dropping this handle
/// detaches the link.
#[derive(Debug)]
pub struct UdpLink {
    /// Address the socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpLink {
    /// Bind `local` and return a link at address `addr` whose packets reach
    /// the link addresses listed in `peers`.
    pub async fn bind(
        local: SocketAddr,
        addr: LinkAddr,
        peers: HashMap<LinkAddr, SocketAddr>,
        max_payload: usize,
    ) -> Result<(Self, Link), SocketError> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local_addr = socket.local_addr()?;
        let (link, wire) = link::channel(addr, max_payload);

        let reader = tokio::spawn(read_datagrams(
            Arc::clone(&socket),
            addr,
            max_payload,
            wire.inbound,
        ));
        let writer = tokio::spawn(write_datagrams(socket, peers, wire.outbound));
        log::info!("[udp] link {addr} bound to {local_addr}");

        Ok((
            Self {
                local_addr,
                tasks: vec![reader, writer],
            },
            link,
        ))
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_datagrams(
    socket: Arc<UdpSocket>,
    peers: HashMap<LinkAddr, SocketAddr>,
    mut outbound: mpsc::Receiver<Packet>,
) {
    while let Some(packet) = outbound.recv().await {
        let Some(dest) = peers.get(&packet.dst_link) else {
            log::debug!("[udp] no peer for link {}; packet dropped", packet.dst_link);
            continue;
        };
        let mut datagram = Vec::with_capacity(ADDR_PREFIX + packet.bytes.len());
        datagram.push(packet.dst_link);
        datagram.push(packet.src_link);
        datagram.extend_from_slice(&packet.bytes);
        if let Err(e) = socket.send_to(&datagram, dest).await {
            log::warn!("[udp] send to {dest} failed: {e}");
        }
    }
}

async fn read_datagrams(
    socket: Arc<UdpSocket>,
    addr: LinkAddr,
    max_payload: usize,
    inbound: mpsc::Sender<Packet>,
) {
    // One spare byte so oversized datagrams are detected instead of
    // silently truncated.
    let mut buf = vec![0u8; ADDR_PREFIX + max_payload + 1];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[udp] receive failed: {e}");
                continue;
            }
        };
        if n < ADDR_PREFIX || n > ADDR_PREFIX + max_payload {
            log::debug!("[udp] ignoring {n}-byte datagram from {from}");
            continue;
        }
        if buf[0] != addr {
            log::debug!("[udp] datagram for link {} ignored", buf[0]);
            continue;
        }
        let packet = Packet {
            dst_link: buf[0],
            src_link: buf[1],
            bytes: buf[ADDR_PREFIX..n].to_vec(),
        };
        if inbound.try_send(packet).is_err() {
            if inbound.is_closed() {
                break;
            }
            log::debug!("[udp] receive register full; datagram from {from} lost");
        }
    }
}
