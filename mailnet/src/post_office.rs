//! Port multiplexing over a single link.
//!
//! The [`PostOffice`] is the only component that touches the [`Link`].  It
//! owns one bounded mailbox per port and a background *delivery loop* that
//! waits for inbound packets, decodes them and drops each into the mailbox
//! of its destination port.  Outbound messages are framed and handed to the
//! link one at a time.
//!
//! ```text
//!   Connection ─send()──▶ [send gate] ─▶ Link ─▶ wire
//!   Connection ◀─receive(port)── mailbox[port] ◀─ delivery loop ◀─ Link
//! ```
//!
//! Inbound packets that fail to decode, and messages that find their
//! mailbox full, are dropped silently: to the layers above that is the same
//! as loss on the link.
//!
//! The post office also owns the [`PortPool`] from which connections lease
//! their local ports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{ConnError, Result};
use crate::link::{Link, LinkAddr};
use crate::packet::{max_contents_len, Message, Port, PORT_LIMIT};

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

/// Pool of unused port numbers.
///
/// The lock is held only while a port is inserted or removed.
#[derive(Debug)]
pub struct PortPool {
    free: Mutex<VecDeque<Port>>,
}

impl PortPool {
    /// A pool holding every port in `0..PORT_LIMIT`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..PORT_LIMIT as Port).collect()),
        })
    }

    fn with_free<R>(&self, f: impl FnOnce(&mut VecDeque<Port>) -> R) -> R {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *free)
    }

    /// Take the least recently released port.
    pub fn allocate(self: &Arc<Self>) -> Result<PortLease> {
        let port = self
            .with_free(|free| free.pop_front())
            .ok_or(ConnError::ResourceExhausted)?;
        Ok(PortLease {
            port,
            pool: Arc::clone(self),
        })
    }

    /// Reserve a specific port, e.g. for a listener.
    pub fn claim(self: &Arc<Self>, port: Port) -> Result<PortLease> {
        if usize::from(port) >= PORT_LIMIT {
            return Err(ConnError::InvalidPort(port));
        }
        let taken = self.with_free(|free| {
            let idx = free.iter().position(|&p| p == port)?;
            free.remove(idx)
        });
        match taken {
            Some(port) => Ok(PortLease {
                port,
                pool: Arc::clone(self),
            }),
            None => Err(ConnError::PortInUse(port)),
        }
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.with_free(|free| free.len())
    }

    fn release(&self, port: Port) {
        self.with_free(|free| free.push_back(port));
    }
}

/// Exclusive use of one port; the port returns to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: Port,
    pool: Arc<PortPool>,
}

impl PortLease {
    pub fn port(&self) -> Port {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        log::debug!("[post] port {} released", self.port);
        self.pool.release(self.port);
    }
}

// ---------------------------------------------------------------------------
// PostOffice
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Mailbox {
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

/// Per-port mailboxes plus serialised transmission over one [`Link`].
#[derive(Debug)]
pub struct PostOffice {
    link: Arc<Link>,
    config: Config,
    mailboxes: Vec<Mailbox>,
    /// At most one packet is handed to the hardware at a time.
    send_gate: tokio::sync::Mutex<()>,
    ports: Arc<PortPool>,
    delivery: JoinHandle<()>,
}

impl PostOffice {
    /// Take ownership of `link` and start the delivery loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(link: Link, config: Config) -> Arc<Self> {
        let link = Arc::new(link);
        let capacity = config.mailbox_capacity.max(1);

        let (senders, mailboxes): (Vec<_>, Vec<_>) = (0..PORT_LIMIT)
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity);
                (
                    tx,
                    Mailbox {
                        rx: tokio::sync::Mutex::new(rx),
                    },
                )
            })
            .unzip();

        let delivery = tokio::spawn(delivery_loop(Arc::clone(&link), senders));
        log::info!("[post] post office up on link {}", link.addr());

        Arc::new(Self {
            link,
            config,
            mailboxes,
            send_gate: tokio::sync::Mutex::new(()),
            ports: PortPool::new(),
            delivery,
        })
    }

    /// Link address of this machine.
    pub fn link_addr(&self) -> LinkAddr {
        self.link.addr()
    }

    /// Largest payload one message can carry on this link.
    pub fn max_contents_len(&self) -> usize {
        max_contents_len(self.link.max_payload())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Lease an ephemeral port for an active open.
    ///
    /// Anything left in the port's mailbox by a previous session is
    /// discarded.
    pub fn allocate_port(&self) -> Result<PortLease> {
        let lease = self.ports.allocate()?;
        let stale = self.drain(lease.port());
        if stale > 0 {
            log::debug!(
                "[post] discarded {stale} stale message(s) on port {}",
                lease.port()
            );
        }
        Ok(lease)
    }

    /// Lease a specific port for a passive open.
    pub fn claim_port(&self, port: Port) -> Result<PortLease> {
        self.ports.claim(port)
    }

    /// Frame `message` and hand it to the link.
    ///
    /// Returns once the link has taken the packet; never waits on the remote
    /// side.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let packet = message.encode(self.link.max_payload())?;
        let _gate = self.send_gate.lock().await;
        log::debug!("[post] → {message}");
        self.link.send(packet).await?;
        Ok(())
    }

    /// Pop the next message from `port`'s mailbox.
    ///
    /// With `blocking` the call waits for a message; it returns `None` only
    /// once the link is gone.  Without `blocking` it returns `None` at once
    /// when the mailbox is empty or another task is already waiting on it.
    pub async fn receive(&self, port: Port, blocking: bool) -> Result<Option<Message>> {
        let mailbox = self.mailbox(port)?;
        if blocking {
            let mut rx = mailbox.rx.lock().await;
            return Ok(rx.recv().await);
        }
        Ok(match mailbox.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().ok(),
            Err(_) => None,
        })
    }

    /// Discard everything queued on `port`, returning how many messages
    /// were dropped.
    pub fn drain(&self, port: Port) -> usize {
        let Ok(mailbox) = self.mailbox(port) else {
            return 0;
        };
        let Ok(mut rx) = mailbox.rx.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    fn mailbox(&self, port: Port) -> Result<&Mailbox> {
        self.mailboxes
            .get(usize::from(port))
            .ok_or(ConnError::InvalidPort(port))
    }
}

impl Drop for PostOffice {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}

/// Move packets from the link into mailboxes until the link goes away.
async fn delivery_loop(link: Arc<Link>, mailboxes: Vec<mpsc::Sender<Message>>) {
    while let Some(packet) = link.receive().await {
        let message = match Message::decode(&packet) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("[post] dropping malformed packet from link {}: {e}", packet.src_link);
                continue;
            }
        };

        let port = message.dst.port;
        let Some(mailbox) = mailboxes.get(usize::from(port)) else {
            continue;
        };
        match mailbox.try_send(message) {
            Ok(()) => log::debug!("[post] delivered to port {port}"),
            Err(TrySendError::Full(message)) => {
                log::warn!("[post] mailbox {port} full; dropping {message}");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    log::info!("[post] link {} detached; delivery loop stopped", link.addr());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_every_port_once() {
        let pool = PortPool::new();
        let leases: Vec<_> = (0..PORT_LIMIT).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.allocate(), Err(ConnError::ResourceExhausted)));

        drop(leases);
        assert_eq!(pool.available(), PORT_LIMIT);
    }

    #[test]
    fn released_port_goes_to_back_of_queue() {
        let pool = PortPool::new();
        let first = pool.allocate().unwrap();
        assert_eq!(first.port(), 0);
        drop(first);
        assert_eq!(pool.allocate().unwrap().port(), 1);
    }

    #[test]
    fn claim_is_exclusive() {
        let pool = PortPool::new();
        let lease = pool.claim(40).unwrap();
        assert!(matches!(pool.claim(40), Err(ConnError::PortInUse(40))));
        drop(lease);
        assert!(pool.claim(40).is_ok());
    }

    #[test]
    fn claim_rejects_out_of_range_port() {
        let pool = PortPool::new();
        assert!(matches!(pool.claim(128), Err(ConnError::InvalidPort(128))));
    }
}
