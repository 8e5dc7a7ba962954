//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one session between two
//! `(link, port)` endpoints:
//! - the handshake (`SYN` → `SYN|ACK`) and teardown (`STP` → `FIN`),
//! - the send [`Window`] that throttles `write()`,
//! - a background *receiver loop* that owns the local port's mailbox while
//!   the connection is open.
//!
//! # Receiver loop
//!
//! ```text
//!   post office ──mailbox[local port]──▶ receiver loop ──inbox (mpsc)──▶ read()
//!                                           │    │
//!                        ACK ──────────────-┘    └── STP / FIN ──▶ state (watch)
//!                        frees a Window slot            wakes close() / read() / write()
//! ```
//!
//! The loop and the application talk only through channels: payload chunks
//! flow through an unbounded `mpsc` queue, state changes through a `watch`,
//! and free window slots through the window's semaphore.  On teardown the
//! loop drops its end of the inbox, so a blocked `read()` returns with
//! whatever was already queued.
//!
//! # Teardown
//!
//! `close()` sends STP only after every written segment is acknowledged,
//! and STP carries the next send seq.  The receiving side holds off its FIN
//! until everything below that seq has been delivered, so an acknowledged
//! byte is never lost to teardown.
//!
//! # Concurrency
//!
//! `read`, `write` and `close` take `&mut self`: a connection serves one
//! application task at a time.  Interleaving segments from concurrent
//! writers is not supported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::error::{ConnError, Result};
use crate::link::{LinkAddr, LinkError};
use crate::packet::{Endpoint, Flags, FramingError, Message, Port, PORT_LIMIT};
use crate::post_office::{PortLease, PostOffice};
use crate::receiver::Receiver;
use crate::state::ConnectionState;
use crate::timer::RetransmitTimer;
use crate::window::Window;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State touched by both the application-facing handle and the receiver
/// loop.
#[derive(Debug)]
struct Shared {
    local: Endpoint,
    state: watch::Sender<ConnectionState>,
    window: Window,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::info!("[conn {}] {prev} → {next}", self.local);
        }
    }

    /// Move `from` → `to` atomically; `false` if the state was not `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            log::info!("[conn {}] {from} → {to}", self.local);
        }
        moved
    }

    /// Enter `Closed` and release every writer parked on the window.
    fn teardown(&self) {
        self.set_state(ConnectionState::Closed);
        self.window.close();
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to one reliable, port-addressed connection.
///
/// Obtain one via [`Connection::new`] + [`Connection::connect`] (or
/// [`Connection::open`]) on the active side, or [`Connection::accept`] on
/// the passive side.  The receiver loop keeps answering a repeated STP
/// after teardown; dropping the handle stops it and returns the local port
/// to the pool.
#[derive(Debug)]
pub struct Connection {
    post_office: Arc<PostOffice>,
    local: Endpoint,
    remote: Endpoint,
    shared: Arc<Shared>,
    /// Sequence number for the next data segment.
    next_send_seq: u32,
    /// Payload chunks from the receiver loop, in delivery order.
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Tail of a chunk that did not fit the caller's buffer.
    pending: Vec<u8>,
    /// Set once the handshake completes; a connection is never reopened.
    established_once: bool,
    receiver: Option<JoinHandle<()>>,
    _lease: PortLease,
}

impl Connection {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Create an unopened connection to `(remote_link, remote_port)` on a
    /// freshly leased ephemeral port.
    ///
    /// Fails with [`ConnError::ResourceExhausted`] when no port is free.
    pub fn new(
        post_office: Arc<PostOffice>,
        remote_link: LinkAddr,
        remote_port: Port,
    ) -> Result<Self> {
        if usize::from(remote_port) >= PORT_LIMIT {
            return Err(ConnError::InvalidPort(remote_port));
        }
        let lease = post_office.allocate_port()?;
        Ok(Self::bind(
            post_office,
            lease,
            Endpoint::new(remote_link, remote_port),
        ))
    }

    /// Active open: [`Connection::new`] followed by [`Connection::connect`].
    pub async fn open(
        post_office: Arc<PostOffice>,
        remote_link: LinkAddr,
        remote_port: Port,
    ) -> Result<Self> {
        let mut conn = Self::new(post_office, remote_link, remote_port)?;
        conn.connect().await?;
        Ok(conn)
    }

    /// Passive open: wait for a SYN on `port`, answer it and return the
    /// established connection bound to the SYN's sender.
    ///
    /// The port stays reserved for the returned connection until it is
    /// dropped.  Messages other than a bare SYN that are waiting on the port
    /// are discarded.
    pub async fn accept(post_office: Arc<PostOffice>, port: Port) -> Result<Self> {
        let lease = post_office.claim_port(port)?;
        log::debug!("[conn] listening on port {port}");

        let syn = loop {
            let Some(message) = post_office.receive(port, true).await? else {
                return Err(LinkError::Detached.into());
            };
            if message.flags == Flags::SYN {
                break message;
            }
            log::debug!("[conn] accept on port {port}: skipping {message}");
        };

        let mut conn = Self::bind(post_office, lease, syn.src);
        conn.shared.set_state(ConnectionState::SynReceived);
        let reply = syn.reply(Flags::SYN | Flags::ACK, syn.seq);
        if let Err(e) = conn.post_office.send(&reply).await {
            conn.shared.set_state(ConnectionState::Closed);
            return Err(e);
        }
        conn.establish();
        Ok(conn)
    }

    fn bind(post_office: Arc<PostOffice>, lease: PortLease, remote: Endpoint) -> Self {
        let local = Endpoint::new(post_office.link_addr(), lease.port());
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            post_office,
            local,
            remote,
            shared: Arc::new(Shared {
                local,
                state,
                window: Window::new(),
            }),
            next_send_seq: 0,
            inbox: None,
            pending: Vec::new(),
            established_once: false,
            receiver: None,
            _lease: lease,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn local(&self) -> Endpoint {
        self.local
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    /// Number of data segments sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.shared.window.len()
    }

    /// Sequence number the next data segment will carry.
    pub fn next_send_seq(&self) -> u32 {
        self.next_send_seq
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Send SYN and wait for an ACK-bearing reply from the peer.
    ///
    /// Valid only on a connection that has never been opened.  A reply
    /// without ACK fails the call with [`ConnError::HandshakeFailed`] and
    /// leaves the connection `Closed`.
    pub async fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Closed || self.established_once {
            return Err(ConnError::BadState {
                op: "connect",
                state,
            });
        }

        let syn = Message::new(self.local, self.remote, Flags::SYN, 0, Vec::new());
        self.post_office.send(&syn).await?;
        self.shared.set_state(ConnectionState::SynSent);

        match self.await_handshake_reply(&syn).await {
            Ok(()) => {
                self.establish();
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    async fn await_handshake_reply(&self, syn: &Message) -> Result<()> {
        let config = self.post_office.config();
        let mut timer = RetransmitTimer::new(config);
        let mut retries = 0u32;

        loop {
            let received = self.post_office.receive(self.local.port, true);
            let reply = if config.retransmit {
                match timeout(timer.rto(), received).await {
                    Ok(reply) => reply?,
                    Err(_elapsed) => {
                        retries += 1;
                        if retries > config.max_retries {
                            log::warn!(
                                "[conn {}] no reply to SYN from {} after {} retries",
                                self.local,
                                self.remote,
                                config.max_retries
                            );
                            return Err(ConnError::HandshakeFailed);
                        }
                        log::debug!("[conn {}] SYN timeout; resending", self.local);
                        self.post_office.send(syn).await?;
                        timer.back_off();
                        continue;
                    }
                }
            } else {
                received.await?
            };

            let Some(reply) = reply else {
                return Err(LinkError::Detached.into());
            };
            if reply.src != self.remote {
                log::debug!("[conn {}] ignoring {reply} during handshake", self.local);
                continue;
            }
            if reply.flags.contains(Flags::ACK) {
                return Ok(());
            }
            log::warn!("[conn {}] handshake rejected: {reply}", self.local);
            return Err(ConnError::HandshakeFailed);
        }
    }

    /// Enter `Established` and start the receiver loop.
    fn establish(&mut self) {
        let config = self.post_office.config();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let task = ReceiverLoop {
            post_office: Arc::clone(&self.post_office),
            shared: Arc::clone(&self.shared),
            remote: self.remote,
            sequencer: Receiver::new(config.order),
            inbox: Some(inbox_tx),
            timer: RetransmitTimer::new(config),
        };

        self.inbox = Some(inbox_rx);
        self.established_once = true;
        self.shared.set_state(ConnectionState::Established);
        self.receiver = Some(tokio::spawn(task.run()));
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send `buf` as a run of data segments.
    ///
    /// Each segment waits for a free slot in the send window before it is
    /// transmitted, so this call blocks while 16 segments are unacknowledged.
    /// Fails at once, without sending anything, unless the connection is
    /// `Established`; fails with [`ConnError::Reset`] if the connection is
    /// torn down while waiting for a slot.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let state = self.state();
        if state != ConnectionState::Established {
            return Err(ConnError::BadState { op: "write", state });
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let max = self.post_office.max_contents_len();
        if max == 0 {
            return Err(FramingError::PayloadTooLong { len: buf.len(), max }.into());
        }

        let mut written = 0;
        for chunk in buf.chunks(max) {
            let seq = self.next_send_seq;
            let segment = Message::new(self.local, self.remote, Flags::empty(), seq, chunk.to_vec());

            self.shared
                .window
                .admit(segment.clone())
                .await
                .map_err(|_| ConnError::Reset)?;
            self.next_send_seq = seq.wrapping_add(1);
            self.post_office.send(&segment).await?;

            log::debug!(
                "[conn {}] → DATA seq={seq} len={} in_flight={}",
                self.local,
                chunk.len(),
                self.shared.window.len()
            );
            written += chunk.len();
        }
        Ok(written)
    }

    /// Read received bytes into `buf`.
    ///
    /// Returns whatever is already queued, up to `buf.len()`.  When nothing
    /// is queued the call waits for the next data segment or for teardown.
    /// After teardown every queued byte is still returned, then `Ok(0)`
    /// forever.  Fails only on a connection that was never established.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.established_once {
            return Err(ConnError::BadState {
                op: "read",
                state: self.state(),
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut n = take_pending(&mut self.pending, buf);
        let Some(inbox) = self.inbox.as_mut() else {
            return Ok(n);
        };

        while n < buf.len() {
            match inbox.try_recv() {
                Ok(chunk) => n += fill(&mut buf[n..], chunk, &mut self.pending),
                Err(_) => break,
            }
        }
        if n > 0 {
            return Ok(n);
        }

        match inbox.recv().await {
            Some(chunk) => Ok(fill(buf, chunk, &mut self.pending)),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Wait for every written segment to be acknowledged, then send STP and
    /// wait for the peer's FIN.
    ///
    /// A no-op on a connection that is not open (never established, or
    /// already torn down by the peer or by a reset while draining).  If
    /// retransmission is enabled and the peer stays silent for `max_retries`
    /// STP resends, the connection is closed locally anyway.
    pub async fn close(&mut self) -> Result<()> {
        let mut closed = self.shared.state.subscribe();
        match self.state() {
            ConnectionState::Established => {
                if self.shared.window.drained().await.is_err() {
                    log::debug!("[conn {}] torn down before the window drained", self.local);
                    return Ok(());
                }
                if !self
                    .shared
                    .transition(ConnectionState::Established, ConnectionState::Closing)
                {
                    return Ok(());
                }
            }
            ConnectionState::Closing => {}
            state => {
                log::debug!("[conn {}] close while {state}: nothing to do", self.local);
                return Ok(());
            }
        }

        // The peer tears down once everything below this seq has arrived.
        let stp = Message::new(self.local, self.remote, Flags::STP, self.next_send_seq, Vec::new());
        self.post_office.send(&stp).await?;

        let config = self.post_office.config().clone();
        let mut timer = RetransmitTimer::new(&config);
        let mut retries = 0u32;
        loop {
            if !config.retransmit {
                let _ = closed.wait_for(|s| *s == ConnectionState::Closed).await;
                break;
            }
            let finished = timeout(
                timer.rto(),
                closed.wait_for(|s| *s == ConnectionState::Closed),
            )
            .await
            .is_ok();
            if finished {
                break;
            }

            retries += 1;
            if retries > config.max_retries {
                log::warn!("[conn {}] STP not answered; force-closing", self.local);
                self.shared.teardown();
                self.stop_receiver();
                break;
            }
            log::debug!("[conn {}] STP timeout; resending", self.local);
            self.post_office.send(&stp).await?;
            timer.back_off();
        }
        Ok(())
    }

    fn stop_receiver(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state() != ConnectionState::Closed {
            log::debug!("[conn {}] dropped while {}", self.local, self.state());
            self.shared.teardown();
        }
        self.stop_receiver();
    }
}

/// Move bytes left over from an earlier read into `buf`.
fn take_pending(pending: &mut Vec<u8>, buf: &mut [u8]) -> usize {
    let n = pending.len().min(buf.len());
    buf[..n].copy_from_slice(&pending[..n]);
    pending.drain(..n);
    n
}

/// Copy `chunk` into `buf`, keeping what does not fit in `pending`.
fn fill(buf: &mut [u8], chunk: Vec<u8>, pending: &mut Vec<u8>) -> usize {
    let n = chunk.len().min(buf.len());
    buf[..n].copy_from_slice(&chunk[..n]);
    if n < chunk.len() {
        pending.extend_from_slice(&chunk[n..]);
    }
    n
}

// ---------------------------------------------------------------------------
// Receiver loop
// ---------------------------------------------------------------------------

/// Background task owning the local port's mailbox while a connection is
/// held.
///
/// After teardown the loop lingers until the handle is dropped: it drops
/// the inbox so `read()` sees EOF, stops retransmitting, and answers any
/// repeated STP with another FIN in case the first one was lost.
struct ReceiverLoop {
    post_office: Arc<PostOffice>,
    shared: Arc<Shared>,
    remote: Endpoint,
    sequencer: Receiver,
    /// `None` once the connection is torn down.
    inbox: Option<mpsc::UnboundedSender<Vec<u8>>>,
    timer: RetransmitTimer,
}

impl ReceiverLoop {
    async fn run(mut self) {
        let post_office = Arc::clone(&self.post_office);
        let local = self.shared.local;
        let config = post_office.config().clone();

        let mut ticker = tokio::time::interval(config.tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let open = self.inbox.is_some();
            tokio::select! {
                received = post_office.receive(local.port, true) => match received {
                    Ok(Some(message)) if open => self.dispatch(message).await,
                    Ok(Some(message)) => self.linger(message).await,
                    Ok(None) | Err(_) => {
                        if open {
                            log::warn!("[conn {local}] link gone; tearing down");
                            self.shut();
                        }
                        break;
                    }
                },
                _ = ticker.tick(), if config.retransmit && open => {
                    self.retransmit_expired(config.max_retries).await;
                }
            }
        }
        log::debug!("[conn {local}] receiver loop stopped");
    }

    /// Tear the connection down and release `read()` with EOF.
    fn shut(&mut self) {
        self.shared.teardown();
        self.inbox = None;
    }

    async fn dispatch(&mut self, message: Message) {
        let local = self.shared.local;
        if message.src != self.remote {
            log::debug!("[conn {local}] ignoring stray {message}");
            return;
        }
        let flags = message.flags;

        if flags.contains(Flags::SYN) {
            if flags.contains(Flags::ACK) {
                log::debug!("[conn {local}] stale handshake reply ignored");
            } else {
                // The peer missed our SYN|ACK.
                self.reply(&message, Flags::SYN | Flags::ACK).await;
                self.shared
                    .transition(ConnectionState::SynReceived, ConnectionState::Established);
            }
            return;
        }

        if flags.contains(Flags::STP) {
            // STP carries the peer's next send seq; anything below it that
            // is still missing will be retransmitted, and so will the STP.
            if !self.sequencer.delivered_before(message.seq) {
                log::debug!(
                    "[conn {local}] STP seq={} while seq={} is missing; holding off",
                    message.seq,
                    self.sequencer.expected()
                );
                return;
            }
            self.reply(&message, Flags::FIN).await;
            if self.shared.state() == ConnectionState::Closing {
                log::info!("[conn {local}] simultaneous close with {}", self.remote);
            } else {
                log::info!("[conn {local}] peer {} closed the connection", self.remote);
            }
            self.shut();
            return;
        }

        if flags.contains(Flags::FIN) {
            if self.shared.state() != ConnectionState::Closing {
                log::warn!("[conn {local}] unexpected FIN while {}", self.shared.state());
            }
            self.shut();
            return;
        }

        if flags.contains(Flags::ACK) {
            match self.shared.window.acknowledge(message.seq) {
                Some(entry) => {
                    if entry.tx_count == 1 {
                        self.timer.record_rtt_sample(entry.sent_at.elapsed());
                    } else {
                        self.timer.reset();
                    }
                    log::debug!(
                        "[conn {local}] ← ACK seq={} in_flight={}",
                        message.seq,
                        self.shared.window.len()
                    );
                }
                None => log::debug!("[conn {local}] duplicate ACK seq={}", message.seq),
            }
            return;
        }

        self.reply(&message, Flags::ACK).await;
        log::debug!(
            "[conn {local}] ← DATA seq={} len={}",
            message.seq,
            message.payload.len()
        );
        if message.payload.is_empty() {
            return;
        }
        let chunks = self.sequencer.on_segment(message.seq, message.payload);
        if let Some(inbox) = &self.inbox {
            for chunk in chunks {
                // A dropped handle discards whatever is still in flight.
                let _ = inbox.send(chunk);
            }
        }
    }

    /// Handle a message arriving after teardown.
    async fn linger(&self, message: Message) {
        if message.src == self.remote && message.flags.contains(Flags::STP) {
            log::debug!("[conn {}] repeated STP; sending FIN again", self.shared.local);
            self.reply(&message, Flags::FIN).await;
        }
    }

    /// Answer `message` with an empty `flags` reply echoing its sequence
    /// number.
    async fn reply(&self, message: &Message, flags: Flags) {
        if let Err(e) = self.post_office.send(&message.reply(flags, message.seq)).await {
            log::warn!("[conn {}] failed to send {flags}: {e}", self.shared.local);
        }
    }

    async fn retransmit_expired(&mut self, max_retries: u32) {
        let local = self.shared.local;
        let expired = self.shared.window.expired(self.timer.rto(), Instant::now());
        if expired.is_empty() {
            return;
        }

        if let Some(entry) = expired.iter().find(|e| e.tx_count > max_retries + 1) {
            log::warn!(
                "[conn {local}] seq={} unacknowledged after {max_retries} retries; resetting",
                entry.segment.seq
            );
            self.shut();
            return;
        }

        log::debug!("[conn {local}] timeout; retransmitting {} segment(s)", expired.len());
        for entry in &expired {
            if let Err(e) = self.post_office.send(&entry.segment).await {
                log::warn!("[conn {local}] retransmit of seq={} failed: {e}", entry.segment.seq);
            }
        }
        self.timer.back_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_keeps_overflow_pending() {
        let mut pending = Vec::new();
        let mut buf = [0u8; 3];
        assert_eq!(fill(&mut buf, b"hello".to_vec(), &mut pending), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(pending, b"lo");
    }

    #[test]
    fn take_pending_drains_front() {
        let mut pending = b"abcdef".to_vec();
        let mut buf = [0u8; 4];
        assert_eq!(take_pending(&mut pending, &mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(pending, b"ef");
        assert_eq!(take_pending(&mut pending, &mut buf), 2);
        assert!(pending.is_empty());
    }
}
