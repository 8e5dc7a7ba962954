//! In-process network simulator for deterministic testing.
//!
//! Real links drop packets.  To exercise the transport without depending on
//! actual network conditions, a [`Network`] plays the role of the medium
//! shared by several [`Link`]s and applies a configurable fault model:
//!
//! | Fault       | Description                                          |
//! |-------------|------------------------------------------------------|
//! | Packet loss | Drop a packet with probability `loss_rate`.          |
//! | Latency     | Hold every packet for `delay` before delivery.       |
//!
//! The link contract forbids corruption and duplication, so the simulator
//! never does either.  Losses are drawn from a seeded RNG so a failing test
//! can be replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::{self, Link, LinkAddr, Packet, Wire, DEFAULT_MAX_PACKET_PAYLOAD};

/// Configuration for the fault-injection model.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability in `[0.0, 1.0]` that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Fixed latency applied to every delivered packet.
    pub delay: Duration,
    /// Seed for the loss RNG.
    pub seed: u64,
    /// Maximum packet payload of every attached link.
    pub max_payload: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            delay: Duration::ZERO,
            seed: 0,
            max_payload: DEFAULT_MAX_PACKET_PAYLOAD,
        }
    }
}

#[derive(Debug)]
struct Medium {
    config: SimulatorConfig,
    routes: Mutex<HashMap<LinkAddr, mpsc::Sender<Packet>>>,
    rng: Mutex<StdRng>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Medium {
    fn lost(&self) -> bool {
        if self.config.loss_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.random_bool(self.config.loss_rate.min(1.0))
    }

    fn route(&self, addr: LinkAddr) -> Option<mpsc::Sender<Packet>> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.get(&addr).cloned()
    }

    fn deliver(&self, packet: Packet) {
        let dst = packet.dst_link;
        match self.route(dst) {
            Some(inbound) if inbound.try_send(packet).is_ok() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                log::debug!("[sim] receive register of link {dst} full; packet lost");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                log::debug!("[sim] no link attached at {dst}; packet lost");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A simulated single-hop medium connecting any number of links.
#[derive(Debug)]
pub struct Network {
    medium: Arc<Medium>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            medium: Arc::new(Medium {
                config,
                routes: Mutex::new(HashMap::new()),
                rng: Mutex::new(rng),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// A loss-free network.
    pub fn reliable() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Attach a new link at `addr`, replacing any link already there.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, addr: LinkAddr) -> Link {
        let (link, wire) = link::channel(addr, self.medium.config.max_payload);
        let Wire { outbound, inbound } = wire;
        self.medium
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, inbound);

        let pump = tokio::spawn(pump(Arc::clone(&self.medium), outbound));
        self.pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pump);
        log::debug!("[sim] link {addr} attached");
        link
    }

    /// Packets handed to a receiving link so far.
    pub fn delivered(&self) -> u64 {
        self.medium.delivered.load(Ordering::Relaxed)
    }

    /// Packets lost so far, whether by the fault model or for lack of a
    /// receiver.
    pub fn dropped(&self) -> u64 {
        self.medium.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        for pump in self
            .pumps
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            pump.abort();
        }
    }
}

/// Carry one link's outbound packets across the medium.
async fn pump(medium: Arc<Medium>, mut outbound: mpsc::Receiver<Packet>) {
    while let Some(packet) = outbound.recv().await {
        if medium.lost() {
            log::debug!(
                "[sim] dropped packet {} → {} ({} bytes)",
                packet.src_link,
                packet.dst_link,
                packet.bytes.len()
            );
            medium.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let delay = medium.config.delay;
        if delay.is_zero() {
            medium.deliver(packet);
        } else {
            let medium = Arc::clone(&medium);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                medium.deliver(packet);
            });
        }
    }
}
