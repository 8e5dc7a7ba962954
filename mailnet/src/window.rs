//! Send-side sliding window.
//!
//! A [`Window`] holds every data segment that has been transmitted but not
//! yet acknowledged.  Admission is gated by a semaphore carrying one permit
//! per free slot, so a writer facing a full window parks until an ACK
//! returns a permit, and each ACK wakes at most one parked writer.
//!
//! Unlike a Go-Back-N window, ACKs here are **selective**: an ACK echoes the
//! sequence number of exactly one segment, and slots free in the order ACKs
//! arrive, not the order segments were sent.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::packet::Message;

/// Maximum number of unacknowledged segments per connection.
pub const WINDOW_CAPACITY: usize = 16;

/// The window was closed while a writer waited for a slot.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("send window closed")]
pub struct WindowClosed;

/// A segment occupying one slot.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// The segment as it went on the wire.
    pub segment: Message,
    /// Total number of times this segment has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

#[derive(Debug)]
pub struct Window {
    capacity: usize,
    outstanding: Mutex<BTreeMap<u32, InFlight>>,
    slots: Semaphore,
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: Mutex::new(BTreeMap::new()),
            slots: Semaphore::new(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, InFlight>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a free slot, then record `segment` as outstanding.
    ///
    /// Call immediately before handing the segment to the post office.
    pub async fn admit(&self, segment: Message) -> Result<(), WindowClosed> {
        let permit = self.slots.acquire().await.map_err(|_| WindowClosed)?;
        permit.forget();
        self.lock().insert(
            segment.seq,
            InFlight {
                segment,
                tx_count: 1,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove `seq` from the window, freeing its slot.
    ///
    /// Returns the entry, or `None` for an ACK that matches nothing
    /// outstanding (duplicate or stale).
    pub fn acknowledge(&self, seq: u32) -> Option<InFlight> {
        let entry = self.lock().remove(&seq)?;
        self.slots.add_permits(1);
        Some(entry)
    }

    /// Segments outstanding for at least `rto` as of `now`.
    ///
    /// Each returned entry is stamped as re-sent at `now` and its
    /// `tx_count` already includes the retransmission the caller is about to
    /// make.
    pub fn expired(&self, rto: Duration, now: Instant) -> Vec<InFlight> {
        let mut outstanding = self.lock();
        outstanding
            .values_mut()
            .filter(|entry| now.saturating_duration_since(entry.sent_at) >= rto)
            .map(|entry| {
                entry.tx_count += 1;
                entry.sent_at = now;
                entry.clone()
            })
            .collect()
    }

    /// Wait until every outstanding segment has been acknowledged.
    ///
    /// Holds all slots for an instant, so it must not race a writer on the
    /// same connection.  Fails if the window is closed first.
    pub async fn drained(&self) -> Result<(), WindowClosed> {
        let all = u32::try_from(self.capacity).map_err(|_| WindowClosed)?;
        let _slots = self.slots.acquire_many(all).await.map_err(|_| WindowClosed)?;
        Ok(())
    }

    /// Wake every parked writer with [`WindowClosed`] and refuse new
    /// admissions.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of unacknowledged segments.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.lock().contains_key(&seq)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::packet::{Endpoint, Flags};

    fn segment(seq: u32) -> Message {
        Message::new(
            Endpoint::new(1, 10),
            Endpoint::new(2, 20),
            Flags::empty(),
            seq,
            vec![seq as u8],
        )
    }

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let window = Window::new();
        for seq in 0..WINDOW_CAPACITY as u32 {
            window.admit(segment(seq)).await.unwrap();
        }
        assert!(window.is_full());
        assert_eq!(window.len(), WINDOW_CAPACITY);
    }

    #[tokio::test]
    async fn full_window_blocks_until_ack() {
        let window = Arc::new(Window::with_capacity(2));
        window.admit(segment(0)).await.unwrap();
        window.admit(segment(1)).await.unwrap();

        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.admit(segment(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(window.len(), 2);

        assert!(window.acknowledge(1).is_some());
        blocked.await.unwrap().unwrap();
        assert!(window.contains(0));
        assert!(window.contains(2));
        assert!(!window.contains(1));
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn unknown_ack_frees_nothing() {
        let window = Window::with_capacity(1);
        window.admit(segment(0)).await.unwrap();
        assert!(window.acknowledge(7).is_none());
        assert!(window.acknowledge(0).is_some());
        assert!(window.acknowledge(0).is_none());
        assert!(window.is_empty());
        // Exactly one slot came back.
        window.admit(segment(1)).await.unwrap();
        assert!(window.is_full());
    }

    #[tokio::test]
    async fn close_wakes_parked_writer() {
        let window = Arc::new(Window::with_capacity(1));
        window.admit(segment(0)).await.unwrap();
        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.admit(segment(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close();
        assert_eq!(blocked.await.unwrap(), Err(WindowClosed));
        assert!(window.is_closed());
    }

    #[tokio::test]
    async fn drained_waits_for_last_ack() {
        let window = Arc::new(Window::with_capacity(4));
        window.admit(segment(0)).await.unwrap();
        window.admit(segment(1)).await.unwrap();

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.drained().await })
        };
        window.acknowledge(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.acknowledge(1);
        waiter.await.unwrap().unwrap();
        // Every slot is free again afterwards.
        for seq in 2..6 {
            window.admit(segment(seq)).await.unwrap();
        }
        assert!(window.is_full());
    }

    #[tokio::test]
    async fn drained_fails_once_closed() {
        let window = Arc::new(Window::with_capacity(2));
        window.admit(segment(0)).await.unwrap();
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.drained().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close();
        assert_eq!(waiter.await.unwrap(), Err(WindowClosed));
    }

    #[tokio::test]
    async fn expired_restamps_and_counts() {
        let window = Window::new();
        window.admit(segment(0)).await.unwrap();
        let later = Instant::now() + Duration::from_secs(2);

        let expired = window.expired(Duration::from_secs(1), later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].segment.seq, 0);
        assert_eq!(expired[0].tx_count, 2);

        // Just re-sent, so not yet expired again.
        assert!(window.expired(Duration::from_secs(1), later).is_empty());
    }
}
