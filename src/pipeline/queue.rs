//! Bounded hop between two pipeline stages.
//!
//! Each hop has exactly one producer stage and one consumer stage and an
//! explicit overflow policy:
//! - `DropOldest`: the producer never waits; when full, the oldest queued item
//!   is discarded to make room.
//! - `Block`: the producer waits for space (backpressure). The wait is sliced
//!   so a closed queue always releases it.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a blocked producer waits before re-checking the closed flag.
const BLOCK_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    Block,
}

#[derive(Debug, Default)]
struct QueueCounters {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
    high_water: AtomicUsize,
}

/// Point-in-time queue statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: &'static str,
    pub capacity: usize,
    pub len: usize,
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    /// Pushes that had to wait for space.
    pub blocked: u64,
    pub high_water: usize,
}

/// Result of a timed pop.
#[derive(Debug)]
pub enum Pop<T> {
    Item(T),
    /// Nothing arrived within the timeout.
    Empty,
    /// Closed and fully drained.
    Closed,
}

/// Push rejected because the queue is closed. Hands the item back.
#[derive(Debug)]
pub struct QueueClosed<T>(pub T);

/// Bounded single-producer / single-consumer queue. Cloning yields another
/// handle to the same queue.
pub struct PipelineQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    tx: Sender<T>,
    rx: Receiver<T>,
    closed: Arc<AtomicBool>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for PipelineQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            capacity: self.capacity,
            policy: self.policy,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed: self.closed.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<T> PipelineQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("queue {} capacity must be greater than zero", name));
        }
        let (tx, rx) = bounded(capacity);
        Ok(Self {
            name,
            capacity,
            policy,
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(QueueCounters::default()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Push according to the queue's overflow policy.
    pub fn push(&self, item: T) -> std::result::Result<(), QueueClosed<T>> {
        if self.is_closed() {
            return Err(QueueClosed(item));
        }
        match self.policy {
            OverflowPolicy::DropOldest => self.push_drop_oldest(item),
            OverflowPolicy::Block => self.push_blocking(item),
        }
    }

    fn push_drop_oldest(&self, mut item: T) -> std::result::Result<(), QueueClosed<T>> {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.record_push();
                    return Ok(());
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped.is_power_of_two() {
                            log::warn!("queue {}: dropped {} items (oldest first)", self.name, dropped);
                        }
                    }
                }
                Err(TrySendError::Disconnected(back)) => return Err(QueueClosed(back)),
            }
        }
    }

    fn push_blocking(&self, mut item: T) -> std::result::Result<(), QueueClosed<T>> {
        let mut waited = false;
        loop {
            match self.tx.send_timeout(item, BLOCK_SLICE) {
                Ok(()) => {
                    if waited {
                        self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                    }
                    self.record_push();
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.is_closed() {
                        return Err(QueueClosed(back));
                    }
                    if !waited {
                        log::debug!("queue {} full; producer waiting", self.name);
                    }
                    waited = true;
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(back)) => return Err(QueueClosed(back)),
            }
        }
    }

    fn record_push(&self) {
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .high_water
            .fetch_max(self.tx.len(), Ordering::Relaxed);
    }

    /// Wait up to `timeout` for the next item.
    ///
    /// Items pushed before `close` are still delivered; `Closed` is returned
    /// only once the queue is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        match self.rx.try_recv() {
            Ok(item) => return self.record_pop(item),
            Err(_) if self.is_closed() => return Pop::Closed,
            Err(_) => {}
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => self.record_pop(item),
            Err(RecvTimeoutError::Timeout) if self.is_closed() => match self.rx.try_recv() {
                Ok(item) => self.record_pop(item),
                Err(_) => Pop::Closed,
            },
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    fn record_pop(&self, item: T) -> Pop<T> {
        self.counters.popped.fetch_add(1, Ordering::Relaxed);
        Pop::Item(item)
    }

    /// Stop accepting items. Already queued items remain poppable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("queue {} closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name,
            capacity: self.capacity,
            len: self.rx.len(),
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            high_water: self.counters.high_water.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn drain<T>(q: &PipelineQueue<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Pop::Item(item) = q.pop_timeout(Duration::from_millis(1)) {
            out.push(item);
        }
        out
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(PipelineQueue::<u32>::new("q", 0, OverflowPolicy::Block).is_err());
    }

    #[test]
    fn drop_oldest_keeps_freshest_items() {
        let q = PipelineQueue::new("ingest", 2, OverflowPolicy::DropOldest).unwrap();
        for i in 0..10u32 {
            q.push(i).unwrap();
        }
        assert_eq!(drain(&q), vec![8, 9]);
        let stats = q.stats();
        assert_eq!(stats.pushed, 10);
        assert_eq!(stats.dropped, 8);
        assert_eq!(stats.high_water, 2);
    }

    #[test]
    fn blocking_push_waits_for_consumer() {
        let q = PipelineQueue::new("results", 1, OverflowPolicy::Block).unwrap();
        q.push(1u32).unwrap();

        let consumer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(120));
            drain(&consumer)
        });

        let started = Instant::now();
        q.push(2).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        let mut got = handle.join().unwrap();
        got.extend(drain(&q));
        assert_eq!(got, vec![1, 2]);
        assert_eq!(q.stats().dropped, 0);
        assert_eq!(q.stats().blocked, 1);
    }

    #[test]
    fn close_releases_blocked_producer() {
        let q = PipelineQueue::new("results", 1, OverflowPolicy::Block).unwrap();
        q.push(1u32).unwrap();
        let closer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            closer.close();
        });
        assert!(matches!(q.push(2), Err(QueueClosed(2))));
        handle.join().unwrap();
    }

    #[test]
    fn closed_queue_drains_before_reporting_closed() {
        let q = PipelineQueue::new("q", 4, OverflowPolicy::Block).unwrap();
        q.push(1u32).unwrap();
        q.push(2).unwrap();
        q.close();
        assert!(q.push(3).is_err());
        assert!(matches!(q.pop_timeout(Duration::from_millis(1)), Pop::Item(1)));
        assert!(matches!(q.pop_timeout(Duration::from_millis(1)), Pop::Item(2)));
        assert!(matches!(q.pop_timeout(Duration::from_millis(1)), Pop::Closed));
    }
}
