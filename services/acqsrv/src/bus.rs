//! Bounded fan-in buffer for sensor readings
//!
//! All module readers publish into one bounded buffer; a single consumer
//! drains it in receive order. Overflow drops the oldest sample and bumps a
//! counter so slow consumers degrade visibly instead of blocking polls.

use enviro_model::SensorReading;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Multi-producer single-consumer buffer with drop-oldest overflow.
pub struct SampleBus {
    inner: Mutex<VecDeque<SensorReading>>,
    capacity: usize,
    notify: Notify,
    published: AtomicU64,
    dropped_oldest: AtomicU64,
    closed: AtomicBool,
}

impl SampleBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            published: AtomicU64::new(0),
            dropped_oldest: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a reading; never blocks. On a full buffer the oldest sample
    /// is discarded.
    pub fn publish(&self, reading: SensorReading) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(reading);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Receive the next reading, in publish order. Returns `None` once the
    /// bus is closed and drained.
    pub async fn recv(&self) -> Option<SensorReading> {
        loop {
            if let Some(reading) = self.inner.lock().pop_front() {
                return Some(reading);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the bus; pending readings remain receivable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_oldest(&self) -> u64 {
        self.dropped_oldest.load(Ordering::Relaxed)
    }
}
