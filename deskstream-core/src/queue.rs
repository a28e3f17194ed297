//! Bounded FIFO handing frames between pipeline stages.
//!
//! One producer and one consumer per queue. When the queue is full the
//! *new* item is rejected; the producer counts the drop and moves on, so
//! a slow consumer never stalls capture.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// An item together with the moment it was queued.
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub item: T,
    pub enqueued_at: Instant,
}

impl<T> QueueEntry<T> {
    /// Time spent waiting in the queue so far.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

pub struct BoundedFrameQueue<T> {
    entries: Mutex<VecDeque<QueueEntry<T>>>,
    not_empty: Condvar,
    capacity: usize,
    rejected: AtomicU64,
}

impl<T> BoundedFrameQueue<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
            rejected: AtomicU64::new(0),
        }
    }

    /// Append `item`, or hand it back to be dropped when the queue is full.
    pub fn push(&self, item: T) -> bool {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        entries.push_back(QueueEntry {
            item,
            enqueued_at: Instant::now(),
        });
        drop(entries);
        self.not_empty.notify_one();
        true
    }

    /// Oldest item, waiting up to `timeout`. `Duration::ZERO` never waits.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        self.pop_entry(timeout).map(|entry| entry.item)
    }

    pub fn pop_entry(&self, timeout: Duration) -> Option<QueueEntry<T>> {
        let mut entries = self.lock();
        if timeout.is_zero() {
            return entries.pop_front();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = entries.pop_front() {
                return Some(entry);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // Spurious wakeups loop back around with a shorter wait.
            entries = self
                .not_empty
                .wait_timeout(entries, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes refused because the queue was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    // A panicking holder cannot leave the deque half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for BoundedFrameQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
