//! Motor event queue.
//!
//! Fixed-capacity, time-ordered, mutex-protected queue with two
//! producers (main context, radio staging forward) and one consumer
//! (motor task). An enqueue atomically reserves two slots — the
//! ACTIVATE and its paired DEACTIVATE — and rolls back by slot index
//! if the second reservation fails. Peek and dequeue are atomic with
//! respect to each other: both take the same lock, and
//! [`MotorQueue::dequeue_if_next`] lets a caller that peeked and
//! waited remove exactly the event it saw.
//!
//! Wakeups latch: a notification posted while the consumer is not
//! waiting is consumed by its next wait, like a counting task
//! notification, so an enqueue can never slip between peek and sleep
//! unseen.

use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use tact::consts::{QUEUE_CAPACITY, QUEUE_STALE_TOLERANCE_US};
use tact::event::{EventKind, MotorEvent};
use thiserror::Error;
use tracing::warn;

/// Enqueue failures. Capacity exhaustion is reported, never silently
/// dropped; callers treat it as a dropped batch and let the next
/// keepalive or batch re-synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full ({capacity} slots)")]
    Full { capacity: usize },

    #[error("enqueue takes the ACTIVATE of a pair")]
    NotActivate,

    #[error("event at {scheduled_us} µs is stale at {now_us} µs")]
    Stale { scheduled_us: u64, now_us: u64 },
}

struct Inner {
    slots: heapless::Vec<MotorEvent, QUEUE_CAPACITY>,
    /// Latched consumer wakeup.
    pending_notify: bool,
}

pub struct MotorQueue {
    inner: Mutex<Inner>,
    wakeup: Condvar,
}

impl MotorQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: heapless::Vec::new(),
                pending_notify: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Enqueue an ACTIVATE and its paired DEACTIVATE at
    /// `time_us + duration_ms`. The pair is inserted atomically; on a
    /// failed second reservation the first slot is rolled back by
    /// index.
    pub fn enqueue(
        &self,
        now_us: u64,
        activate: MotorEvent,
        duration_ms: u16,
    ) -> Result<(), QueueError> {
        if activate.kind != EventKind::Activate {
            return Err(QueueError::NotActivate);
        }
        if activate.time_us + QUEUE_STALE_TOLERANCE_US < now_us {
            return Err(QueueError::Stale {
                scheduled_us: activate.time_us,
                now_us,
            });
        }
        let deactivate =
            MotorEvent::deactivate(activate.time_us + duration_ms as u64 * 1_000, activate.finger);

        let mut inner = self.inner.lock();
        let mark = inner.slots.len();
        if inner.slots.push(activate).is_err() {
            warn!(capacity = QUEUE_CAPACITY, "motor queue full, pair refused");
            return Err(QueueError::Full {
                capacity: QUEUE_CAPACITY,
            });
        }
        if inner.slots.push(deactivate).is_err() {
            inner.slots.truncate(mark);
            warn!(capacity = QUEUE_CAPACITY, "motor queue full, pair rolled back");
            return Err(QueueError::Full {
                capacity: QUEUE_CAPACITY,
            });
        }
        inner.pending_notify = true;
        drop(inner);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Earliest event by `time_us`, ties broken by insertion order.
    pub fn peek_next(&self) -> Option<MotorEvent> {
        let inner = self.inner.lock();
        earliest_index(&inner.slots).map(|i| inner.slots[i])
    }

    /// Atomic peek + remove of the earliest event.
    pub fn dequeue_next(&self) -> Option<MotorEvent> {
        let mut inner = self.inner.lock();
        earliest_index(&inner.slots).map(|i| inner.slots.remove(i))
    }

    /// Remove the earliest event only if it is still `expected`.
    ///
    /// Returns `None` when a newer, earlier event displaced it — the
    /// caller re-peeks and re-plans.
    pub fn dequeue_if_next(&self, expected: &MotorEvent) -> Option<MotorEvent> {
        let mut inner = self.inner.lock();
        let i = earliest_index(&inner.slots)?;
        if inner.slots[i] != *expected {
            return None;
        }
        Some(inner.slots.remove(i))
    }

    /// Scheduled time of the earliest event.
    pub fn next_event_time(&self) -> Option<u64> {
        self.peek_next().map(|e| e.time_us)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    /// Approximate when read outside the consumer; used for logging.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Drop all queued events. Idempotent; wakes the consumer so it
    /// re-peeks an empty queue.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.pending_notify = true;
        drop(inner);
        self.wakeup.notify_all();
    }

    /// Wake the consumer without changing queue contents.
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.pending_notify = true;
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Block until the queue is non-empty or `timeout` elapses.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        inner.pending_notify = false;
        if !inner.slots.is_empty() {
            return true;
        }
        self.wakeup.wait_for(&mut inner, timeout);
        inner.pending_notify = false;
        !inner.slots.is_empty()
    }

    /// Coarse sleep that ends early on a latched or live notification.
    pub fn wait_notify(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.pending_notify {
            inner.pending_notify = false;
            return;
        }
        self.wakeup.wait_for(&mut inner, timeout);
        inner.pending_notify = false;
    }
}

impl Default for MotorQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn earliest_index(slots: &[MotorEvent]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, e) in slots.iter().enumerate() {
        match best {
            // Strict less-than keeps the first-inserted among ties.
            Some(b) if e.time_us >= slots[b].time_us => {}
            _ => best = Some(i),
        }
    }
    best
}
