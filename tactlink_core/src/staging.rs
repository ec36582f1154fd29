//! Staging ring.
//!
//! Lock-free single-producer single-consumer ring used exclusively to
//! hand events from the radio-callback context (producer, must not
//! block) to the main context (consumer).
//!
//! ## Protocol
//!
//! Each slot carries a `valid` flag. The producer writes the record,
//! then publishes it with a release store of `valid`; the consumer
//! observes the flag with an acquire load before reading the record,
//! then retires the slot with a release store of `!valid`. Head and
//! tail are single-writer positions, so the `valid` flag alone carries
//! the cross-thread ordering. A full slot (still valid) means the ring
//! is full; the producer refuses and the batch is treated as dropped.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use static_assertions::const_assert;
use std::sync::Arc;
use tact::consts::STAGING_CAPACITY;
use tact::event::MotorEvent;

const MASK: usize = STAGING_CAPACITY - 1;
const_assert!(STAGING_CAPACITY.is_power_of_two());

/// One event in flight from the radio callback to the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedEvent {
    /// The ACTIVATE, already translated into the local clock domain.
    pub event: MotorEvent,
    /// Common ON time; the consumer derives the paired DEACTIVATE.
    pub duration_ms: u16,
    /// First event of a macrocycle: consumer clears the motor queue
    /// before forwarding.
    pub batch_start: bool,
    /// Last event of a macrocycle: consumer signals the motor task.
    pub batch_last: bool,
}

struct Slot {
    valid: AtomicBool,
    value: UnsafeCell<MaybeUninit<StagedEvent>>,
}

// SAFETY: slots are accessed under the SPSC protocol — the producer
// writes `value` only while `valid` is false and it owns the head
// position; the consumer reads `value` only after an acquire load of
// `valid == true`.
unsafe impl Sync for Slot {}

struct Ring {
    slots: [Slot; STAGING_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
}

/// Producer half. Owned by the radio-callback context.
pub struct StagingProducer {
    ring: Arc<Ring>,
}

/// Consumer half. Owned by the main context.
pub struct StagingConsumer {
    ring: Arc<Ring>,
}

/// Create a connected producer/consumer pair.
pub fn staging_ring() -> (StagingProducer, StagingConsumer) {
    let ring = Arc::new(Ring {
        slots: core::array::from_fn(|_| Slot {
            valid: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        StagingProducer { ring: ring.clone() },
        StagingConsumer { ring },
    )
}

impl StagingProducer {
    /// Stage one event. Never blocks; a full ring returns the event
    /// back so the caller can count the drop.
    pub fn push(&mut self, staged: StagedEvent) -> Result<(), StagedEvent> {
        let head = self.ring.head.load(Ordering::Relaxed);
        let slot = &self.ring.slots[head & MASK];
        if slot.valid.load(Ordering::Acquire) {
            return Err(staged); // consumer has not retired this slot yet
        }
        // SAFETY: `valid` is false and the producer owns `head`, so no
        // other context touches this slot's value.
        unsafe {
            (*slot.value.get()).write(staged);
        }
        slot.valid.store(true, Ordering::Release);
        self.ring.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }
}

impl StagingConsumer {
    /// Take the oldest staged event, if any.
    pub fn pop(&mut self) -> Option<StagedEvent> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let slot = &self.ring.slots[tail & MASK];
        if !slot.valid.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `valid` was observed true with acquire ordering, so
        // the producer's write to the value happens-before this read,
        // and the producer will not rewrite until `valid` clears.
        let staged = unsafe { (*slot.value.get()).assume_init() };
        slot.valid.store(false, Ordering::Release);
        self.ring.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(staged)
    }
}
