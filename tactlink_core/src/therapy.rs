//! Therapy engine.
//!
//! Turns a supplied pattern source into timed macrocycle batches. On
//! PRIMARY each batch is enqueued locally and handed back for
//! transmission to SECONDARY; on SECONDARY the engine is silent
//! during a session (batches arrive over the radio instead). The
//! engine is a non-blocking state machine driven by periodic
//! `update()` calls; transitions happen on ticks and on motor-queue
//! emptiness.

use crate::queue::MotorQueue;
use tact::consts::BATCH_EVENT_MAX;
use tact::event::{Batch, EventSpec, MotorEvent};
use tact::role::Role;
use tracing::{debug, info, warn};

/// One pattern tuple as yielded by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternTuple {
    /// Offset from the batch anchor [ms].
    pub delta_ms: u16,
    pub finger: u8,
    pub amplitude: u8,
    pub freq_hz: u16,
}

/// One macrocycle worth of pattern tuples with a common ON time.
#[derive(Debug, Clone)]
pub struct PatternBatch {
    pub duration_ms: u16,
    pub events: heapless::Vec<PatternTuple, BATCH_EVENT_MAX>,
}

/// External pattern generator. The engine consumes tuples; it does
/// not decide which pattern to play.
pub trait PatternSource: Send {
    /// Next macrocycle of tuples. `None` completes the session.
    fn next_batch(&mut self) -> Option<PatternBatch>;
}

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TherapyPhase {
    Idle,
    Running,
    /// Events gathered and enqueued, frame not yet handed off.
    BatchPending,
    /// Frame handed off; awaiting queue drain (ACK is keepalive-only).
    BatchTransmitted,
    Paused,
    Stopping,
}

/// What the caller must do after an `update()`.
#[derive(Debug, Clone, PartialEq)]
pub enum TherapyAction {
    /// Serialize and send this batch to SECONDARY.
    Transmit(Batch),
    /// Pattern source exhausted; fire session completion.
    Complete,
}

/// Scheduling inputs read once per batch.
#[derive(Debug, Clone, Copy)]
pub struct TherapyCtx {
    pub now_us: u64,
    /// Current corrected offset (`t_secondary − t_primary`).
    pub offset_us: i64,
    pub lead_time_us: u64,
}

pub struct TherapyEngine {
    role: Role,
    phase: TherapyPhase,
    source: Box<dyn PatternSource>,
    next_seq: u32,
    /// Last transmitted batch awaiting acknowledgement.
    outstanding_ack: Option<u32>,
    batches_sent: u32,
    batches_acked: u32,
}

impl TherapyEngine {
    pub fn new(role: Role, source: Box<dyn PatternSource>) -> Self {
        Self {
            role,
            phase: TherapyPhase::Idle,
            source,
            next_seq: 1,
            outstanding_ack: None,
            batches_sent: 0,
            batches_acked: 0,
        }
    }

    #[inline]
    pub const fn phase(&self) -> TherapyPhase {
        self.phase
    }

    pub fn start(&mut self) {
        if self.phase == TherapyPhase::Idle || self.phase == TherapyPhase::Stopping {
            info!(role = %self.role, "therapy started");
            self.phase = TherapyPhase::Running;
        }
    }

    pub fn pause(&mut self) {
        if self.is_active() {
            self.phase = TherapyPhase::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.phase == TherapyPhase::Paused {
            self.phase = TherapyPhase::Running;
        }
    }

    pub fn stop(&mut self) {
        if self.phase != TherapyPhase::Idle {
            info!("therapy stopped");
        }
        self.phase = TherapyPhase::Idle;
        self.outstanding_ack = None;
    }

    fn is_active(&self) -> bool {
        matches!(
            self.phase,
            TherapyPhase::Running | TherapyPhase::BatchPending | TherapyPhase::BatchTransmitted
        )
    }

    /// Record a batch acknowledgement (keepalive bookkeeping only; the
    /// batch loop is paced by queue emptiness, not by ACKs).
    pub fn on_ack(&mut self, seq: u32) {
        if self.outstanding_ack == Some(seq) {
            self.outstanding_ack = None;
            self.batches_acked += 1;
            debug!(seq, "batch acknowledged");
        }
    }

    /// Drive the batch loop. Returns the action the caller must
    /// perform, if any. Never blocks.
    pub fn update(&mut self, ctx: &TherapyCtx, queue: &MotorQueue) -> Option<TherapyAction> {
        if !self.role.is_primary() {
            // SECONDARY is silent in-session; batches arrive by radio.
            return None;
        }
        match self.phase {
            TherapyPhase::Running | TherapyPhase::BatchTransmitted => {
                if !queue.is_empty() {
                    return None;
                }
                self.compose_batch(ctx, queue)
            }
            _ => None,
        }
    }

    /// Gather up to twelve tuples, anchor them, enqueue locally, and
    /// hand the batch back for transmission.
    fn compose_batch(&mut self, ctx: &TherapyCtx, queue: &MotorQueue) -> Option<TherapyAction> {
        let Some(pattern) = self.source.next_batch() else {
            info!(
                sent = self.batches_sent,
                acked = self.batches_acked,
                "pattern source exhausted"
            );
            self.phase = TherapyPhase::Stopping;
            return Some(TherapyAction::Complete);
        };
        if pattern.events.is_empty() {
            return None;
        }

        self.phase = TherapyPhase::BatchPending;
        let base_time_us = ctx.now_us + ctx.lead_time_us;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut batch = Batch::new(seq, base_time_us, ctx.offset_us, pattern.duration_ms);
        for tuple in pattern.events.iter() {
            let activate_time = base_time_us + tuple.delta_ms as u64 * 1_000;
            let event =
                MotorEvent::activate(activate_time, tuple.finger, tuple.amplitude, tuple.freq_hz);
            if let Err(err) = queue.enqueue(ctx.now_us, event, pattern.duration_ms) {
                // Treated as a dropped batch: the next cycle retries
                // once the queue drains.
                warn!(%err, seq, "local enqueue failed, batch dropped");
                queue.clear();
                self.phase = TherapyPhase::Running;
                return None;
            }
            let _ = batch.events.push(EventSpec::from_freq(
                tuple.delta_ms,
                tuple.finger,
                tuple.amplitude,
                tuple.freq_hz,
            ));
        }

        self.phase = TherapyPhase::BatchTransmitted;
        self.outstanding_ack = Some(seq);
        self.batches_sent += 1;
        debug!(seq, base_time_us, events = batch.events.len(), "batch composed");
        Some(TherapyAction::Transmit(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `batches` rounds of 12 events (3 pulses × 4 fingers).
    struct FixedSource {
        remaining: u32,
    }

    impl PatternSource for FixedSource {
        fn next_batch(&mut self) -> Option<PatternBatch> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let mut events = heapless::Vec::new();
            for i in 0..12u16 {
                events
                    .push(PatternTuple {
                        delta_ms: i * 167,
                        finger: (i % 4) as u8,
                        amplitude: 100,
                        freq_hz: 250,
                    })
                    .unwrap();
            }
            Some(PatternBatch {
                duration_ms: 100,
                events,
            })
        }
    }

    fn ctx() -> TherapyCtx {
        TherapyCtx {
            now_us: 1_000_000,
            offset_us: 45_000,
            lead_time_us: 80_000,
        }
    }

    #[test]
    fn primary_composes_anchored_batches() {
        let queue = MotorQueue::new();
        let mut engine = TherapyEngine::new(Role::Primary, Box::new(FixedSource { remaining: 2 }));
        engine.start();

        let action = engine.update(&ctx(), &queue).expect("first batch");
        let TherapyAction::Transmit(batch) = action else {
            panic!("expected transmit");
        };
        assert_eq!(batch.sequence_id, 1);
        assert_eq!(batch.base_time_us, 1_080_000);
        assert_eq!(batch.clock_offset_us, 45_000);
        assert_eq!(batch.events.len(), 12);
        assert_eq!(engine.phase(), TherapyPhase::BatchTransmitted);

        // 12 activate/deactivate pairs landed locally.
        assert_eq!(queue.len(), 24);
        let first = queue.peek_next().unwrap();
        assert_eq!(first.time_us, 1_080_000);
    }

    #[test]
    fn next_batch_waits_for_queue_drain() {
        let queue = MotorQueue::new();
        let mut engine = TherapyEngine::new(Role::Primary, Box::new(FixedSource { remaining: 3 }));
        engine.start();

        assert!(engine.update(&ctx(), &queue).is_some());
        // Queue still holds the first batch: no new batch yet.
        assert!(engine.update(&ctx(), &queue).is_none());

        queue.clear();
        let action = engine.update(&ctx(), &queue).expect("second batch after drain");
        let TherapyAction::Transmit(batch) = action else {
            panic!("expected transmit");
        };
        assert_eq!(batch.sequence_id, 2);
    }

    #[test]
    fn exhausted_source_completes_session() {
        let queue = MotorQueue::new();
        let mut engine = TherapyEngine::new(Role::Primary, Box::new(FixedSource { remaining: 1 }));
        engine.start();

        assert!(engine.update(&ctx(), &queue).is_some());
        queue.clear();
        assert_eq!(engine.update(&ctx(), &queue), Some(TherapyAction::Complete));
        assert_eq!(engine.phase(), TherapyPhase::Stopping);
    }

    #[test]
    fn secondary_is_silent() {
        let queue = MotorQueue::new();
        let mut engine =
            TherapyEngine::new(Role::Secondary, Box::new(FixedSource { remaining: 5 }));
        engine.start();
        assert!(engine.update(&ctx(), &queue).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn paused_engine_stops_composing() {
        let queue = MotorQueue::new();
        let mut engine = TherapyEngine::new(Role::Primary, Box::new(FixedSource { remaining: 5 }));
        engine.start();
        engine.pause();
        assert!(engine.update(&ctx(), &queue).is_none());
        engine.resume();
        assert!(engine.update(&ctx(), &queue).is_some());
    }

    #[test]
    fn ack_bookkeeping_matches_sequence() {
        let queue = MotorQueue::new();
        let mut engine = TherapyEngine::new(Role::Primary, Box::new(FixedSource { remaining: 1 }));
        engine.start();
        engine.update(&ctx(), &queue);
        assert_eq!(engine.outstanding_ack, Some(1));
        engine.on_ack(7); // unknown sequence ignored
        assert_eq!(engine.outstanding_ack, Some(1));
        engine.on_ack(1);
        assert_eq!(engine.outstanding_ack, None);
        assert_eq!(engine.batches_acked, 1);
    }
}
