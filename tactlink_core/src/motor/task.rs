//! Motor execution task.
//!
//! Highest-priority consumer of the motor queue. The loop peeks the
//! earliest event and picks a strategy by remaining delay: execute
//! immediately when due, coarse-sleep (waking early on notify) when
//! far out, and spin-wait with cooperative yields inside the final
//! window. Between dequeue and actuator I/O the session state is
//! re-checked, so a stop observed by the state machine occurs-before
//! the next activation.
//!
//! After a DEACTIVATE completes, the slow half of actuator setup for
//! a following ACTIVATE (channel select, frequency program) runs
//! immediately, leaving only the amplitude write for the scheduled
//! instant.

use crate::metrics::LatencyMetrics;
use crate::motor::actuator::Actuator;
use crate::queue::MotorQueue;
use crate::session::SessionFsm;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tact::clock::Clock;
use tact::consts::{COARSE_SLEEP_MARGIN_US, SPIN_THRESHOLD_US};
use tact::event::{EventKind, MotorEvent};
use tracing::{debug, trace, warn};

/// The actuator is owned by the motor task in steady state; the main
/// context takes this lock only on the emergency-stop path, when the
/// task is quiescent.
pub type SharedActuator = Arc<Mutex<Box<dyn Actuator>>>;

/// Execution core shared by the threaded loop and by poll-driven
/// tests.
pub struct MotorCore {
    queue: Arc<MotorQueue>,
    clock: Arc<dyn Clock>,
    fsm: Arc<SessionFsm>,
    metrics: Arc<LatencyMetrics>,
    actuator: SharedActuator,
    /// Finger/frequency already programmed by pre-selection.
    prepared: Option<(u8, u16)>,
}

impl MotorCore {
    pub fn new(
        queue: Arc<MotorQueue>,
        clock: Arc<dyn Clock>,
        fsm: Arc<SessionFsm>,
        metrics: Arc<LatencyMetrics>,
        actuator: SharedActuator,
    ) -> Self {
        Self {
            queue,
            clock,
            fsm,
            metrics,
            actuator,
            prepared: None,
        }
    }

    /// Execute every event that is already due. Non-blocking; the
    /// poll-driven equivalent of the task loop for tests and
    /// single-threaded rigs.
    pub fn run_pending(&mut self) {
        loop {
            let now = self.clock.now_us();
            match self.queue.peek_next() {
                Some(e) if e.time_us <= now => {
                    if let Some(e) = self.queue.dequeue_if_next(&e) {
                        self.execute(e);
                    }
                }
                _ => return,
            }
        }
    }

    /// Drive one event to the actuator and sample drift afterwards.
    fn execute(&mut self, e: MotorEvent) {
        // Re-check after dequeue, before I/O: no event executes
        // outside RUNNING.
        if !self.fsm.state().allows_execution() {
            trace!(?e, "event skipped, session not running");
            self.prepared = None;
            return;
        }

        let result = {
            let mut actuator = self.actuator.lock();
            match e.kind {
                EventKind::Activate => {
                    let pre = self.prepared.take();
                    if pre != Some((e.finger, e.freq_hz)) {
                        // No pre-selection hit: pay the slow path now.
                        if let Err(err) = actuator.prepare(e.finger, e.freq_hz) {
                            warn!(%err, "actuator prepare failed");
                        }
                    }
                    actuator.activate(e.finger, e.amplitude, e.freq_hz)
                }
                EventKind::Deactivate => actuator.deactivate(e.finger),
            }
        };

        // Drift sampled after the I/O — the bus transfer is the long pole.
        let drift = self.clock.now_us() as i64 - e.time_us as i64;
        self.metrics.record_execution(drift);

        if let Err(err) = result {
            // Hardware errors are logged, not propagated to session
            // state unless the supervisor sees them repeat everywhere.
            warn!(%err, finger = e.finger, "actuator write failed");
        }

        // Pre-selection: after a release, program the next activation's
        // slow half immediately.
        if e.kind == EventKind::Deactivate {
            if let Some(next) = self.queue.peek_next() {
                if next.kind == EventKind::Activate {
                    let mut actuator = self.actuator.lock();
                    if actuator.prepare(next.finger, next.freq_hz).is_ok() {
                        self.prepared = Some((next.finger, next.freq_hz));
                    }
                }
            }
        }
    }

    /// One pass of the task loop: peek, pick a strategy, possibly
    /// block. Returns when the caller should re-check shutdown.
    fn step(&mut self) {
        let Some(e) = self.queue.peek_next() else {
            self.queue.wait_nonempty(Duration::from_millis(50));
            return;
        };

        let delay = e.time_us as i64 - self.clock.now_us() as i64;
        if delay <= 0 {
            if let Some(e) = self.queue.dequeue_next() {
                self.execute(e);
            }
            return;
        }

        if delay > SPIN_THRESHOLD_US {
            // Coarse sleep, waking early on notify, then re-peek.
            let sleep_us = (delay - COARSE_SLEEP_MARGIN_US) as u64;
            self.queue.wait_notify(Duration::from_micros(sleep_us));
            return;
        }

        // Inside the spin window an earlier event may have arrived.
        match self.queue.peek_next() {
            Some(current) if current == e => {}
            _ => return,
        }
        while self.clock.now_us() < e.time_us {
            core::hint::spin_loop();
            std::thread::yield_now();
        }
        if let Some(e) = self.queue.dequeue_if_next(&e) {
            self.execute(e);
        }
    }
}

/// Handle to the spawned motor thread.
pub struct MotorTask {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    queue: Arc<MotorQueue>,
}

impl MotorTask {
    /// Spawn the motor thread. `rt_priority` applies SCHED_FIFO in
    /// `rt` builds and is recorded-but-inert otherwise.
    pub fn spawn(
        queue: Arc<MotorQueue>,
        clock: Arc<dyn Clock>,
        fsm: Arc<SessionFsm>,
        metrics: Arc<LatencyMetrics>,
        actuator: SharedActuator,
        rt_priority: i32,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let loop_queue = queue.clone();
        let handle = std::thread::Builder::new()
            .name("motor".to_string())
            .spawn(move || {
                apply_rt_priority(rt_priority);
                let mut core = MotorCore::new(loop_queue, clock, fsm, metrics, actuator);
                while !stop.load(Ordering::Acquire) {
                    core.step();
                }
                debug!("motor task stopped");
            })
            .expect("spawn motor thread");
        Self {
            handle: Some(handle),
            shutdown,
            queue,
        }
    }

    /// Stop the thread and join it.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MotorTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// SCHED_FIFO for the calling thread.
#[cfg(feature = "rt")]
fn apply_rt_priority(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(priority, %err, "sched_setscheduler(SCHED_FIFO) failed, running best-effort");
    }
}

#[cfg(not(feature = "rt"))]
fn apply_rt_priority(_priority: i32) {
    // Simulation mode: scheduling left to the host.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::actuator::{ActuatorOp, SimActuator};
    use tact::clock::{ManualClock, MonotonicClock, UptimeTicks};
    use tact::session::{SessionState, SessionTrigger};

    fn rig(clock: Arc<dyn Clock>) -> (MotorCore, Arc<MotorQueue>, Arc<Mutex<Vec<ActuatorOp>>>, Arc<SessionFsm>) {
        let queue = Arc::new(MotorQueue::new());
        let fsm = Arc::new(SessionFsm::new());
        fsm.force_state(SessionState::Running, SessionTrigger::StartSession);
        let metrics = Arc::new(LatencyMetrics::new(30_000));
        metrics.set_mode(crate::metrics::MetricsMode::On);
        let sim = SimActuator::with_clock(clock.clone());
        let log = sim.log();
        let actuator: SharedActuator = Arc::new(Mutex::new(Box::new(sim)));
        let core = MotorCore::new(queue.clone(), clock, fsm.clone(), metrics, actuator);
        (core, queue, log, fsm)
    }

    #[test]
    fn due_events_execute_in_time_order() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut core, queue, log, _fsm) = rig(clock.clone());

        queue.enqueue(0, MotorEvent::activate(2_000, 1, 80, 250), 5).unwrap();
        queue.enqueue(0, MotorEvent::activate(1_000, 0, 80, 250), 5).unwrap();

        clock.set_us(10_000);
        core.run_pending();

        let ops = log.lock();
        let activations: Vec<u8> = ops
            .iter()
            .filter_map(|op| match op {
                ActuatorOp::Activate { finger, .. } => Some(*finger),
                _ => None,
            })
            .collect();
        assert_eq!(activations, vec![0, 1]);
    }

    #[test]
    fn nothing_executes_outside_running() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut core, queue, log, fsm) = rig(clock.clone());
        queue.enqueue(0, MotorEvent::activate(1_000, 0, 80, 250), 5).unwrap();

        fsm.force_state(SessionState::Stopping, SessionTrigger::StopSession);
        clock.set_us(10_000);
        core.run_pending();

        assert!(log.lock().is_empty(), "no I/O outside RUNNING");
        assert!(queue.is_empty(), "events are consumed, just not executed");
    }

    #[test]
    fn preselection_prepares_next_activation() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut core, queue, log, _fsm) = rig(clock.clone());

        // First pair finishes before the second begins.
        queue.enqueue(0, MotorEvent::activate(1_000, 0, 80, 250), 1).unwrap();
        queue.enqueue(0, MotorEvent::activate(10_000, 1, 90, 305), 1).unwrap();

        // Run past the first pair only.
        clock.set_us(3_000);
        core.run_pending();

        let ops = log.lock().clone();
        // prepare(0) + activate(0) + deactivate(0) + prepare(1) from pre-selection.
        assert!(matches!(ops.last(), Some(ActuatorOp::Prepare { finger: 1, freq_hz: 305, .. })),
            "pre-selection must program the next activation, got {ops:?}");

        // The activation itself then skips the slow path.
        clock.set_us(20_000);
        core.run_pending();
        let ops = log.lock();
        let prepares_for_1 = ops
            .iter()
            .filter(|op| matches!(op, ActuatorOp::Prepare { finger: 1, .. }))
            .count();
        assert_eq!(prepares_for_1, 1, "activate must reuse the pre-selected setup");
    }

    #[test]
    fn threaded_task_executes_near_schedule() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new(UptimeTicks::new()));
        let queue = Arc::new(MotorQueue::new());
        let fsm = Arc::new(SessionFsm::new());
        fsm.force_state(SessionState::Running, SessionTrigger::StartSession);
        let metrics = Arc::new(LatencyMetrics::new(30_000));
        let sim = SimActuator::with_clock(clock.clone());
        let log = sim.log();
        let actuator: SharedActuator = Arc::new(Mutex::new(Box::new(sim)));

        let mut task = MotorTask::spawn(
            queue.clone(),
            clock.clone(),
            fsm,
            metrics,
            actuator,
            80,
        );

        let target = clock.now_us() + 20_000;
        queue.enqueue(clock.now_us(), MotorEvent::activate(target, 2, 70, 250), 5)
            .unwrap();

        // Wait out the schedule plus slack.
        std::thread::sleep(Duration::from_millis(120));
        task.stop();

        let ops = log.lock();
        let activate = ops
            .iter()
            .find_map(|op| match op {
                ActuatorOp::Activate { finger: 2, at_us, .. } => Some(*at_us),
                _ => None,
            })
            .expect("activation executed");
        assert!(activate >= target, "fired early: {activate} < {target}");
        // Host scheduling jitter allowed, but the coarse+spin strategy
        // should stay well inside 10 ms.
        assert!(activate - target < 10_000, "fired late by {} µs", activate - target);
    }
}
