//! Engine root.
//!
//! Owns the process-wide singletons (clock, queue, staging ring,
//! session machine, metrics) and wires the components together.
//! [`Engine::poll`] drives all main-context work; [`RadioPort`] is
//! the radio-callback entry point and does nothing but timestamp,
//! parse into stack values, stage events, and push mailbox signals —
//! it never blocks and never touches the actuator.
//!
//! Tests construct their own engine; nothing here is a global.

use crate::metrics::LatencyMetrics;
use crate::motor::actuator::Actuator;
use crate::motor::task::{MotorCore, MotorTask, SharedActuator};
use crate::queue::MotorQueue;
use crate::radio::{Radio, SharedRadio};
use crate::session::SessionFsm;
use crate::staging::{staging_ring, StagedEvent, StagingConsumer, StagingProducer};
use crate::supervisor::{LinkView, Supervisor, SupervisorAction};
use crate::sync::{LeadTimeEstimator, SyncEngine, SyncStats};
use crate::therapy::{PatternSource, TherapyAction, TherapyCtx, TherapyEngine};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use tact::clock::{AtomicMicros, Clock};
use tact::config::NodeConfig;
use tact::consts::BASE_TIME_MAX_AHEAD_US;
use tact::event::{Batch, MotorEvent};
use tact::role::Role;
use tact::session::{SessionState, SessionTrigger};
use tact::wire::{decode, encode, Deframer, Frame, FrameBuf};
use tracing::{debug, info, trace, warn};

/// Cross-context link state. Written from the radio-callback context,
/// read from the main context; all 64-bit fields go through the
/// atomic wrappers so nothing tears on 32-bit targets.
pub struct LinkShared {
    last_heard_us: AtomicMicros,
    last_batch_us: AtomicMicros,
    connected: AtomicBool,
    phone_seen: AtomicBool,
    /// Emergency stop requested from a non-main context; honored by
    /// the next `poll`.
    pending_stop: AtomicBool,
    /// Events dropped because the staging ring was full.
    staged_drops: AtomicU32,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            last_heard_us: AtomicMicros::new(0),
            last_batch_us: AtomicMicros::new(0),
            connected: AtomicBool::new(false),
            phone_seen: AtomicBool::new(false),
            pending_stop: AtomicBool::new(false),
            staged_drops: AtomicU32::new(0),
        }
    }
}

/// Control messages handed from the radio callback to the main
/// context (everything that is not a batch event).
#[derive(Debug, Clone, Copy)]
enum ControlMsg {
    Pong { seq: u32, t2: u64, t3: u64, rx_us: u64 },
    PeerReady,
    Ack { seq: u32 },
    SessionCmd { trigger: SessionTrigger },
    StartRequested,
    Seed { value: u32 },
    BatteryRequest,
    BatteryReport { volts: f32 },
}

type Mailbox = Arc<Mutex<heapless::Deque<ControlMsg, 16>>>;

/// Build options.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Spawn the motor thread. Poll-driven tests disable this and
    /// call [`Engine::run_motor_pending`] instead.
    pub spawn_motor: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { spawn_motor: true }
    }
}

pub struct Engine {
    role: Role,
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    fsm: Arc<SessionFsm>,
    queue: Arc<MotorQueue>,
    metrics: Arc<LatencyMetrics>,
    sync: SyncEngine,
    lead: LeadTimeEstimator,
    therapy: TherapyEngine,
    supervisor: Supervisor,
    shared: Arc<LinkShared>,
    mailbox: Mailbox,
    staging_rx: StagingConsumer,
    tx: SharedRadio,
    actuator: SharedActuator,
    motor_task: Option<MotorTask>,
    motor_core: Option<MotorCore>,
    scratch: FrameBuf,
    /// Sequence counter for outgoing session-control frames.
    cmd_seq: u32,
    /// Stub battery voltage reported until a fuel gauge exists.
    battery_volts: f32,
}

impl Engine {
    /// Build an engine and its radio-callback port.
    pub fn new(
        role: Role,
        config: NodeConfig,
        clock: Arc<dyn Clock>,
        radio: Box<dyn Radio>,
        actuator: Box<dyn Actuator>,
        source: Box<dyn PatternSource>,
        options: EngineOptions,
    ) -> (Self, RadioPort) {
        let fsm = Arc::new(SessionFsm::new());
        let queue = Arc::new(MotorQueue::new());
        let metrics = Arc::new(LatencyMetrics::new(config.timing.report_interval_ms));
        let shared = Arc::new(LinkShared::new());
        let mailbox: Mailbox = Arc::new(Mutex::new(heapless::Deque::new()));
        let tx: SharedRadio = Arc::new(Mutex::new(radio));
        let actuator: SharedActuator = Arc::new(Mutex::new(actuator));
        let (staging_tx, staging_rx) = staging_ring();

        // Safety observer: faults stop motors; Stopping drains the
        // queue before anything else may fire.
        let obs_shared = shared.clone();
        let obs_queue = queue.clone();
        fsm.add_observer(Box::new(move |t| match t.to {
            SessionState::CriticalBattery
            | SessionState::Error
            | SessionState::ConnectionLost => {
                obs_shared.pending_stop.store(true, Ordering::Release);
                obs_queue.clear();
            }
            SessionState::Stopping => {
                obs_queue.clear();
            }
            _ => {}
        }))
        .expect("first observer slot");

        let now_ms = clock.now_ms();
        let supervisor = Supervisor::new(
            role,
            config.timing.clone(),
            config.session.clone(),
            now_ms,
        );
        let sync = SyncEngine::new(config.sync.clone());
        let lead = LeadTimeEstimator::new(&config.timing);
        let therapy = TherapyEngine::new(role, source);

        let (motor_task, motor_core) = if options.spawn_motor {
            let task = MotorTask::spawn(
                queue.clone(),
                clock.clone(),
                fsm.clone(),
                metrics.clone(),
                actuator.clone(),
                config.timing.rt_priority,
            );
            (Some(task), None)
        } else {
            let core = MotorCore::new(
                queue.clone(),
                clock.clone(),
                fsm.clone(),
                metrics.clone(),
                actuator.clone(),
            );
            (None, Some(core))
        };

        let port = RadioPort {
            role,
            clock: clock.clone(),
            deframer: Deframer::new(),
            staging_tx,
            shared: shared.clone(),
            mailbox: mailbox.clone(),
            tx: tx.clone(),
            scratch: FrameBuf::new(),
            max_offset_us: config.sync.max_offset_us,
        };

        let engine = Self {
            role,
            config,
            clock,
            fsm,
            queue,
            metrics,
            sync,
            lead,
            therapy,
            supervisor,
            shared,
            mailbox,
            staging_rx,
            tx,
            actuator,
            motor_task,
            motor_core,
            scratch: FrameBuf::new(),
            cmd_seq: 0,
            battery_volts: 3.9,
        };
        (engine, port)
    }

    // ─── Link lifecycle (driven by the transport glue) ──────────────

    /// The radio link came up.
    pub fn note_connected(&mut self) {
        let now = self.clock.now_us();
        self.shared.connected.store(true, Ordering::Release);
        self.shared.last_heard_us.store(now);
        self.shared.last_batch_us.store(now);
        self.sync.on_reconnect(now / 1_000);

        match self.fsm.state() {
            SessionState::ConnectionLost => {
                self.fsm.trigger(SessionTrigger::Reconnected);
            }
            _ => {
                self.fsm.trigger(SessionTrigger::Connected);
            }
        }
        if self.role == Role::Secondary {
            self.send_frame(&Frame::Ready);
        }
        info!(role = %self.role, "link connected");
    }

    /// The radio link dropped.
    pub fn note_disconnected(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        self.sync.on_disconnect();
        self.fsm.trigger(SessionTrigger::Disconnected);
        info!("link disconnected");
    }

    /// A phone attached (disables the auto-start window).
    pub fn note_phone_seen(&mut self) {
        self.shared.phone_seen.store(true, Ordering::Release);
    }

    // ─── Session control (console / phone surface) ──────────────────

    /// Request a session start. Waits for sync validity with a grace
    /// period, then starts degraded.
    pub fn start_session(&mut self) {
        self.supervisor.request_start(self.clock.now_ms());
    }

    pub fn pause_session(&mut self) {
        if self.fsm.trigger(SessionTrigger::PauseSession).committed() {
            self.therapy.pause();
            if self.role.is_primary() {
                self.send_session_cmd(SessionTrigger::PauseSession);
            }
        }
    }

    pub fn resume_session(&mut self) {
        if self.fsm.trigger(SessionTrigger::ResumeSession).committed() {
            self.therapy.resume();
            if self.role.is_primary() {
                self.send_session_cmd(SessionTrigger::ResumeSession);
            }
        }
    }

    pub fn stop_session(&mut self) {
        if self.fsm.trigger(SessionTrigger::StopSession).committed() {
            self.therapy.stop();
            if self.role.is_primary() {
                self.send_session_cmd(SessionTrigger::StopSession);
            }
        }
    }

    // ─── Main-context poll ──────────────────────────────────────────

    /// Drive all deferred work once. Call from the main loop at a few
    /// hundred hertz; everything here is bounded and non-blocking.
    pub fn poll(&mut self) {
        let now_us = self.clock.now_us();
        let now_ms = now_us / 1_000;

        self.forward_staged(now_us);
        self.drain_mailbox(now_ms);
        self.run_supervisor(now_ms);

        // Emergency stop signalled from a non-main context.
        if self.shared.pending_stop.swap(false, Ordering::AcqRel) {
            self.emergency_stop("signalled from callback context");
        }

        self.settle_stopping();
        self.promote_connecting(now_us);
        self.run_therapy(now_us, now_ms);

        if let Some(report) = self.metrics.maybe_report(now_ms) {
            info!("{report}");
        }
    }

    /// Forward staged batch events from the radio callback into the
    /// motor queue.
    fn forward_staged(&mut self, now_us: u64) {
        while let Some(staged) = self.staging_rx.pop() {
            if staged.batch_start {
                // New macrocycle supersedes whatever was pending.
                self.queue.clear();
            }
            if let Err(err) = self
                .queue
                .enqueue(now_us, staged.event, staged.duration_ms)
            {
                warn!(%err, "staged event refused by queue");
            }
            if staged.batch_last {
                self.queue.notify();
            }
        }
    }

    fn drain_mailbox(&mut self, now_ms: u64) {
        loop {
            let msg = self.mailbox.lock().pop_front();
            let Some(msg) = msg else { break };
            match msg {
                ControlMsg::Pong { seq, t2, t3, rx_us } => {
                    if let Some(sample) = self.sync.on_pong(seq, t2, t3, rx_us, now_ms) {
                        self.lead.record_rtt(sample.rtt_us);
                        self.metrics.record_rtt(sample.rtt_us);
                    }
                }
                ControlMsg::PeerReady => {
                    if self.fsm.state() == SessionState::Connecting {
                        self.fsm.trigger(SessionTrigger::Connected);
                    }
                }
                ControlMsg::Ack { seq } => self.therapy.on_ack(seq),
                ControlMsg::SessionCmd { trigger } => {
                    if self.fsm.trigger(trigger).committed() {
                        match trigger {
                            SessionTrigger::PauseSession => self.therapy.pause(),
                            SessionTrigger::ResumeSession => self.therapy.resume(),
                            SessionTrigger::StopSession => self.therapy.stop(),
                            _ => {}
                        }
                    }
                }
                ControlMsg::StartRequested => {
                    if self.role.is_primary() {
                        // Phone-side request: gate on sync validity.
                        self.supervisor.request_start(now_ms);
                    } else {
                        // PRIMARY already gated; obey immediately.
                        self.commence_session(false);
                    }
                }
                ControlMsg::Seed { value } => {
                    debug!(value, "pattern seed received");
                    self.send_frame(&Frame::SeedAck);
                }
                ControlMsg::BatteryRequest => {
                    let volts = self.battery_volts;
                    self.send_frame(&Frame::BatteryResponse { volts });
                }
                ControlMsg::BatteryReport { volts } => {
                    info!(volts, "peer battery");
                }
            }
        }
    }

    fn run_supervisor(&mut self, now_ms: u64) {
        let view = LinkView {
            connected: self.shared.connected.load(Ordering::Acquire),
            phone_seen: self.shared.phone_seen.load(Ordering::Acquire),
            last_heard_ms: self.shared.last_heard_us.load() / 1_000,
            last_batch_ms: self.shared.last_batch_us.load() / 1_000,
            sync_valid: self.sync.is_valid(),
            state: self.fsm.state(),
        };
        let actions = self.supervisor.tick(now_ms, &view);
        for action in actions.iter() {
            match *action {
                SupervisorAction::SendPing { seq } => {
                    // t1 sampled just before the actual send.
                    let t1 = self.clock.now_us();
                    self.sync.begin_ping(seq, t1);
                    self.send_frame(&Frame::Ping { seq, t1 });
                }
                SupervisorAction::SendStopSession => {
                    self.send_session_cmd(SessionTrigger::StopSession);
                }
                SupervisorAction::EmergencyStop { reason } => self.emergency_stop(reason),
                SupervisorAction::Trigger(trigger) => {
                    self.fsm.trigger(trigger);
                }
                SupervisorAction::StartNow { degraded } => self.commence_session(degraded),
            }
        }
    }

    /// Stopping state: the queue is already cleared by the safety
    /// observer; once it reads empty, complete the teardown.
    fn settle_stopping(&mut self) {
        if self.fsm.state() == SessionState::Stopping {
            self.queue.clear();
            if self.queue.is_empty() {
                self.therapy.stop();
                self.fsm.trigger(SessionTrigger::SessionComplete);
            }
        }
    }

    /// Connecting → Ready once the peer demonstrably speaks. The READY
    /// frame short-circuits this; any recent traffic suffices after a
    /// reconnect where READY is not re-sent.
    fn promote_connecting(&mut self, now_us: u64) {
        if self.fsm.state() != SessionState::Connecting {
            return;
        }
        if !self.shared.connected.load(Ordering::Acquire) {
            return;
        }
        let heard = self.shared.last_heard_us.load();
        if heard != 0 && now_us.saturating_sub(heard) < 2_000_000 {
            self.fsm.trigger(SessionTrigger::Connected);
        }
    }

    fn run_therapy(&mut self, now_us: u64, now_ms: u64) {
        if !matches!(
            self.fsm.state(),
            SessionState::Running | SessionState::LowBattery
        ) {
            return;
        }
        let ctx = TherapyCtx {
            now_us,
            offset_us: self.sync.corrected_offset(now_ms),
            lead_time_us: self.lead.lead_time_us(),
        };
        match self.therapy.update(&ctx, &self.queue) {
            Some(TherapyAction::Transmit(batch)) => {
                self.send_frame(&Frame::Macrocycle(batch));
            }
            Some(TherapyAction::Complete) => {
                self.fsm.trigger(SessionTrigger::SessionComplete);
            }
            None => {}
        }
    }

    fn commence_session(&mut self, degraded: bool) {
        if degraded {
            warn!("starting session in degraded mode: sync not valid");
        }
        if self.fsm.trigger(SessionTrigger::StartSession).committed() {
            self.supervisor.clear_pending_start();
            self.therapy.start();
            if self.role.is_primary() {
                self.send_session_cmd(SessionTrigger::StartSession);
            }
        }
    }

    /// Ordered safety path, main context only: stop the sequencer,
    /// drain the queue, silence every channel.
    pub fn emergency_stop(&mut self, reason: &str) {
        warn!(reason, "emergency stop");
        self.therapy.stop();
        self.queue.clear();
        // The motor task is quiescent once the queue is empty; the
        // bounded lock below is the only main-context actuator access.
        if let Err(err) = self.actuator.lock().stop_all() {
            warn!(%err, "actuator stop_all failed");
        }
    }

    fn send_session_cmd(&mut self, trigger: SessionTrigger) {
        self.cmd_seq = self.cmd_seq.wrapping_add(1);
        let seq = self.cmd_seq;
        let ts = self.clock.now_us();
        let frame = match trigger {
            SessionTrigger::StartSession => Frame::StartSession { seq, ts },
            SessionTrigger::PauseSession => Frame::PauseSession { seq, ts },
            SessionTrigger::ResumeSession => Frame::ResumeSession { seq, ts },
            SessionTrigger::StopSession => Frame::StopSession { seq, ts },
            _ => return,
        };
        self.send_frame(&frame);
    }

    fn send_frame(&mut self, frame: &Frame) {
        if let Err(err) = encode(frame, &mut self.scratch) {
            warn!(%err, "frame encode failed");
            return;
        }
        if let Err(err) = self.tx.lock().send(self.scratch.as_bytes()) {
            warn!(%err, "frame send failed");
        }
    }

    // ─── Introspection / console surface ────────────────────────────

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    pub fn fsm(&self) -> Arc<SessionFsm> {
        self.fsm.clone()
    }

    pub fn queue(&self) -> Arc<MotorQueue> {
        self.queue.clone()
    }

    pub fn metrics(&self) -> Arc<LatencyMetrics> {
        self.metrics.clone()
    }

    pub fn sync_status_line(&self) -> String {
        self.sync.status_line()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats(self.clock.now_ms())
    }

    pub fn reset_clock_sync(&mut self) {
        self.sync.reset();
    }

    pub fn staged_drops(&self) -> u32 {
        self.shared.staged_drops.load(Ordering::Relaxed)
    }

    /// Console `TEST`: one short pulse on finger 0, driven directly in
    /// main context (same quiescence rules as the emergency path).
    pub fn test_pulse(&mut self) {
        let mut actuator = self.actuator.lock();
        let _ = actuator.prepare(0, 250);
        let _ = actuator.activate(0, 50, 250);
        let _ = actuator.deactivate(0);
    }

    /// Poll-driven motor execution for rigs without the motor thread.
    pub fn run_motor_pending(&mut self) {
        if let Some(core) = self.motor_core.as_mut() {
            core.run_pending();
        }
    }

    /// Stop the motor thread (no-op for poll-driven rigs).
    pub fn shutdown(&mut self) {
        if let Some(mut task) = self.motor_task.take() {
            task.stop();
        }
    }

}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Radio-callback entry ───────────────────────────────────────────

/// The radio-callback context. The transport calls
/// [`RadioPort::on_bytes`] from its own thread; the port timestamps,
/// deframes, parses, stages batch events into the SPSC ring, answers
/// PINGs and ACKs inline, and defers everything else to the mailbox.
/// It never blocks on the main context and never performs actuator
/// I/O.
pub struct RadioPort {
    role: Role,
    clock: Arc<dyn Clock>,
    deframer: Deframer,
    staging_tx: StagingProducer,
    shared: Arc<LinkShared>,
    mailbox: Mailbox,
    tx: SharedRadio,
    scratch: FrameBuf,
    max_offset_us: i64,
}

impl RadioPort {
    /// Feed raw transport bytes.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        // Earliest possible receive timestamp: before any parsing.
        let rx_us = self.clock.now_us();
        let mut deframer = core::mem::take(&mut self.deframer);
        deframer.feed(bytes, |frame| self.on_frame(frame, rx_us));
        self.deframer = deframer;
    }

    fn on_frame(&mut self, frame: &str, rx_us: u64) {
        // Liveness advances on any message, parsable or not known.
        self.shared.last_heard_us.store(rx_us);

        let parsed = match decode(frame) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                trace!(frame, "unknown command dropped");
                return;
            }
            Err(err) => {
                debug!(%err, "malformed frame dropped");
                return;
            }
        };

        match parsed {
            Frame::Ping { seq, t1: _ } => {
                // t2 at receive, t3 just before the reply leaves.
                let t2 = rx_us;
                let t3 = self.clock.now_us();
                self.reply(&Frame::Pong { seq, t2, t3 });
            }
            Frame::Pong { seq, t2, t3 } => {
                self.post(ControlMsg::Pong { seq, t2, t3, rx_us });
            }
            Frame::Macrocycle(batch) => self.on_batch(batch, rx_us),
            Frame::McAck { seq } => self.post(ControlMsg::Ack { seq }),
            Frame::Ready => self.post(ControlMsg::PeerReady),
            Frame::StartSession { .. } => self.post(ControlMsg::StartRequested),
            Frame::PauseSession { .. } => self.post(ControlMsg::SessionCmd {
                trigger: SessionTrigger::PauseSession,
            }),
            Frame::ResumeSession { .. } => self.post(ControlMsg::SessionCmd {
                trigger: SessionTrigger::ResumeSession,
            }),
            Frame::StopSession { .. } => self.post(ControlMsg::SessionCmd {
                trigger: SessionTrigger::StopSession,
            }),
            Frame::Seed { value } => self.post(ControlMsg::Seed { value }),
            Frame::SeedAck => {}
            Frame::GetBattery => self.post(ControlMsg::BatteryRequest),
            Frame::BatteryResponse { volts } => self.post(ControlMsg::BatteryReport { volts }),
            Frame::ParamUpdate { ref raw } => {
                debug!(%raw, "parameter update received");
            }
        }
    }

    /// Validate a macrocycle and stage its events. The offset is
    /// applied here: `local = primary + offset`. An ACK goes out even
    /// for rejected batches so the peer does not enter a retry storm.
    fn on_batch(&mut self, batch: Batch, rx_us: u64) {
        if self.role.is_primary() {
            debug!("macrocycle on PRIMARY dropped");
            return;
        }
        self.shared.last_batch_us.store(rx_us);
        self.reply(&Frame::McAck {
            seq: batch.sequence_id,
        });

        if batch.clock_offset_us.abs() > self.max_offset_us {
            warn!(
                offset_us = batch.clock_offset_us,
                "batch rejected: offset out of range"
            );
            return;
        }
        if let Err(fault) = batch.validate() {
            warn!(?fault, seq = batch.sequence_id, "batch rejected: structure");
            return;
        }
        let local_base_us = batch.base_time_us.saturating_add_signed(batch.clock_offset_us);
        let now_us = self.clock.now_us();
        if local_base_us > now_us + BASE_TIME_MAX_AHEAD_US {
            warn!(local_base_us, now_us, "batch rejected: anchor too far ahead");
            return;
        }

        let last = batch.events.len().saturating_sub(1);
        for (i, spec) in batch.events.iter().enumerate() {
            let event = MotorEvent::activate(
                Batch::activate_time_us(local_base_us, spec),
                spec.finger,
                spec.amplitude,
                spec.freq_hz(),
            );
            let staged = StagedEvent {
                event,
                duration_ms: batch.duration_ms,
                batch_start: i == 0,
                batch_last: i == last,
            };
            if self.staging_tx.push(staged).is_err() {
                self.shared.staged_drops.fetch_add(1, Ordering::Relaxed);
                warn!(seq = batch.sequence_id, "staging ring full, event dropped");
            }
        }
        trace!(
            seq = batch.sequence_id,
            events = batch.events.len(),
            local_base_us,
            "batch staged"
        );
    }

    fn post(&self, msg: ControlMsg) {
        if self.mailbox.lock().push_back(msg).is_err() {
            warn!("control mailbox full, message dropped");
        }
    }

    fn reply(&mut self, frame: &Frame) {
        if encode(frame, &mut self.scratch).is_ok() {
            if let Err(err) = self.tx.lock().send(self.scratch.as_bytes()) {
                debug!(%err, "callback reply failed");
            }
        }
    }
}
