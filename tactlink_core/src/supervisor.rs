//! Keepalive and session supervisor.
//!
//! On PRIMARY a 1 Hz tick emits keepalive probes while connected; on
//! both sides liveness timeouts gate the session. "Last heard"
//! advances on any message, not only on matching ACK/PONG. From the
//! radio-callback context the supervisor only receives updated
//! timestamps; every action here is computed and performed in the
//! main context.
//!
//! Timeouts (monotonic clock):
//!
//! | Condition | Threshold | Action |
//! |-----------|-----------|--------|
//! | SECONDARY hears nothing | 6 s | ConnectionLost + emergency stop |
//! | PRIMARY hears nothing in session | 6 s | STOP_SESSION out + emergency stop |
//! | No batch while RUNNING (SECONDARY) | 10 s | safety halt |
//! | Boot window, no phone (SECONDARY) | 30 s | auto-start when sync valid, 1 s retries up to 10 s, then degraded |

use tact::config::{SessionConfig, TimingConfig};
use tact::role::Role;
use tact::session::{SessionState, SessionTrigger};
use tracing::{debug, info, warn};

/// Instantaneous link/session view fed to [`Supervisor::tick`].
#[derive(Debug, Clone, Copy)]
pub struct LinkView {
    pub connected: bool,
    /// A phone has been seen since boot (disables auto-start).
    pub phone_seen: bool,
    pub last_heard_ms: u64,
    pub last_batch_ms: u64,
    pub sync_valid: bool,
    pub state: SessionState,
}

/// Work the engine must perform after a tick, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Emit a keepalive probe; the engine samples `t1` just before
    /// the actual send.
    SendPing { seq: u32 },
    /// Tell SECONDARY to stop (link failing while in session).
    SendStopSession,
    /// Run the ordered emergency-stop procedure in main context.
    EmergencyStop { reason: &'static str },
    /// Fire a session trigger.
    Trigger(SessionTrigger),
    /// Commence the session (auto-start or deferred start).
    StartNow { degraded: bool },
}

pub type Actions = heapless::Vec<SupervisorAction, 6>;

pub struct Supervisor {
    role: Role,
    timing: TimingConfig,
    session_cfg: SessionConfig,
    boot_ms: u64,
    last_ping_ms: u64,
    next_ping_seq: u32,
    /// Keepalive timeout already handled (re-arms when heard again).
    keepalive_tripped: bool,
    /// Batch timeout already handled.
    batch_tripped: bool,
    /// Deferred session start awaiting sync validity: request time.
    pending_start_ms: Option<u64>,
    /// Auto-start attempt bookkeeping: first attempt time.
    auto_start_began_ms: Option<u64>,
    last_auto_attempt_ms: u64,
    auto_start_done: bool,
}

impl Supervisor {
    pub fn new(role: Role, timing: TimingConfig, session_cfg: SessionConfig, boot_ms: u64) -> Self {
        Self {
            role,
            timing,
            session_cfg,
            boot_ms,
            last_ping_ms: 0,
            next_ping_seq: 0,
            keepalive_tripped: false,
            batch_tripped: false,
            pending_start_ms: None,
            auto_start_began_ms: None,
            last_auto_attempt_ms: 0,
            auto_start_done: false,
        }
    }

    /// A session start was requested while sync may not be valid;
    /// grant it from `tick` once sync confirms or the grace expires.
    pub fn request_start(&mut self, now_ms: u64) {
        if self.pending_start_ms.is_none() {
            self.pending_start_ms = Some(now_ms);
        }
    }

    /// The session started (or died); drop pending-start state.
    pub fn clear_pending_start(&mut self) {
        self.pending_start_ms = None;
    }

    /// Periodic supervision. Cheap; call once per main-loop poll.
    pub fn tick(&mut self, now_ms: u64, view: &LinkView) -> Actions {
        let mut actions = Actions::new();

        if view.connected {
            self.tick_keepalive(now_ms, view, &mut actions);
        }
        self.tick_liveness(now_ms, view, &mut actions);
        self.tick_pending_start(now_ms, view, &mut actions);
        if self.role == Role::Primary {
            self.tick_auto_start(now_ms, view, &mut actions);
        }
        actions
    }

    fn tick_keepalive(&mut self, now_ms: u64, _view: &LinkView, actions: &mut Actions) {
        if self.role != Role::Primary {
            return;
        }
        if now_ms.saturating_sub(self.last_ping_ms) >= self.timing.keepalive_interval_ms {
            self.last_ping_ms = now_ms;
            self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
            let _ = actions.push(SupervisorAction::SendPing {
                seq: self.next_ping_seq,
            });
        }
    }

    fn tick_liveness(&mut self, now_ms: u64, view: &LinkView, actions: &mut Actions) {
        if !view.connected {
            return;
        }
        let silent_ms = now_ms.saturating_sub(view.last_heard_ms);
        if silent_ms < self.timing.keepalive_timeout_ms {
            self.keepalive_tripped = false;
        } else if !self.keepalive_tripped {
            self.keepalive_tripped = true;
            let in_session = matches!(
                view.state,
                SessionState::Running | SessionState::Paused | SessionState::LowBattery
            );
            match self.role {
                Role::Primary if in_session => {
                    warn!(silent_ms, "keepalive timeout in session");
                    let _ = actions.push(SupervisorAction::SendStopSession);
                    let _ = actions.push(SupervisorAction::EmergencyStop {
                        reason: "keepalive timeout",
                    });
                    let _ = actions.push(SupervisorAction::Trigger(SessionTrigger::Disconnected));
                }
                Role::Primary => {
                    debug!(silent_ms, "keepalive timeout outside session");
                    let _ = actions.push(SupervisorAction::Trigger(SessionTrigger::Disconnected));
                }
                Role::Secondary => {
                    warn!(silent_ms, "no PING or batch from PRIMARY");
                    let _ = actions.push(SupervisorAction::Trigger(SessionTrigger::Disconnected));
                    let _ = actions.push(SupervisorAction::EmergencyStop {
                        reason: "keepalive timeout",
                    });
                }
            }
        }

        // Batch starvation while running (SECONDARY only).
        if self.role == Role::Secondary && view.state == SessionState::Running {
            let starved_ms = now_ms.saturating_sub(view.last_batch_ms);
            if starved_ms < self.timing.batch_timeout_ms {
                self.batch_tripped = false;
            } else if !self.batch_tripped {
                self.batch_tripped = true;
                warn!(starved_ms, "no batch while session running");
                let _ = actions.push(SupervisorAction::EmergencyStop {
                    reason: "batch timeout",
                });
            }
        } else {
            self.batch_tripped = false;
        }
    }

    /// Deferred start: the session refuses to start without valid sync
    /// for at most the retry window, then starts degraded.
    fn tick_pending_start(&mut self, now_ms: u64, view: &LinkView, actions: &mut Actions) {
        let Some(since_ms) = self.pending_start_ms else {
            return;
        };
        if view.state != SessionState::Ready && view.state != SessionState::PhoneDisconnected {
            self.pending_start_ms = None;
            return;
        }
        if view.sync_valid {
            if actions.push(SupervisorAction::StartNow { degraded: false }).is_ok() {
                self.pending_start_ms = None;
            }
        } else if now_ms.saturating_sub(since_ms) >= self.session_cfg.auto_start_retry_window_ms {
            warn!("starting session degraded: sync not valid within grace period");
            if actions.push(SupervisorAction::StartNow { degraded: true }).is_ok() {
                self.pending_start_ms = None;
            }
        }
    }

    /// Boot window: SECONDARY connected but no phone seen — PRIMARY
    /// starts on its own so a therapy session is not lost to a
    /// missing phone.
    fn tick_auto_start(&mut self, now_ms: u64, view: &LinkView, actions: &mut Actions) {
        if self.auto_start_done {
            return;
        }
        if view.phone_seen {
            self.auto_start_done = true;
            return;
        }
        if !view.connected || view.state != SessionState::Ready {
            return;
        }
        if now_ms.saturating_sub(self.boot_ms) < self.session_cfg.startup_window_ms {
            return;
        }

        let began = *self.auto_start_began_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(self.last_auto_attempt_ms) < self.session_cfg.auto_start_retry_ms {
            return;
        }
        self.last_auto_attempt_ms = now_ms;

        if view.sync_valid {
            info!("auto-starting therapy (no phone within boot window)");
            self.auto_start_done = true;
            let _ = actions.push(SupervisorAction::StartNow { degraded: false });
        } else if now_ms.saturating_sub(began) >= self.session_cfg.auto_start_retry_window_ms {
            warn!("auto-start retries exhausted, starting degraded");
            self.auto_start_done = true;
            let _ = actions.push(SupervisorAction::StartNow { degraded: true });
        } else {
            debug!("auto-start deferred, sync not yet valid");
        }
    }
}
