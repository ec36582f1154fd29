//! Session state machine.
//!
//! Eleven states, atomic access, transition table, observer
//! callbacks. Each trigger consults the table under a
//! compare-exchange on the current state: if the observed state no
//! longer matches what the transition was computed from (a
//! radio-callback trigger raced a main-context trigger), the
//! transition is abandoned rather than applied to a stale view.
//!
//! Observers are plain function values owned by the machine; they may
//! query the machine but own nothing themselves, and
//! [`SessionFsm::clear_observers`] truncates the list.

use core::sync::atomic::{AtomicU8, Ordering};
use parking_lot::Mutex;
use tact::session::{SessionState, SessionTrigger};
use tracing::{debug, info, warn};

/// A committed transition, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: SessionTrigger,
    pub reason: Option<&'static str>,
}

/// Result of a trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Transition committed and observers notified.
    Committed(Transition),
    /// The table has no edge for this (state, trigger).
    Rejected {
        state: SessionState,
        reason: &'static str,
    },
    /// Another context changed the state first; nothing was applied.
    Raced,
}

impl TriggerOutcome {
    #[inline]
    pub const fn committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Maximum registered observers.
pub const MAX_OBSERVERS: usize = 4;

type Observer = Box<dyn Fn(&Transition) + Send + Sync>;

pub struct SessionFsm {
    state: AtomicU8,
    observers: Mutex<heapless::Vec<Observer, MAX_OBSERVERS>>,
}

impl SessionFsm {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            observers: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Current state. Readable from any context.
    #[inline]
    pub fn state(&self) -> SessionState {
        // The cell only ever holds values written from SessionState.
        SessionState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Error)
    }

    /// Attempt a transition.
    pub fn trigger(&self, trigger: SessionTrigger) -> TriggerOutcome {
        let observed = self.state();
        let Some((next, reason)) = transition_for(observed, trigger) else {
            debug!(?observed, ?trigger, "transition rejected");
            return TriggerOutcome::Rejected {
                state: observed,
                reason: rejection_reason(observed),
            };
        };

        if self
            .state
            .compare_exchange(
                observed as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(?observed, ?trigger, "transition abandoned, state raced");
            return TriggerOutcome::Raced;
        }

        let transition = Transition {
            from: observed,
            to: next,
            trigger,
            reason,
        };
        info!(from = ?observed, to = ?next, ?trigger, "session transition");
        self.notify(&transition);
        TriggerOutcome::Committed(transition)
    }

    /// Bypass the table. Reserved for emergency code paths; observers
    /// are still notified so safety bindings fire.
    pub fn force_state(&self, to: SessionState, trigger: SessionTrigger) {
        let from = SessionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
            .unwrap_or(SessionState::Error);
        if from == to {
            return;
        }
        warn!(?from, ?to, ?trigger, "session state forced");
        self.notify(&Transition {
            from,
            to,
            trigger,
            reason: Some("forced"),
        });
    }

    /// Register an observer. Fails when all slots are taken.
    pub fn add_observer(&self, observer: Observer) -> Result<(), ()> {
        self.observers.lock().push(observer).map_err(|_| ())
    }

    /// Truncate the observer list.
    pub fn clear_observers(&self) {
        self.observers.lock().clear();
    }

    fn notify(&self, transition: &Transition) {
        let observers = self.observers.lock();
        for observer in observers.iter() {
            observer(transition);
        }
    }
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// The transition table. `None` means the edge does not exist.
fn transition_for(
    state: SessionState,
    trigger: SessionTrigger,
) -> Option<(SessionState, Option<&'static str>)> {
    use SessionState::*;
    use SessionTrigger::*;

    let next = match (state, trigger) {
        // Wildcard edges checked first: faults and explicit teardown
        // are honored from every state.
        (_, ErrorOccurred) => (Error, Some("fault")),
        (_, EmergencyStop) => (Error, Some("emergency stop")),
        (_, Reset) => (Idle, None),
        (_, ForcedShutdown) => (Idle, Some("forced shutdown")),

        // Link bring-up.
        (Idle, Connected) => (Connecting, None),
        (Connecting, Connected) => (Ready, None),
        (Connecting, Disconnected) => (Idle, None),

        // Ready.
        (Ready, StartSession) => (Running, None),
        (Ready, Disconnected) => (Connecting, Some("link retrying")),
        (Ready, PhoneLost) => (PhoneDisconnected, None),
        (Ready, BatteryCritical) => (CriticalBattery, None),

        // Running.
        (Running, PauseSession) => (Paused, None),
        (Running, StopSession) => (Stopping, None),
        (Running, SessionComplete) => (Stopping, Some("pattern source exhausted")),
        (Running, Disconnected) => (ConnectionLost, Some("link lost in session")),
        (Running, BatteryWarning) => (LowBattery, None),
        (Running, BatteryCritical) => (CriticalBattery, None),

        // Paused.
        (Paused, ResumeSession) => (Running, None),
        (Paused, StopSession) => (Stopping, None),
        (Paused, Disconnected) => (ConnectionLost, Some("link lost in session")),
        (Paused, BatteryCritical) => (CriticalBattery, None),

        // Stopping: queue drained → back to Idle.
        (Stopping, SessionComplete) => (Idle, Some("queue drained")),
        (Stopping, Disconnected) => (ConnectionLost, None),

        // Low battery: session continues until ok/critical/stop.
        (LowBattery, BatteryOk) => (Running, None),
        (LowBattery, BatteryCritical) => (CriticalBattery, None),
        (LowBattery, StopSession) => (Stopping, None),
        (LowBattery, SessionComplete) => (Stopping, None),
        (LowBattery, Disconnected) => (ConnectionLost, None),

        // Link loss recovery.
        (ConnectionLost, Reconnected) => (Ready, None),
        (ConnectionLost, ReconnectFailed) => (Error, Some("reconnect failed")),

        // Phone loss while not in session.
        (PhoneDisconnected, PhoneReconnected) => (Ready, None),
        (PhoneDisconnected, StartSession) => (Running, Some("auto-start")),
        (PhoneDisconnected, Disconnected) => (Connecting, None),

        _ => return None,
    };
    Some(next)
}

fn rejection_reason(state: SessionState) -> &'static str {
    use SessionState::*;
    match state {
        Idle => "Idle: awaiting Connected",
        Connecting => "Connecting: awaiting handshake or Disconnected",
        Ready => "Ready: invalid trigger for current state",
        Running => "Running: invalid trigger for current state",
        Paused => "Paused: invalid trigger for current state",
        Stopping => "Stopping: draining, only SessionComplete/Disconnected",
        Error => "Error: only Reset allowed",
        LowBattery => "LowBattery: invalid trigger for current state",
        CriticalBattery => "CriticalBattery: only Reset allowed",
        ConnectionLost => "ConnectionLost: only Reconnected/ReconnectFailed/Reset",
        PhoneDisconnected => "PhoneDisconnected: invalid trigger for current state",
    }
}
