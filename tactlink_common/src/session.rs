//! Session state and trigger enums.
//!
//! All enums use `#[repr(u8)]` so the state fits one atomic cell.
//! The state machine itself (transition table, compare-exchange
//! commit, observers) lives in the core crate; these are the shared
//! vocabulary both sides of the link agree on.

use serde::{Deserialize, Serialize};

/// Process-wide session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// Boot state; no peer link.
    Idle = 0,
    /// Peer link up, handshake/sync pending.
    Connecting = 1,
    /// Peer connected, ready to start a session.
    Ready = 2,
    /// Therapy session running; the only state in which motor events execute.
    Running = 3,
    /// Session paused; queue idle but session context retained.
    Paused = 4,
    /// Session winding down; queue draining before return to Idle.
    Stopping = 5,
    /// Unrecoverable fault; awaits explicit reset.
    Error = 6,
    /// Battery warning active; session continues.
    LowBattery = 7,
    /// Battery critically low; motors stopped.
    CriticalBattery = 8,
    /// Peer link lost; motors stopped.
    ConnectionLost = 9,
    /// Phone link lost while idle/ready.
    PhoneDisconnected = 10,
}

impl SessionState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Connecting),
            2 => Some(Self::Ready),
            3 => Some(Self::Running),
            4 => Some(Self::Paused),
            5 => Some(Self::Stopping),
            6 => Some(Self::Error),
            7 => Some(Self::LowBattery),
            8 => Some(Self::CriticalBattery),
            9 => Some(Self::ConnectionLost),
            10 => Some(Self::PhoneDisconnected),
            _ => None,
        }
    }

    /// Whether motor events may execute in this state.
    #[inline]
    pub const fn allows_execution(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events that can drive a session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionTrigger {
    Connected = 0,
    Disconnected = 1,
    Reconnected = 2,
    ReconnectFailed = 3,
    StartSession = 4,
    PauseSession = 5,
    ResumeSession = 6,
    StopSession = 7,
    SessionComplete = 8,
    BatteryWarning = 9,
    BatteryCritical = 10,
    BatteryOk = 11,
    PhoneLost = 12,
    PhoneReconnected = 13,
    ErrorOccurred = 14,
    EmergencyStop = 15,
    Reset = 16,
    ForcedShutdown = 17,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_u8_roundtrip() {
        for raw in 0..=10u8 {
            let state = SessionState::from_u8(raw).unwrap();
            assert_eq!(state as u8, raw);
        }
        assert!(SessionState::from_u8(11).is_none());
        assert!(SessionState::from_u8(255).is_none());
    }

    #[test]
    fn only_running_allows_execution() {
        for raw in 0..=10u8 {
            let state = SessionState::from_u8(raw).unwrap();
            assert_eq!(state.allows_execution(), state == SessionState::Running);
        }
    }
}
