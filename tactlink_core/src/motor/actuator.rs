//! Actuator driver seam.
//!
//! The hardware driver (DRV2605 behind an I²C mux) is an external
//! collaborator; this trait captures its timing contract: `prepare`
//! is the slow half of setup (channel selection, frequency
//! programming), `activate` the fast final amplitude write. The motor
//! task pre-selects after each DEACTIVATE so that at activation time
//! only the amplitude write remains.
//!
//! [`SimActuator`] is the default non-hardware backend: it records
//! the command stream (with timestamps when given a clock) for tests
//! and bench rigs.

use parking_lot::Mutex;
use std::sync::Arc;
use tact::clock::Clock;
use thiserror::Error;

/// Error types for actuator operations.
#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    /// Bus write failed for one channel.
    #[error("actuator write failed on finger {finger}: {reason}")]
    WriteFailed { finger: u8, reason: String },

    /// Bus absent or unresponsive at init.
    #[error("actuator bus unavailable: {0}")]
    BusUnavailable(String),
}

/// Interface for pluggable actuator backends.
///
/// # Timing contracts
///
/// | Operation | Budget | Notes |
/// |-----------|--------|-------|
/// | `prepare` | ~400 µs | channel select + frequency program |
/// | `activate` | ~100 µs | amplitude register write only |
/// | `deactivate` | ~100 µs | amplitude zero |
/// | `stop_all` | best effort | emergency path, all channels |
pub trait Actuator: Send {
    /// Slow setup half: select the channel and program the frequency.
    fn prepare(&mut self, finger: u8, freq_hz: u16) -> Result<(), ActuatorError>;

    /// Engage the actuator. When `prepare` ran for this finger and
    /// frequency, only the amplitude write remains.
    fn activate(&mut self, finger: u8, amplitude: u8, freq_hz: u16) -> Result<(), ActuatorError>;

    /// Release the actuator.
    fn deactivate(&mut self, finger: u8) -> Result<(), ActuatorError>;

    /// Stop every channel. Emergency path; must not assume prior state.
    fn stop_all(&mut self) -> Result<(), ActuatorError>;
}

/// One recorded actuator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorOp {
    Prepare { finger: u8, freq_hz: u16, at_us: u64 },
    Activate { finger: u8, amplitude: u8, freq_hz: u16, at_us: u64 },
    Deactivate { finger: u8, at_us: u64 },
    StopAll { at_us: u64 },
}

impl ActuatorOp {
    /// Timestamp of the recorded command.
    pub const fn at_us(&self) -> u64 {
        match self {
            Self::Prepare { at_us, .. }
            | Self::Activate { at_us, .. }
            | Self::Deactivate { at_us, .. }
            | Self::StopAll { at_us } => *at_us,
        }
    }
}

/// Recording simulation backend.
pub struct SimActuator {
    log: Arc<Mutex<Vec<ActuatorOp>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SimActuator {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            clock: None,
        }
    }

    /// Record command timestamps from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            clock: Some(clock),
        }
    }

    /// Shared handle to the recorded command stream.
    pub fn log(&self) -> Arc<Mutex<Vec<ActuatorOp>>> {
        self.log.clone()
    }

    fn now(&self) -> u64 {
        self.clock.as_ref().map_or(0, |c| c.now_us())
    }
}

impl Default for SimActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl Actuator for SimActuator {
    fn prepare(&mut self, finger: u8, freq_hz: u16) -> Result<(), ActuatorError> {
        let at_us = self.now();
        self.log.lock().push(ActuatorOp::Prepare { finger, freq_hz, at_us });
        Ok(())
    }

    fn activate(&mut self, finger: u8, amplitude: u8, freq_hz: u16) -> Result<(), ActuatorError> {
        let at_us = self.now();
        self.log
            .lock()
            .push(ActuatorOp::Activate { finger, amplitude, freq_hz, at_us });
        Ok(())
    }

    fn deactivate(&mut self, finger: u8) -> Result<(), ActuatorError> {
        let at_us = self.now();
        self.log.lock().push(ActuatorOp::Deactivate { finger, at_us });
        Ok(())
    }

    fn stop_all(&mut self) -> Result<(), ActuatorError> {
        let at_us = self.now();
        self.log.lock().push(ActuatorOp::StopAll { at_us });
        Ok(())
    }
}
