//! Motor events and macrocycle batches.
//!
//! A motor event is an ACTIVATE or DEACTIVATE of one finger at an
//! absolute local microsecond instant. A batch groups up to twelve
//! future activations under one PRIMARY-domain anchor time plus the
//! clock offset needed to translate it into the SECONDARY domain.

use crate::consts::{
    AMPLITUDE_MAX, BATCH_EVENT_MAX, FINGER_COUNT, FREQ_MAX_HZ, FREQ_MIN_HZ, FREQ_STEP_HZ,
};
use serde::{Deserialize, Serialize};

/// Event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Engage the actuator at `amplitude` / `freq_hz`.
    Activate = 0,
    /// Release the actuator.
    Deactivate = 1,
}

impl EventKind {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Activate),
            1 => Some(Self::Deactivate),
            _ => None,
        }
    }
}

/// One scheduled actuation, in the local clock domain.
///
/// `amplitude` and `freq_hz` are meaningful only for
/// [`EventKind::Activate`]; a DEACTIVATE carries zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorEvent {
    pub kind: EventKind,
    /// Scheduled execution instant, local monotonic microseconds.
    pub time_us: u64,
    /// Finger index, `0..FINGER_COUNT`.
    pub finger: u8,
    /// Activation amplitude [%].
    pub amplitude: u8,
    /// Activation frequency [Hz].
    pub freq_hz: u16,
}

impl MotorEvent {
    pub const fn activate(time_us: u64, finger: u8, amplitude: u8, freq_hz: u16) -> Self {
        Self {
            kind: EventKind::Activate,
            time_us,
            finger,
            amplitude,
            freq_hz,
        }
    }

    pub const fn deactivate(time_us: u64, finger: u8) -> Self {
        Self {
            kind: EventKind::Deactivate,
            time_us,
            finger,
            amplitude: 0,
            freq_hz: 0,
        }
    }

    /// Range-check finger, amplitude, and frequency.
    pub fn in_range(&self) -> bool {
        if self.finger >= FINGER_COUNT {
            return false;
        }
        match self.kind {
            EventKind::Activate => {
                self.amplitude <= AMPLITUDE_MAX
                    && self.freq_hz >= FREQ_MIN_HZ
                    && self.freq_hz <= FREQ_MAX_HZ
            }
            EventKind::Deactivate => true,
        }
    }
}

/// One batched activation relative to the batch anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    /// Offset from the batch anchor [ms].
    pub delta_ms: u16,
    /// Finger index.
    pub finger: u8,
    /// Activation amplitude [%].
    pub amplitude: u8,
    /// `(freq_hz − 200) / 5`; 0 means 200 Hz.
    pub freq_offset: u8,
}

impl EventSpec {
    pub fn from_freq(delta_ms: u16, finger: u8, amplitude: u8, freq_hz: u16) -> Self {
        let clamped = freq_hz.clamp(FREQ_MIN_HZ, FREQ_MAX_HZ);
        Self {
            delta_ms,
            finger,
            amplitude,
            freq_offset: ((clamped - FREQ_MIN_HZ) / FREQ_STEP_HZ) as u8,
        }
    }

    /// Decode the wire frequency offset back to Hz.
    #[inline]
    pub const fn freq_hz(&self) -> u16 {
        FREQ_MIN_HZ + self.freq_offset as u16 * FREQ_STEP_HZ
    }
}

/// A macrocycle: up to twelve future events under one anchor.
///
/// `base_time_us` is in the PRIMARY clock domain; `clock_offset_us`
/// is `t_secondary − t_primary`, so SECONDARY computes
/// `local = base_time_us + clock_offset_us`. All events share
/// `duration_ms` of ON time; deltas are monotone non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub sequence_id: u32,
    pub base_time_us: u64,
    pub clock_offset_us: i64,
    pub duration_ms: u16,
    pub events: heapless::Vec<EventSpec, BATCH_EVENT_MAX>,
}

/// Structural violation found by [`Batch::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFault {
    /// A delta decreased relative to its predecessor.
    DeltasNotMonotone,
    /// A finger index is out of range.
    BadFinger,
    /// An amplitude exceeds the maximum.
    BadAmplitude,
}

impl Batch {
    pub fn new(sequence_id: u32, base_time_us: u64, clock_offset_us: i64, duration_ms: u16) -> Self {
        Self {
            sequence_id,
            base_time_us,
            clock_offset_us,
            duration_ms,
            events: heapless::Vec::new(),
        }
    }

    /// Structural validation. Range checks on offset/anchor freshness
    /// belong to the receive path, not the data model.
    pub fn validate(&self) -> Result<(), BatchFault> {
        let mut prev = 0u16;
        for spec in &self.events {
            if spec.delta_ms < prev {
                return Err(BatchFault::DeltasNotMonotone);
            }
            prev = spec.delta_ms;
            if spec.finger >= FINGER_COUNT {
                return Err(BatchFault::BadFinger);
            }
            if spec.amplitude > AMPLITUDE_MAX {
                return Err(BatchFault::BadAmplitude);
            }
        }
        Ok(())
    }

    /// Absolute activation instant of `spec` once the anchor is local.
    #[inline]
    pub const fn activate_time_us(local_base_us: u64, spec: &EventSpec) -> u64 {
        local_base_us + spec.delta_ms as u64 * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_pairs_carry_parameters() {
        let e = MotorEvent::activate(1_000, 2, 80, 250);
        assert!(e.in_range());
        let d = MotorEvent::deactivate(2_000, 2);
        assert!(d.in_range());
        assert_eq!(d.amplitude, 0);
    }

    #[test]
    fn range_checks() {
        assert!(!MotorEvent::activate(0, 4, 50, 250).in_range());
        assert!(!MotorEvent::activate(0, 0, 101, 250).in_range());
        assert!(!MotorEvent::activate(0, 0, 50, 199).in_range());
        assert!(!MotorEvent::activate(0, 0, 50, 456).in_range());
        assert!(MotorEvent::activate(0, 3, 100, 455).in_range());
    }

    #[test]
    fn freq_offset_roundtrip() {
        for hz in (FREQ_MIN_HZ..=FREQ_MAX_HZ).step_by(FREQ_STEP_HZ as usize) {
            let spec = EventSpec::from_freq(0, 0, 50, hz);
            assert_eq!(spec.freq_hz(), hz);
        }
        // 250 Hz is offset 10.
        assert_eq!(EventSpec::from_freq(0, 0, 50, 250).freq_offset, 10);
    }

    #[test]
    fn batch_validation() {
        let mut batch = Batch::new(1, 1_080_000, 45_000, 100);
        batch.events.push(EventSpec::from_freq(0, 0, 100, 250)).unwrap();
        batch.events.push(EventSpec::from_freq(167, 1, 100, 250)).unwrap();
        assert_eq!(batch.validate(), Ok(()));

        batch.events.push(EventSpec::from_freq(100, 2, 100, 250)).unwrap();
        assert_eq!(batch.validate(), Err(BatchFault::DeltasNotMonotone));
    }

    #[test]
    fn batch_rejects_bad_finger() {
        let mut batch = Batch::new(1, 0, 0, 100);
        batch.events.push(EventSpec::from_freq(0, 7, 100, 250)).unwrap();
        assert_eq!(batch.validate(), Err(BatchFault::BadFinger));
    }

    #[test]
    fn activate_time_applies_delta() {
        let spec = EventSpec::from_freq(167, 1, 100, 250);
        assert_eq!(Batch::activate_time_us(1_125_000, &spec), 1_292_000);
    }
}
