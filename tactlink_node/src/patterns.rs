//! Built-in pattern source.
//!
//! Pattern generation proper lives outside the engine; this is the
//! default generator the node boots with: three pulses across the
//! four fingers per macrocycle, rotating the starting finger each
//! cycle so no finger leads permanently.

use tact::consts::BATCH_EVENT_MAX;
use tactlink_core::therapy::{PatternBatch, PatternSource, PatternTuple};

pub struct CyclingPattern {
    pulse_gap_ms: u16,
    duration_ms: u16,
    amplitude: u8,
    freq_hz: u16,
    start_finger: u8,
}

impl CyclingPattern {
    pub fn new(pulse_gap_ms: u16, duration_ms: u16, amplitude: u8, freq_hz: u16) -> Self {
        Self {
            pulse_gap_ms,
            duration_ms,
            amplitude,
            freq_hz,
            start_finger: 0,
        }
    }
}

impl Default for CyclingPattern {
    fn default() -> Self {
        // 167 ms between pulses, 100 ms on time, 250 Hz.
        Self::new(167, 100, 100, 250)
    }
}

impl PatternSource for CyclingPattern {
    fn next_batch(&mut self) -> Option<PatternBatch> {
        let mut events = heapless::Vec::new();
        for i in 0..BATCH_EVENT_MAX as u16 {
            let finger = ((self.start_finger as u16 + i) % 4) as u8;
            let _ = events.push(PatternTuple {
                delta_ms: i * self.pulse_gap_ms,
                finger,
                amplitude: self.amplitude,
                freq_hz: self.freq_hz,
            });
        }
        self.start_finger = (self.start_finger + 1) % 4;
        Some(PatternBatch {
            duration_ms: self.duration_ms,
            events,
        })
    }
}
