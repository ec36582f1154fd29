//! Adaptive lead-time estimator.
//!
//! Computes the scheduling horizon for each new batch from smoothed
//! one-way latency `L` and one-way variance `V` (RFC 6298 style
//! smoothing over keepalive RTT samples):
//!
//! ```text
//! lead_time = 2·L + 6·V + 10 ms (SECONDARY) + 5 ms (PRIMARY)
//! lead_time = clamp(lead_time, 70 ms, 150 ms)
//! ```
//!
//! Before enough samples exist the floor is returned.

use tact::config::TimingConfig;
use tact::consts::{
    LEAD_TIME_MIN_SAMPLES, PRIMARY_GEN_OVERHEAD_US, SECONDARY_PROC_OVERHEAD_US,
};
use tracing::debug;

pub struct LeadTimeEstimator {
    /// Smoothed one-way latency [µs].
    smoothed_latency_us: f32,
    /// Smoothed one-way deviation [µs].
    smoothed_variance_us: f32,
    samples: u32,
    min_us: u64,
    max_us: u64,
}

impl LeadTimeEstimator {
    pub fn new(timing: &TimingConfig) -> Self {
        // The configured initial lead time sits below the floor; the
        // clamp always wins. Kept as configured until the floor is
        // relaxed.
        let _ = timing.lead_time_initial_us;
        Self {
            smoothed_latency_us: 0.0,
            smoothed_variance_us: 0.0,
            samples: 0,
            min_us: timing.lead_time_min_us,
            max_us: timing.lead_time_max_us,
        }
    }

    /// Fold in one keepalive RTT measurement.
    pub fn record_rtt(&mut self, rtt_us: u32) {
        let one_way = rtt_us as f32 / 2.0;
        if self.samples == 0 {
            self.smoothed_latency_us = one_way;
            self.smoothed_variance_us = one_way / 2.0;
        } else {
            let err = one_way - self.smoothed_latency_us;
            self.smoothed_latency_us += err / 8.0;
            self.smoothed_variance_us += (err.abs() - self.smoothed_variance_us) / 4.0;
        }
        self.samples += 1;
        debug!(
            rtt_us,
            latency_us = self.smoothed_latency_us,
            variance_us = self.smoothed_variance_us,
            "lead-time sample"
        );
    }

    /// Scheduling horizon for the next batch [µs].
    pub fn lead_time_us(&self) -> u64 {
        if self.samples < LEAD_TIME_MIN_SAMPLES {
            return self.min_us;
        }
        let raw = 2.0 * self.smoothed_latency_us
            + 6.0 * self.smoothed_variance_us
            + SECONDARY_PROC_OVERHEAD_US as f32
            + PRIMARY_GEN_OVERHEAD_US as f32;
        (raw as u64).clamp(self.min_us, self.max_us)
    }

    #[inline]
    pub const fn sample_count(&self) -> u32 {
        self.samples
    }
}
