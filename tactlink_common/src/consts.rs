//! System-wide constants for the TactLink workspace.
//!
//! Single source of truth for all protocol timing, capacity, and
//! range limits. Imported by all crates — no duplication permitted.

use static_assertions::const_assert;

// ─── Keepalive & liveness ───────────────────────────────────────────

/// Keepalive probe interval on PRIMARY [ms].
pub const KEEPALIVE_INTERVAL_MS: u64 = 1_000;

/// Link considered lost after this much silence [ms].
pub const KEEPALIVE_TIMEOUT_MS: u64 = 6_000;

/// SECONDARY safety halt when no batch arrives while running [ms].
pub const BATCH_TIMEOUT_MS: u64 = 10_000;

/// Boot window during which SECONDARY auto-starts without a phone [ms].
pub const STARTUP_WINDOW_MS: u64 = 30_000;

/// Auto-start retry cadence within the startup window [ms].
pub const AUTO_START_RETRY_MS: u64 = 1_000;

/// Auto-start retries stop after this long; a pending start then
/// proceeds in degraded mode [ms].
pub const AUTO_START_RETRY_WINDOW_MS: u64 = 10_000;

// ─── Clock synchronization ──────────────────────────────────────────

/// Samples with a round-trip above this are rejected (exclusive bound) [µs].
pub const RTT_QUALITY_THRESHOLD_US: u32 = 60_000;

/// Offsets at or beyond this magnitude are rejected [µs].
pub const MAX_OFFSET_US: i64 = 35_000_000;

/// Cold start declares sync valid after this many filtered samples.
pub const MIN_VALID_SAMPLES: usize = 5;

/// Circular offset-sample window size.
pub const OFFSET_WINDOW: usize = 10;

/// MAD outlier filter floor [µs].
pub const OUTLIER_THRESHOLD_US: i64 = 5_000;

/// Warm-start cache expires this long after the last maintenance update [ms].
pub const WARM_START_VALIDITY_MS: u64 = 15_000;

/// Warm-start confirmations required before sync is valid again.
pub const WARM_START_MIN_SAMPLES: u8 = 3;

/// Warm-start samples must lie within this of the projection [µs].
pub const WARM_START_TOLERANCE_US: i64 = 5_000;

/// Smoothing factor for the maintained offset EMA.
pub const OFFSET_EMA_ALPHA: f32 = 0.1;

/// Smoothing factor for the drift-rate EMA.
pub const DRIFT_EMA_ALPHA: f32 = 0.3;

/// Minimum spacing between samples used for a drift measurement [ms].
pub const DRIFT_MIN_ELAPSED_MS: u64 = 500;

/// Drift measurements are clamped to this magnitude [µs/ms].
pub const MAX_DRIFT_MEASUREMENT: f32 = 0.15;

/// Drift applied in projection is clamped to this magnitude [µs/ms].
pub const MAX_DRIFT_APPLIED: f32 = 0.10;

/// Offset projection never extrapolates further than this [ms].
pub const PROJECTION_CAP_MS: u64 = 10_000;

// ─── Lead time ──────────────────────────────────────────────────────

/// Configured initial lead time [µs]. Below the floor; the clamp in
/// the estimator always wins, so this value is effectively inert until
/// the floor is relaxed.
pub const INITIAL_LEAD_TIME_US: u64 = 35_000;

/// Lead-time floor [µs].
pub const LEAD_TIME_MIN_US: u64 = 70_000;

/// Lead-time ceiling [µs].
pub const LEAD_TIME_MAX_US: u64 = 150_000;

/// SECONDARY parse/stage/forward overhead margin [µs].
pub const SECONDARY_PROC_OVERHEAD_US: u64 = 10_000;

/// PRIMARY batch generation overhead margin [µs].
pub const PRIMARY_GEN_OVERHEAD_US: u64 = 5_000;

/// RTT samples required before the adaptive horizon engages.
pub const LEAD_TIME_MIN_SAMPLES: u32 = 5;

// ─── Batching & queues ──────────────────────────────────────────────

/// Maximum events per macrocycle batch.
pub const BATCH_EVENT_MAX: usize = 12;

/// Motor event queue capacity (activate + deactivate slots).
pub const QUEUE_CAPACITY: usize = 32;

/// Staging ring capacity (radio callback → main context).
pub const STAGING_CAPACITY: usize = 16;

/// Queued events may be at most this far in the past at insertion [µs].
pub const QUEUE_STALE_TOLERANCE_US: u64 = 10_000;

/// Batches anchored further than this ahead of "now" are rejected [µs].
pub const BASE_TIME_MAX_AHEAD_US: u64 = 30_000_000;

// ─── Motor execution ────────────────────────────────────────────────

/// Below this remaining delay the motor task spin-waits [µs].
pub const SPIN_THRESHOLD_US: i64 = 2_000;

/// Coarse sleep wakes this early to hand over to the spin phase [µs].
pub const COARSE_SLEEP_MARGIN_US: i64 = 1_000;

/// Number of actuated fingers per device.
pub const FINGER_COUNT: u8 = 4;

/// Maximum activation amplitude [%].
pub const AMPLITUDE_MAX: u8 = 100;

/// Lowest representable actuator frequency [Hz].
pub const FREQ_MIN_HZ: u16 = 200;

/// Highest representable actuator frequency [Hz].
pub const FREQ_MAX_HZ: u16 = 455;

/// Wire frequency offset granularity [Hz].
pub const FREQ_STEP_HZ: u16 = 5;

// ─── Metrics ────────────────────────────────────────────────────────

/// Execution drift above this counts as late [µs].
pub const LATE_THRESHOLD_US: i64 = 1_000;

/// Periodic latency report interval [ms].
pub const REPORT_INTERVAL_MS: u64 = 30_000;

// ─── Wire framing ───────────────────────────────────────────────────

/// Frame terminator byte (ASCII EOT).
pub const FRAME_EOT: u8 = 0x04;

/// Scratch buffer size for one serialized frame.
pub const FRAME_BUF_LEN: usize = 512;

// Staging ring indices are masked, so the capacity must be a power of two.
const_assert!(STAGING_CAPACITY.is_power_of_two());
// One batch (activate + paired deactivate per event) must fit the queue.
const_assert!(2 * BATCH_EVENT_MAX <= QUEUE_CAPACITY);
// The freq offset byte must cover the full frequency range.
const_assert!((FREQ_MAX_HZ - FREQ_MIN_HZ) / FREQ_STEP_HZ <= u8::MAX as u16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(KEEPALIVE_INTERVAL_MS < KEEPALIVE_TIMEOUT_MS);
        assert!(KEEPALIVE_TIMEOUT_MS < BATCH_TIMEOUT_MS);
        assert!(LEAD_TIME_MIN_US < LEAD_TIME_MAX_US);
        assert!(MIN_VALID_SAMPLES <= OFFSET_WINDOW);
        assert!((WARM_START_MIN_SAMPLES as usize) < MIN_VALID_SAMPLES);
        assert!(MAX_DRIFT_APPLIED < MAX_DRIFT_MEASUREMENT);
        assert!(COARSE_SLEEP_MARGIN_US < SPIN_THRESHOLD_US);
    }

    #[test]
    fn initial_lead_time_sits_below_the_floor() {
        // Deliberate: the floor always wins until the clamp is relaxed.
        assert!(INITIAL_LEAD_TIME_US < LEAD_TIME_MIN_US);
    }

    #[test]
    fn freq_range_maps_onto_offset_byte() {
        assert_eq!((FREQ_MAX_HZ - FREQ_MIN_HZ) % FREQ_STEP_HZ, 0);
        assert_eq!((FREQ_MAX_HZ - FREQ_MIN_HZ) / FREQ_STEP_HZ, 51);
    }
}
