//! Clock-sync engine.
//!
//! Four-timestamp offset estimation: given `(t1, t2, t3, t4)` the
//! engine computes `offset = ((t2 − t1) + (t3 − t4)) / 2` and
//! `rtt = (t4 − t1) − (t3 − t2)` (RTT excludes SECONDARY processing
//! time). Offset convention throughout: `offset = t_secondary −
//! t_primary`, so SECONDARY computes `local = primary + offset`;
//! where prose and formula disagree, the formula wins.
//!
//! Three phases:
//! - **Cold start** — collect samples; once enough exist, take the
//!   provisional median, filter by MAD, and require a quorum of
//!   survivors before declaring sync valid.
//! - **Warm start** — after a brief disconnect, project the cached
//!   offset forward by the cached drift and require confirmatory
//!   samples near the projection; any divergence aborts back to cold.
//! - **Maintenance** — exponential smoothing of the offset, drift-rate
//!   estimation with separate measurement and application clamps, and
//!   a cache refresh after every update.
//!
//! Single-threaded: main context only.

use crate::sync::cache::WarmStartCache;
use heapless::Deque;
use tact::config::SyncConfig;
use tact::consts::{
    DRIFT_MIN_ELAPSED_MS, MAX_DRIFT_APPLIED, MAX_DRIFT_MEASUREMENT, OFFSET_WINDOW,
    OUTLIER_THRESHOLD_US, PROJECTION_CAP_MS,
};
use tracing::{debug, info, trace, warn};

/// One accepted offset measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    pub value_us: i64,
    pub rtt_us: u32,
    pub arrival_ms: u64,
}

/// Returned to the caller so RTT statistics can feed the lead-time
/// estimator and the latency metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedSample {
    pub offset_us: i64,
    pub rtt_us: u32,
}

/// Outstanding keepalive probe awaiting its PONG.
#[derive(Debug, Clone, Copy)]
struct PendingPing {
    seq: u32,
    t1_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Cold,
    Warm,
    Valid,
}

/// Diagnostic snapshot for the console surface.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub valid: bool,
    pub warm_start: bool,
    pub window_len: usize,
    pub median_offset_us: i64,
    pub drift_us_per_ms: f32,
    pub accepted: u32,
    pub rejected: u32,
    pub cache_valid: bool,
    pub cache_age_ms: Option<u64>,
    pub last_update_ms: u64,
}

pub struct SyncEngine {
    cfg: SyncConfig,
    window: Deque<OffsetSample, OFFSET_WINDOW>,
    phase: Phase,
    median_offset_us: i64,
    drift_us_per_ms: f32,
    last_update_ms: u64,
    /// Basis for the next drift measurement: (offset, arrival ms).
    prev_sample: Option<(i64, u64)>,
    warm_confirmations: u8,
    warm_projection_us: i64,
    cache: WarmStartCache,
    pending: Option<PendingPing>,
    accepted: u32,
    rejected: u32,
}

impl SyncEngine {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            window: Deque::new(),
            phase: Phase::Cold,
            median_offset_us: 0,
            drift_us_per_ms: 0.0,
            last_update_ms: 0,
            prev_sample: None,
            warm_confirmations: 0,
            warm_projection_us: 0,
            cache: WarmStartCache::new(),
            pending: None,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Register an outgoing probe. A newer probe supersedes an
    /// unanswered one.
    pub fn begin_ping(&mut self, seq: u32, t1_us: u64) {
        self.pending = Some(PendingPing { seq, t1_us });
    }

    /// Process a PONG. `t4_us` must be sampled at the earliest point
    /// of the receive callback. Returns the accepted sample, or `None`
    /// when the PONG is unknown or the sample fails quality checks.
    pub fn on_pong(
        &mut self,
        seq: u32,
        t2: u64,
        t3: u64,
        t4_us: u64,
        now_ms: u64,
    ) -> Option<AcceptedSample> {
        let pending = self.pending?;
        if pending.seq != seq {
            trace!(seq, expected = pending.seq, "PONG for unknown sequence, discarded");
            return None;
        }
        self.pending = None;

        if t3 < t2 {
            warn!(t2, t3, "PONG timestamps out of order, sample not consumed");
            return None;
        }
        let t1 = pending.t1_us;
        let offset_us = ((t2 as i64 - t1 as i64) + (t3 as i64 - t4_us as i64)) / 2;
        let rtt = (t4_us as i64 - t1 as i64) - (t3 as i64 - t2 as i64);
        if rtt < 0 {
            warn!(rtt, "negative round-trip, sample not consumed");
            return None;
        }
        let rtt_us = rtt as u32;

        // Quality gate: exclusive upper bound on RTT.
        if rtt_us >= self.cfg.rtt_quality_threshold_us {
            self.rejected += 1;
            trace!(rtt_us, "sample rejected on RTT quality");
            return None;
        }
        if offset_us.unsigned_abs() >= self.cfg.max_offset_us.unsigned_abs() {
            self.rejected += 1;
            warn!(offset_us, "sample rejected on excessive offset");
            return None;
        }

        self.accepted += 1;
        let sample = OffsetSample {
            value_us: offset_us,
            rtt_us,
            arrival_ms: now_ms,
        };
        self.ingest(sample, now_ms);
        Some(AcceptedSample { offset_us, rtt_us })
    }

    fn ingest(&mut self, sample: OffsetSample, now_ms: u64) {
        match self.phase {
            Phase::Cold => {
                self.push_window(sample);
                if self.window.len() >= self.cfg.min_valid_samples {
                    self.evaluate_cold(now_ms);
                }
            }
            Phase::Warm => self.ingest_warm(sample, now_ms),
            Phase::Valid => {
                self.push_window(sample);
                self.maintain(sample, now_ms);
            }
        }
    }

    fn push_window(&mut self, sample: OffsetSample) {
        if self.window.is_full() {
            self.window.pop_front();
        }
        // Capacity just ensured.
        let _ = self.window.push_back(sample);
    }

    /// Cold-start quorum: provisional median, MAD filter, re-median.
    fn evaluate_cold(&mut self, now_ms: u64) {
        let mut values: heapless::Vec<i64, OFFSET_WINDOW> = heapless::Vec::new();
        for s in self.window.iter() {
            let _ = values.push(s.value_us);
        }
        let prelim = median_i64(&mut values.clone());

        let mut deviations: heapless::Vec<i64, OFFSET_WINDOW> = heapless::Vec::new();
        for v in &values {
            let _ = deviations.push((v - prelim).abs());
        }
        let mad = median_i64(&mut deviations);
        let threshold = (3 * mad).max(OUTLIER_THRESHOLD_US);

        let mut filtered: heapless::Vec<i64, OFFSET_WINDOW> = heapless::Vec::new();
        for v in &values {
            if (v - prelim).abs() <= threshold {
                let _ = filtered.push(*v);
            }
        }

        if filtered.len() >= self.cfg.min_valid_samples {
            self.median_offset_us = median_i64(&mut filtered);
            self.phase = Phase::Valid;
            self.last_update_ms = now_ms;
            self.prev_sample = Some((self.median_offset_us, now_ms));
            self.cache
                .store(self.median_offset_us, self.drift_us_per_ms, now_ms);
            info!(
                median_us = self.median_offset_us,
                samples = filtered.len(),
                "clock sync valid (cold start)"
            );
        } else {
            debug!(
                kept = filtered.len(),
                need = self.cfg.min_valid_samples,
                "outlier filter left too few samples, still collecting"
            );
        }
    }

    fn ingest_warm(&mut self, sample: OffsetSample, now_ms: u64) {
        let deviation = (sample.value_us - self.warm_projection_us).abs();
        if deviation > self.cfg.warm_start_tolerance_us {
            warn!(
                deviation_us = deviation,
                "warm start aborted, cache invalidated, restarting cold"
            );
            self.cache.invalidate();
            self.phase = Phase::Cold;
            self.warm_confirmations = 0;
            self.window.clear();
            self.push_window(sample);
            return;
        }

        self.warm_confirmations += 1;
        self.push_window(sample);
        // Blend confirmations toward the measured reality.
        self.median_offset_us = ema_i64(
            self.median_offset_us,
            sample.value_us,
            self.cfg.offset_ema_alpha,
        );
        if self.warm_confirmations >= self.cfg.warm_start_min_samples {
            self.phase = Phase::Valid;
            self.last_update_ms = now_ms;
            self.prev_sample = Some((sample.value_us, now_ms));
            self.cache
                .store(self.median_offset_us, self.drift_us_per_ms, now_ms);
            info!(
                median_us = self.median_offset_us,
                confirmations = self.warm_confirmations,
                "clock sync valid (warm start)"
            );
        }
    }

    /// Maintenance: EMA the offset, measure drift, refresh the cache.
    fn maintain(&mut self, sample: OffsetSample, now_ms: u64) {
        self.median_offset_us = ema_i64(
            self.median_offset_us,
            sample.value_us,
            self.cfg.offset_ema_alpha,
        );

        match self.prev_sample {
            Some((prev_value, prev_ms)) => {
                let elapsed_ms = now_ms.saturating_sub(prev_ms);
                if elapsed_ms >= DRIFT_MIN_ELAPSED_MS {
                    let measured = (sample.value_us - prev_value) as f32 / elapsed_ms as f32;
                    let clamped = measured.clamp(-MAX_DRIFT_MEASUREMENT, MAX_DRIFT_MEASUREMENT);
                    self.drift_us_per_ms = self.cfg.drift_ema_alpha * clamped
                        + (1.0 - self.cfg.drift_ema_alpha) * self.drift_us_per_ms;
                    self.prev_sample = Some((sample.value_us, now_ms));
                }
            }
            None => self.prev_sample = Some((sample.value_us, now_ms)),
        }

        self.last_update_ms = now_ms;
        self.cache
            .store(self.median_offset_us, self.drift_us_per_ms, now_ms);
    }

    /// Whether the offset is trustworthy for scheduling.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.phase == Phase::Valid
    }

    /// Effective offset at `now_ms`: the maintained offset plus drift
    /// projection. Drift is applied under the tighter cap — BLE
    /// anomalies may legitimately *measure* above crystal drift, but
    /// the correction never exceeds it — and projection stops
    /// extrapolating past the cap.
    pub fn corrected_offset(&self, now_ms: u64) -> i64 {
        let drift = self
            .drift_us_per_ms
            .clamp(-MAX_DRIFT_APPLIED, MAX_DRIFT_APPLIED);
        let elapsed_ms = now_ms
            .saturating_sub(self.last_update_ms)
            .min(PROJECTION_CAP_MS);
        self.median_offset_us + (drift * elapsed_ms as f32) as i64
    }

    /// Transient disconnect: the window clears, the cache survives.
    pub fn on_disconnect(&mut self) {
        self.window.clear();
        self.pending = None;
        self.prev_sample = None;
        self.warm_confirmations = 0;
        self.phase = Phase::Cold;
        debug!("sync window cleared on disconnect");
    }

    /// Reconnect: enter warm start when the cache is still live.
    pub fn on_reconnect(&mut self, now_ms: u64) {
        match self
            .cache
            .projection(now_ms, self.cfg.warm_start_validity_ms)
        {
            Some((projected, drift)) => {
                self.median_offset_us = projected;
                self.warm_projection_us = projected;
                self.drift_us_per_ms = drift;
                self.warm_confirmations = 0;
                self.phase = Phase::Warm;
                info!(projected_us = projected, "warm start from cached offset");
            }
            None => {
                self.phase = Phase::Cold;
                debug!("cache expired or invalid, cold start");
            }
        }
    }

    /// Full reset of the estimator. The warm-start cache deliberately
    /// survives; clear it with [`SyncEngine::invalidate_cache`].
    pub fn reset(&mut self) {
        self.on_disconnect();
        self.median_offset_us = 0;
        self.drift_us_per_ms = 0.0;
        self.last_update_ms = 0;
        self.accepted = 0;
        self.rejected = 0;
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    pub fn stats(&self, now_ms: u64) -> SyncStats {
        SyncStats {
            valid: self.is_valid(),
            warm_start: self.phase == Phase::Warm,
            window_len: self.window.len(),
            median_offset_us: self.median_offset_us,
            drift_us_per_ms: self.drift_us_per_ms,
            accepted: self.accepted,
            rejected: self.rejected,
            cache_valid: self.cache.is_valid(),
            cache_age_ms: self.cache.age_ms(now_ms),
            last_update_ms: self.last_update_ms,
        }
    }

    /// One-line status for the console.
    pub fn status_line(&self) -> String {
        format!(
            "Valid: {}, samples: {}, median: {} us",
            if self.is_valid() { "YES" } else { "NO" },
            self.window.len(),
            self.median_offset_us
        )
    }
}

fn ema_i64(current: i64, sample: i64, alpha: f32) -> i64 {
    (alpha as f64 * sample as f64 + (1.0 - alpha as f64) * current as f64).round() as i64
}

/// Median with the usual midpoint average for even counts.
fn median_i64(values: &mut [i64]) -> i64 {
    debug_assert!(!values.is_empty());
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SyncEngine {
        SyncEngine::new(SyncConfig::default())
    }

    /// Feed one ping/pong pair producing exactly `offset_us` with a
    /// healthy RTT.
    fn feed_sample(e: &mut SyncEngine, seq: u32, offset_us: i64, now_ms: u64) {
        let t1 = now_ms * 1_000;
        let t2 = (t1 as i64 + offset_us + 6_000) as u64;
        let t3 = t2 + 100;
        let t4 = t1 + 12_100;
        e.begin_ping(seq, t1);
        e.on_pong(seq, t2, t3, t4, now_ms);
    }

    #[test]
    fn cold_sync_five_identical_samples() {
        let mut e = engine();
        for i in 0..5u32 {
            // Mirrors the keepalive cadence: one probe per second.
            let now_ms = 1_000 * (i as u64 + 1);
            let t1 = 10_000 + 1_000_000 * i as u64;
            let t2 = t1 + 2_000;
            let t3 = t2 + 100;
            let t4 = t1 + 12_000;
            e.begin_ping(i, t1);
            let sample = e.on_pong(i, t2, t3, t4, now_ms);
            let sample = sample.expect("sample accepted");
            assert_eq!(sample.offset_us, -3_950);
            assert_eq!(sample.rtt_us, 11_900);
        }
        assert!(e.is_valid());
        assert_eq!(e.status_line(), "Valid: YES, samples: 5, median: -3950 us");
    }

    #[test]
    fn not_valid_below_quorum() {
        let mut e = engine();
        for i in 0..4u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        assert!(!e.is_valid());
    }

    #[test]
    fn mad_filter_removes_outlier() {
        let mut e = engine();
        let offsets = [-4_000, -3_950, -4_100, -3_900, 12_000, -4_050];
        for (i, off) in offsets.iter().enumerate() {
            feed_sample(&mut e, i as u32, *off, 1_000 * (i as u64 + 1));
        }
        assert!(e.is_valid());
        // Median of the five survivors.
        assert_eq!(e.stats(6_000).median_offset_us, -4_000);
    }

    #[test]
    fn rtt_at_threshold_is_rejected() {
        let mut e = engine();
        let t1 = 1_000_000u64;
        // rtt = (t4 - t1) - (t3 - t2) = exactly 60 ms.
        e.begin_ping(1, t1);
        let out = e.on_pong(1, t1 + 1_000, t1 + 1_000, t1 + 60_000, 1_000);
        assert!(out.is_none());
        assert_eq!(e.stats(1_000).rejected, 1);

        // One microsecond under the bound is accepted.
        e.begin_ping(2, t1);
        let out = e.on_pong(2, t1 + 1_000, t1 + 1_000, t1 + 59_999, 1_000);
        assert!(out.is_some());
    }

    #[test]
    fn offset_at_limit_is_rejected() {
        let mut e = engine();
        let t1 = 1_000_000u64;
        // Symmetric timestamps → offset = t2 - t1 when t3 - t4 = t2 - t1.
        let t2 = t1 + 35_000_000;
        let t4 = t1 + 10_000;
        let t3 = t4 as i64 + 35_000_000;
        e.begin_ping(1, t1);
        assert!(e.on_pong(1, t2, t3 as u64, t4, 1_000).is_none());
        assert_eq!(e.stats(1_000).rejected, 1);
    }

    #[test]
    fn pong_for_unknown_sequence_is_discarded() {
        let mut e = engine();
        e.begin_ping(5, 1_000);
        assert!(e.on_pong(6, 2_000, 2_100, 13_000, 1).is_none());
        // The original probe is still outstanding.
        assert!(e.on_pong(5, 2_000, 2_100, 13_000, 1).is_some());
    }

    #[test]
    fn out_of_order_timestamps_do_not_consume() {
        let mut e = engine();
        e.begin_ping(1, 1_000);
        assert!(e.on_pong(1, 2_100, 2_000, 13_000, 1).is_none());
        assert_eq!(e.stats(1).accepted, 0);
        assert_eq!(e.stats(1).rejected, 0);
    }

    #[test]
    fn warm_start_confirms_after_three() {
        let mut e = engine();
        // Establish validity, then drop the link at 20 s.
        for i in 0..5u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        assert!(e.is_valid());
        // Drive the cache to a known snapshot.
        e.cache.store(-4_000, 0.02, 20_000);
        e.on_disconnect();
        assert!(!e.is_valid());

        // Reconnect at 23 s: projection = -4000 + 0.02 * 3000 = -3940.
        e.on_reconnect(23_000);
        for (i, off) in [-3_938i64, -3_945, -3_942].iter().enumerate() {
            feed_sample(&mut e, 100 + i as u32, *off, 23_000 + i as u64 * 1_000);
            if i < 2 {
                assert!(!e.is_valid(), "valid before third confirmation");
            }
        }
        assert!(e.is_valid());
    }

    #[test]
    fn warm_start_aborts_on_divergence() {
        let mut e = engine();
        for i in 0..5u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        e.cache.store(-4_000, 0.02, 20_000);
        e.on_disconnect();
        e.on_reconnect(23_000);

        // +2000 deviates ~5940 µs from the -3940 projection.
        feed_sample(&mut e, 100, 2_000, 23_000);
        assert!(!e.is_valid());
        let stats = e.stats(23_000);
        assert!(!stats.cache_valid, "cache must be invalidated on abort");
        assert!(!stats.warm_start, "must fall back to cold start");
    }

    #[test]
    fn warm_start_expired_cache_goes_cold() {
        let mut e = engine();
        e.cache.store(-4_000, 0.0, 20_000);
        e.on_disconnect();
        e.on_reconnect(35_000); // exactly 15 s later → expired
        assert!(!e.stats(35_000).warm_start);
    }

    #[test]
    fn corrected_offset_projects_and_caps() {
        let mut e = engine();
        for i in 0..5u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        let base_ms = e.stats(0).last_update_ms;
        e.drift_us_per_ms = 0.05;
        let at_rest = e.corrected_offset(base_ms);
        // Monotone while no sample arrives (R3).
        let later = e.corrected_offset(base_ms + 4_000);
        assert_eq!(later - at_rest, 200); // 0.05 µs/ms * 4000 ms
        // Projection stops growing past the cap.
        let capped = e.corrected_offset(base_ms + 50_000);
        assert_eq!(capped - at_rest, 500); // 0.05 * 10_000
    }

    #[test]
    fn applied_drift_is_clamped_tighter_than_measured() {
        let mut e = engine();
        for i in 0..5u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        let base_ms = e.stats(0).last_update_ms;
        e.drift_us_per_ms = 0.14; // legal measurement, above the applied cap
        let delta = e.corrected_offset(base_ms + 1_000) - e.corrected_offset(base_ms);
        assert_eq!(delta, 100); // 0.10 µs/ms * 1000 ms
    }

    #[test]
    fn reset_preserves_cache() {
        let mut e = engine();
        for i in 0..5u32 {
            feed_sample(&mut e, i, -4_000, 1_000 * (i as u64 + 1));
        }
        assert!(e.stats(5_000).cache_valid);
        e.reset();
        assert!(!e.is_valid());
        assert!(e.stats(5_000).cache_valid, "reset must not clear the cache");
        e.invalidate_cache();
        assert!(!e.stats(5_000).cache_valid);
    }
}
