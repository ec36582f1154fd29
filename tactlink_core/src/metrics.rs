//! Latency metrics.
//!
//! Toggleable at runtime. When enabled, every executed event records
//! its drift (`now_after_io − scheduled_time`) and every PONG its
//! RTT. When disabled, each recording call is a single branch that
//! returns immediately.

use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use tact::consts::LATE_THRESHOLD_US;
use tracing::trace;

/// Runtime metrics mode, as driven by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsMode {
    Off,
    On,
    /// Per-event trace logging on top of the aggregates.
    Verbose,
}

#[derive(Debug, Clone, Copy)]
struct ExecAgg {
    count: u64,
    min_us: i64,
    max_us: i64,
    sum_us: i64,
    late: u64,
    early: u64,
}

impl ExecAgg {
    const fn new() -> Self {
        Self {
            count: 0,
            min_us: i64::MAX,
            max_us: i64::MIN,
            sum_us: 0,
            late: 0,
            early: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RttAgg {
    count: u64,
    min_us: u32,
    max_us: u32,
    sum_us: u64,
}

impl RttAgg {
    const fn new() -> Self {
        Self {
            count: 0,
            min_us: u32::MAX,
            max_us: 0,
            sum_us: 0,
        }
    }
}

struct Inner {
    exec: ExecAgg,
    rtt: RttAgg,
    last_report_ms: u64,
}

pub struct LatencyMetrics {
    enabled: AtomicBool,
    verbose: AtomicBool,
    report_interval_ms: u64,
    inner: Mutex<Inner>,
}

impl LatencyMetrics {
    pub fn new(report_interval_ms: u64) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            report_interval_ms,
            inner: Mutex::new(Inner {
                exec: ExecAgg::new(),
                rtt: RttAgg::new(),
                last_report_ms: 0,
            }),
        }
    }

    pub fn set_mode(&self, mode: MetricsMode) {
        self.enabled
            .store(mode != MetricsMode::Off, Ordering::Release);
        self.verbose
            .store(mode == MetricsMode::Verbose, Ordering::Release);
    }

    pub fn mode(&self) -> MetricsMode {
        if !self.enabled.load(Ordering::Acquire) {
            MetricsMode::Off
        } else if self.verbose.load(Ordering::Acquire) {
            MetricsMode::Verbose
        } else {
            MetricsMode::On
        }
    }

    /// Record one execution drift sample. Sampled *after* the actuator
    /// I/O, because that I/O is the long pole.
    #[inline]
    pub fn record_execution(&self, drift_us: i64) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if self.verbose.load(Ordering::Relaxed) {
            trace!(drift_us, "event executed");
        }
        let mut inner = self.inner.lock();
        let exec = &mut inner.exec;
        exec.count += 1;
        exec.min_us = exec.min_us.min(drift_us);
        exec.max_us = exec.max_us.max(drift_us);
        exec.sum_us += drift_us;
        if drift_us > LATE_THRESHOLD_US {
            exec.late += 1;
        }
        if drift_us < 0 {
            exec.early += 1;
        }
    }

    /// Record one keepalive round-trip.
    #[inline]
    pub fn record_rtt(&self, rtt_us: u32) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock();
        let rtt = &mut inner.rtt;
        rtt.count += 1;
        rtt.min_us = rtt.min_us.min(rtt_us);
        rtt.max_us = rtt.max_us.max(rtt_us);
        rtt.sum_us += rtt_us as u64;
    }

    /// Zero all aggregates.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.exec = ExecAgg::new();
        inner.rtt = RttAgg::new();
    }

    /// Textual report with all aggregates and a confidence grade
    /// derived from the RTT spread.
    pub fn report(&self) -> String {
        let inner = self.inner.lock();
        let exec = inner.exec;
        let rtt = inner.rtt;

        let exec_part = if exec.count == 0 {
            "events=0".to_string()
        } else {
            format!(
                "events={} drift min/avg/max={}/{}/{} us late={} early={}",
                exec.count,
                exec.min_us,
                exec.sum_us / exec.count as i64,
                exec.max_us,
                exec.late,
                exec.early
            )
        };
        let rtt_part = if rtt.count == 0 {
            "rtt n=0".to_string()
        } else {
            format!(
                "rtt n={} min/avg/max={}/{}/{} us",
                rtt.count,
                rtt.min_us,
                rtt.sum_us / rtt.count,
                rtt.max_us
            )
        };
        format!(
            "{exec_part} | {rtt_part} | confidence: {}",
            confidence(&rtt)
        )
    }

    /// Emit the periodic report when the interval has elapsed.
    pub fn maybe_report(&self, now_ms: u64) -> Option<String> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        {
            let mut inner = self.inner.lock();
            if now_ms.saturating_sub(inner.last_report_ms) < self.report_interval_ms {
                return None;
            }
            inner.last_report_ms = now_ms;
        }
        Some(self.report())
    }
}

/// Confidence grade from RTT spread: a narrow spread means the
/// four-timestamp samples were taken under comparable link conditions.
fn confidence(rtt: &RttAgg) -> &'static str {
    if rtt.count == 0 {
        return "LOW";
    }
    let spread = rtt.max_us - rtt.min_us;
    if spread < 10_000 {
        "HIGH"
    } else if spread < 20_000 {
        "MEDIUM"
    } else {
        "LOW"
    }
}
