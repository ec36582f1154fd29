//! Wrap-safe monotonic clock.
//!
//! The underlying counter is 32-bit microseconds and wraps roughly
//! every 71 minutes. [`MonotonicClock`] maintains a wrap counter and
//! composes `(overflows << 32) | raw` into a 64-bit, never-reset
//! timeline. Every read is serialized through a short critical
//! section: sample raw, compare with the last sample, increment the
//! overflow counter on decrease, store the sample, compose. This is
//! the only safe way to read the clock from both the radio-callback
//! context and the main/motor contexts; without it, concurrent
//! callers can observe a false wrap and jump the timeline by 2³² µs.
//!
//! 64-bit timestamps shared across contexts go through [`AtomicMicros`]
//! rather than ad hoc critical sections at call sites, so a 32-bit
//! target cannot tear a load between the high and low halves.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source consumed by every component as `Arc<dyn Clock>`.
///
/// The millisecond view derives from the same timeline as the
/// microsecond view, so both are monotone together.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary, never-reset origin.
    fn now_us(&self) -> u64;

    /// Milliseconds on the same timeline.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1_000
    }
}

/// Raw 32-bit microsecond counter underneath [`MonotonicClock`].
///
/// Production uses [`UptimeTicks`]; tests use [`ManualTicks`] to step
/// through wrap boundaries deterministically.
pub trait TickSource: Send + Sync {
    /// Current raw counter value. Wraps at `u32::MAX`.
    fn raw_ticks(&self) -> u32;
}

/// Process-uptime tick source (elapsed µs truncated to 32 bits).
pub struct UptimeTicks {
    origin: Instant,
}

impl UptimeTicks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for UptimeTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for UptimeTicks {
    fn raw_ticks(&self) -> u32 {
        self.origin.elapsed().as_micros() as u32
    }
}

/// Manually advanced tick source for tests.
pub struct ManualTicks {
    raw: AtomicU32,
}

impl ManualTicks {
    pub const fn new(start: u32) -> Self {
        Self {
            raw: AtomicU32::new(start),
        }
    }

    /// Advance the raw counter, wrapping like the hardware would.
    pub fn advance(&self, delta: u32) {
        self.raw.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: u32) {
        self.raw.store(value, Ordering::Relaxed);
    }
}

impl TickSource for ManualTicks {
    fn raw_ticks(&self) -> u32 {
        self.raw.load(Ordering::Relaxed)
    }
}

struct WrapState {
    last_raw: u32,
    overflows: u32,
}

/// Wrap-safe 64-bit composition over a 32-bit [`TickSource`].
pub struct MonotonicClock<S: TickSource> {
    source: S,
    state: Mutex<WrapState>,
}

impl<S: TickSource> MonotonicClock<S> {
    pub fn new(source: S) -> Self {
        let last_raw = source.raw_ticks();
        Self {
            source,
            state: Mutex::new(WrapState {
                last_raw,
                overflows: 0,
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: TickSource> Clock for MonotonicClock<S> {
    fn now_us(&self) -> u64 {
        // Critical section: sample, detect wrap, compose.
        let mut st = self.state.lock();
        let raw = self.source.raw_ticks();
        if raw < st.last_raw {
            st.overflows += 1;
        }
        st.last_raw = raw;
        ((st.overflows as u64) << 32) | raw as u64
    }
}

/// Directly settable 64-bit clock for tests that need absolute control.
pub struct ManualClock {
    us: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_us: u64) -> Self {
        Self {
            us: AtomicU64::new(start_us),
        }
    }

    pub fn advance_us(&self, delta: u64) {
        self.us.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, delta: u64) {
        self.advance_us(delta * 1_000);
    }

    pub fn set_us(&self, value: u64) {
        self.us.store(value, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.us.load(Ordering::Relaxed)
    }
}

// ─── Shared 64-bit timestamps ───────────────────────────────────────

/// Unsigned 64-bit microsecond timestamp shared across contexts.
pub struct AtomicMicros(AtomicU64);

impl AtomicMicros {
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }
}

/// Signed 64-bit microsecond offset shared across contexts.
pub struct AtomicOffset(AtomicI64);

impl AtomicOffset {
    pub const fn new(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    #[inline]
    pub fn load(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_raw_ticks() {
        let clock = MonotonicClock::new(ManualTicks::new(1_000));
        assert_eq!(clock.now_us(), 1_000);
        clock.source().advance(500);
        assert_eq!(clock.now_us(), 1_500);
        assert_eq!(clock.now_ms(), 1);
    }

    #[test]
    fn survives_counter_wrap() {
        let clock = MonotonicClock::new(ManualTicks::new(u32::MAX - 10));
        let before = clock.now_us();
        clock.source().advance(20); // wraps past u32::MAX
        let after = clock.now_us();
        assert!(after > before);
        assert_eq!(after - before, 20);
    }

    #[test]
    fn multiple_wraps_accumulate() {
        let ticks = ManualTicks::new(u32::MAX - 1);
        let clock = MonotonicClock::new(ticks);
        let mut prev = clock.now_us();
        for _ in 0..3 {
            clock.source().advance(u32::MAX / 2);
            let now = clock.now_us();
            assert!(now > prev, "timeline must never move backwards");
            prev = now;
        }
    }

    #[test]
    fn manual_clock_ms_view() {
        let clock = ManualClock::new(0);
        clock.advance_ms(42);
        assert_eq!(clock.now_us(), 42_000);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn atomic_micros_roundtrip() {
        let t = AtomicMicros::new(0);
        t.store(u64::MAX - 1);
        assert_eq!(t.load(), u64::MAX - 1);

        let o = AtomicOffset::new(0);
        o.store(-3_950);
        assert_eq!(o.load(), -3_950);
    }
}
