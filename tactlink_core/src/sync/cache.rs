//! Warm-start cache.
//!
//! Captured on every successful maintenance update; consulted on
//! reconnect. Outlives a sync-engine reset — it is cleared only by
//! explicit invalidation or time expiry.

/// Cached offset + drift snapshot for warm restarts.
#[derive(Debug, Clone, Copy)]
pub struct WarmStartCache {
    offset_us: i64,
    drift_us_per_ms: f32,
    saved_at_ms: u64,
    valid: bool,
}

impl WarmStartCache {
    pub const fn new() -> Self {
        Self {
            offset_us: 0,
            drift_us_per_ms: 0.0,
            saved_at_ms: 0,
            valid: false,
        }
    }

    /// Refresh the snapshot (called after every maintenance update).
    pub fn store(&mut self, offset_us: i64, drift_us_per_ms: f32, now_ms: u64) {
        self.offset_us = offset_us;
        self.drift_us_per_ms = drift_us_per_ms;
        self.saved_at_ms = now_ms;
        self.valid = true;
    }

    /// Project the cached offset to `now_ms`, if the cache is still
    /// live. Expiry is inclusive: a cache exactly `validity_ms` old is
    /// rejected.
    pub fn projection(&self, now_ms: u64, validity_ms: u64) -> Option<(i64, f32)> {
        if !self.valid {
            return None;
        }
        let elapsed_ms = now_ms.saturating_sub(self.saved_at_ms);
        if elapsed_ms >= validity_ms {
            return None;
        }
        let projected = self.offset_us + (self.drift_us_per_ms * elapsed_ms as f32) as i64;
        Some((projected, self.drift_us_per_ms))
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Age of the snapshot, for diagnostics.
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        self.valid.then(|| now_ms.saturating_sub(self.saved_at_ms))
    }
}

impl Default for WarmStartCache {
    fn default() -> Self {
        Self::new()
    }
}
