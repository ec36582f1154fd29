//! Configuration loading and validation.
//!
//! A [`NodeConfig`] aggregates the `[shared]`, `[sync]`, `[timing]`,
//! and `[session]` TOML tables. Every field has a serde default drawn
//! from [`crate::consts`], so an empty file is a valid configuration;
//! `validate()` then checks cross-field consistency.

use crate::consts;
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Log level for configuration.
///
/// Serializes to lowercase strings: "trace", "debug", "info", "warn", "error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for a tracing env-filter.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Common fields shared across both device roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    pub log_level: LogLevel,
    /// Boot-time role; the persisted settings record overrides this.
    pub role: Role,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            role: Role::Primary,
        }
    }
}

/// Clock synchronization tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Samples with RTT at or above this are rejected [µs].
    pub rtt_quality_threshold_us: u32,
    /// Offsets at or beyond this magnitude are rejected [µs].
    pub max_offset_us: i64,
    /// Filtered samples required to declare sync valid from cold.
    pub min_valid_samples: usize,
    /// Warm-start cache validity [ms].
    pub warm_start_validity_ms: u64,
    /// Warm-start confirmations required.
    pub warm_start_min_samples: u8,
    /// Warm-start confirmation tolerance [µs].
    pub warm_start_tolerance_us: i64,
    /// Maintained-offset EMA factor.
    pub offset_ema_alpha: f32,
    /// Drift-rate EMA factor.
    pub drift_ema_alpha: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rtt_quality_threshold_us: consts::RTT_QUALITY_THRESHOLD_US,
            max_offset_us: consts::MAX_OFFSET_US,
            min_valid_samples: consts::MIN_VALID_SAMPLES,
            warm_start_validity_ms: consts::WARM_START_VALIDITY_MS,
            warm_start_min_samples: consts::WARM_START_MIN_SAMPLES,
            warm_start_tolerance_us: consts::WARM_START_TOLERANCE_US,
            offset_ema_alpha: consts::OFFSET_EMA_ALPHA,
            drift_ema_alpha: consts::DRIFT_EMA_ALPHA,
        }
    }
}

/// Scheduling and liveness timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    /// Seed for the lead-time estimator [µs]. Sits below
    /// `lead_time_min_us`; the floor always wins (kept as configured
    /// until the clamp is relaxed).
    pub lead_time_initial_us: u64,
    pub lead_time_min_us: u64,
    pub lead_time_max_us: u64,
    pub report_interval_ms: u64,
    /// SCHED_FIFO priority for the motor task (rt builds only).
    pub rt_priority: i32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: consts::KEEPALIVE_INTERVAL_MS,
            keepalive_timeout_ms: consts::KEEPALIVE_TIMEOUT_MS,
            batch_timeout_ms: consts::BATCH_TIMEOUT_MS,
            lead_time_initial_us: consts::INITIAL_LEAD_TIME_US,
            lead_time_min_us: consts::LEAD_TIME_MIN_US,
            lead_time_max_us: consts::LEAD_TIME_MAX_US,
            report_interval_ms: consts::REPORT_INTERVAL_MS,
            rt_priority: 80,
        }
    }
}

/// Session supervision windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// SECONDARY auto-start window after boot [ms].
    pub startup_window_ms: u64,
    /// Auto-start retry cadence [ms].
    pub auto_start_retry_ms: u64,
    /// Retries stop (and a pending start proceeds degraded) after [ms].
    pub auto_start_retry_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup_window_ms: consts::STARTUP_WINDOW_MS,
            auto_start_retry_ms: consts::AUTO_START_RETRY_MS,
            auto_start_retry_window_ms: consts::AUTO_START_RETRY_WINDOW_MS,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub shared: SharedConfig,
    pub sync: SyncConfig,
    pub timing: TimingConfig,
    pub session: SessionConfig,
}

impl NodeConfig {
    /// Parse from a TOML string and validate.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(s).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file path and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound)?;
        Self::from_toml(&text)
    }

    /// Cross-field consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.keepalive_interval_ms >= self.timing.keepalive_timeout_ms {
            return Err(ConfigError::ValidationError(
                "keepalive_interval_ms must be below keepalive_timeout_ms".to_string(),
            ));
        }
        if self.timing.lead_time_min_us > self.timing.lead_time_max_us {
            return Err(ConfigError::ValidationError(
                "lead_time_min_us must not exceed lead_time_max_us".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sync.offset_ema_alpha)
            || !(0.0..=1.0).contains(&self.sync.drift_ema_alpha)
        {
            return Err(ConfigError::ValidationError(
                "EMA factors must lie in [0, 1]".to_string(),
            ));
        }
        if self.sync.min_valid_samples == 0
            || self.sync.min_valid_samples > consts::OFFSET_WINDOW
        {
            return Err(ConfigError::ValidationError(format!(
                "min_valid_samples must lie in 1..={}",
                consts::OFFSET_WINDOW
            )));
        }
        if self.session.auto_start_retry_ms == 0 {
            return Err(ConfigError::ValidationError(
                "auto_start_retry_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.shared.role, Role::Primary);
        assert_eq!(config.sync.min_valid_samples, 5);
        assert_eq!(config.timing.lead_time_min_us, 70_000);
        assert_eq!(config.session.startup_window_ms, 30_000);
    }

    #[test]
    fn partial_tables_override_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            [shared]
            role = "SECONDARY"
            log_level = "debug"

            [timing]
            keepalive_timeout_ms = 8000
            "#,
        )
        .unwrap();
        assert_eq!(config.shared.role, Role::Secondary);
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.timing.keepalive_timeout_ms, 8_000);
        // Untouched tables keep defaults.
        assert_eq!(config.sync.rtt_quality_threshold_us, 60_000);
    }

    #[test]
    fn rejects_inverted_keepalive() {
        let err = NodeConfig::from_toml(
            r#"
            [timing]
            keepalive_interval_ms = 9000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn rejects_bad_ema_factor() {
        let err = NodeConfig::from_toml(
            r#"
            [sync]
            offset_ema_alpha = 1.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn initial_lead_time_default_below_floor_is_accepted() {
        // Deliberately valid: the estimator clamps it up at runtime.
        let config = NodeConfig::from_toml("").unwrap();
        assert!(config.timing.lead_time_initial_us < config.timing.lead_time_min_us);
    }
}
