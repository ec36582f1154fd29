//! Serial/diagnostic console.
//!
//! One line per command; replies are human-readable text whose first
//! colon-delimited token is stable for machine consumers.

use crate::settings::Settings;
use std::path::Path;
use tactlink_core::engine::Engine;
use tactlink_core::metrics::MetricsMode;
use tracing::info;

/// Side effect the main loop must carry out after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    None,
    Reboot,
    FactoryReset,
}

/// Handle one console line. Returns the reply text and any follow-up
/// action for the main loop.
pub fn dispatch(
    line: &str,
    engine: &mut Engine,
    settings: &mut Settings,
    settings_path: &Path,
) -> (String, ConsoleAction) {
    let line = line.trim();
    let (cmd, arg) = match line.split_once(':') {
        Some((cmd, arg)) => (cmd, Some(arg)),
        None => (line, None),
    };

    let reply = match (cmd, arg) {
        ("SET_ROLE", Some(value)) => match value.parse() {
            Ok(role) => {
                settings.role = role;
                match settings.save(settings_path) {
                    Ok(()) => format!("ROLE: {role} (reboot to apply)"),
                    Err(err) => format!("ERR: {err}"),
                }
            }
            Err(err) => format!("ERR: {err}"),
        },
        ("GET_ROLE", None) => format!("ROLE: {}", engine.role()),
        ("SET_PROFILE", Some(name)) if !name.is_empty() => {
            settings.current_profile = name.to_string();
            match settings.save(settings_path) {
                Ok(()) => format!("PROFILE: {name}"),
                Err(err) => format!("ERR: {err}"),
            }
        }
        ("GET_PROFILE", None) => format!("PROFILE: {}", settings.current_profile),
        ("LATENCY_ON", None) => {
            engine.metrics().set_mode(MetricsMode::On);
            "LATENCY: ON".to_string()
        }
        ("LATENCY_ON_VERBOSE", None) => {
            engine.metrics().set_mode(MetricsMode::Verbose);
            "LATENCY: ON_VERBOSE".to_string()
        }
        ("LATENCY_OFF", None) => {
            engine.metrics().set_mode(MetricsMode::Off);
            "LATENCY: OFF".to_string()
        }
        ("GET_LATENCY", None) => format!("LATENCY: {}", engine.metrics().report()),
        ("RESET_LATENCY", None) => {
            engine.metrics().reset();
            "LATENCY: RESET".to_string()
        }
        ("GET_CLOCK_SYNC", None) => format!("CLOCK_SYNC: {}", engine.sync_status_line()),
        ("GET_SYNC_STATS", None) => {
            let s = engine.sync_stats();
            format!(
                "SYNC_STATS: valid={} warm={} window={} median={} us drift={:.4} us/ms \
                 accepted={} rejected={} cache_valid={} cache_age_ms={}",
                s.valid,
                s.warm_start,
                s.window_len,
                s.median_offset_us,
                s.drift_us_per_ms,
                s.accepted,
                s.rejected,
                s.cache_valid,
                s.cache_age_ms.map_or(-1i64, |a| a as i64),
            )
        }
        ("RESET_CLOCK_SYNC", None) => {
            engine.reset_clock_sync();
            "CLOCK_SYNC: RESET".to_string()
        }
        ("FACTORY_RESET", None) => {
            return ("FACTORY_RESET: OK".to_string(), ConsoleAction::FactoryReset);
        }
        ("REBOOT", None) => {
            return ("REBOOT: OK".to_string(), ConsoleAction::Reboot);
        }
        ("TEST", None) => {
            engine.test_pulse();
            "TEST: pulse sent".to_string()
        }
        ("STOP", None) => {
            engine.stop_session();
            "STOP: OK".to_string()
        }
        _ => {
            info!(line, "unknown console command");
            format!("ERR: unknown command {cmd:?}")
        }
    };
    (reply, ConsoleAction::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tact::clock::ManualClock;
    use tact::config::NodeConfig;
    use tact::role::Role;
    use tactlink_core::engine::EngineOptions;
    use tactlink_core::motor::SimActuator;
    use tactlink_core::radio::NullRadio;
    use tactlink_core::therapy::{PatternBatch, PatternSource};

    struct NoPattern;

    impl PatternSource for NoPattern {
        fn next_batch(&mut self) -> Option<PatternBatch> {
            None
        }
    }

    fn rig() -> (Engine, Settings, tempfile::TempDir) {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _port) = Engine::new(
            Role::Primary,
            NodeConfig::default(),
            clock,
            Box::new(NullRadio),
            Box::new(SimActuator::new()),
            Box::new(NoPattern),
            EngineOptions { spawn_motor: false },
        );
        (engine, Settings::default(), tempfile::tempdir().unwrap())
    }

    fn run(line: &str) -> (String, ConsoleAction) {
        let (mut engine, mut settings, dir) = rig();
        dispatch(line, &mut engine, &mut settings, &dir.path().join("s.toml"))
    }

    #[test]
    fn role_roundtrip_and_persistence() {
        let (mut engine, mut settings, dir) = rig();
        let path = dir.path().join("settings.toml");

        let (reply, _) = dispatch("SET_ROLE:SECONDARY", &mut engine, &mut settings, &path);
        assert!(reply.starts_with("ROLE: SECONDARY"));
        assert_eq!(Settings::load(&path).unwrap().role, Role::Secondary);

        let (reply, _) = dispatch("GET_ROLE", &mut engine, &mut settings, &path);
        assert_eq!(reply, "ROLE: PRIMARY"); // live role changes on reboot
    }

    #[test]
    fn latency_mode_toggles() {
        let (mut engine, mut settings, dir) = rig();
        let path = dir.path().join("s.toml");
        dispatch("LATENCY_ON", &mut engine, &mut settings, &path);
        assert_eq!(engine.metrics().mode(), MetricsMode::On);
        dispatch("LATENCY_ON_VERBOSE", &mut engine, &mut settings, &path);
        assert_eq!(engine.metrics().mode(), MetricsMode::Verbose);
        dispatch("LATENCY_OFF", &mut engine, &mut settings, &path);
        assert_eq!(engine.metrics().mode(), MetricsMode::Off);
    }

    #[test]
    fn clock_sync_status_has_stable_prefix() {
        let (reply, action) = run("GET_CLOCK_SYNC");
        assert!(reply.starts_with("CLOCK_SYNC: Valid: NO"), "{reply}");
        assert_eq!(action, ConsoleAction::None);
    }

    #[test]
    fn sync_stats_line() {
        let (reply, _) = run("GET_SYNC_STATS");
        assert!(reply.starts_with("SYNC_STATS: valid=false"), "{reply}");
        assert!(reply.contains("rejected=0"), "{reply}");
    }

    #[test]
    fn reboot_and_factory_reset_actions() {
        assert_eq!(run("REBOOT").1, ConsoleAction::Reboot);
        assert_eq!(run("FACTORY_RESET").1, ConsoleAction::FactoryReset);
        assert_eq!(run("GET_ROLE").1, ConsoleAction::None);
    }

    #[test]
    fn profile_persistence() {
        let (mut engine, mut settings, dir) = rig();
        let path = dir.path().join("s.toml");
        let (reply, _) = dispatch("SET_PROFILE:evening", &mut engine, &mut settings, &path);
        assert_eq!(reply, "PROFILE: evening");
        assert_eq!(
            Settings::load(&path).unwrap().current_profile,
            "evening"
        );
    }

    #[test]
    fn unknown_commands_report_err_token() {
        let (reply, _) = run("BOGUS:1");
        assert!(reply.starts_with("ERR:"), "{reply}");
    }
}
