//! TactLink device binary.
//!
//! Wires the engine to the host: CLI, logging, persisted settings,
//! the diagnostic console on stdin, and the main poll loop. The BLE
//! UART transport and the DRV2605 actuator driver are platform
//! collaborators; this binary boots with the simulation backend and
//! leaves the transport seam (`RadioPort`) to the platform layer.

mod console;
mod patterns;
mod settings;

use clap::Parser;
use console::ConsoleAction;
use patterns::CyclingPattern;
use settings::Settings;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tact::clock::{Clock, MonotonicClock, UptimeTicks};
use tact::config::{ConfigError, NodeConfig};
use tact::role::Role;
use tactlink_core::engine::{Engine, EngineOptions};
use tactlink_core::motor::SimActuator;
use tactlink_core::radio::NullRadio;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tactlink", about = "Bilateral haptic synchronization node")]
struct Args {
    /// Override the persisted role for this boot.
    #[arg(long)]
    role: Option<Role>,

    /// Configuration directory.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Settings file (defaults to <config_dir>/settings.toml).
    #[arg(long)]
    settings_file: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let settings_path = args
        .settings_file
        .unwrap_or_else(|| args.config_dir.join("settings.toml"));

    // Settings corruption is fatal: an unambiguous stop beats running
    // with a guessed role.
    let mut settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("fatal: {err}");
            return Err(err.into());
        }
    };
    let role = args.role.unwrap_or(settings.role);

    let config = match NodeConfig::load(&args.config_dir.join("config.toml")) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound) => NodeConfig::default(),
        Err(err) => return Err(err.into()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.shared.log_level.as_filter())
            }),
        )
        .with_target(false)
        .init();

    info!(%role, profile = %settings.current_profile, "starting TactLink node");

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new(UptimeTicks::new()));
    let (mut engine, _radio_port) = Engine::new(
        role,
        config,
        clock,
        Box::new(NullRadio),
        Box::new(SimActuator::new()),
        Box::new(CyclingPattern::default()),
        EngineOptions::default(),
    );

    // Console lines arrive on their own thread; the main loop stays
    // non-blocking.
    let (line_tx, line_rx) = std::sync::mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "console read failed");
                    break;
                }
            }
        }
    });

    loop {
        engine.poll();

        while let Ok(line) = line_rx.try_recv() {
            let (reply, action) =
                console::dispatch(&line, &mut engine, &mut settings, &settings_path);
            println!("{reply}");
            match action {
                ConsoleAction::Reboot => {
                    info!("reboot requested");
                    engine.shutdown();
                    return Ok(());
                }
                ConsoleAction::FactoryReset => {
                    let _ = std::fs::remove_file(&settings_path);
                    settings = Settings::default();
                    info!("settings restored to defaults");
                }
                ConsoleAction::None => {}
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }
}
