//! `cbusd` - C-Bus PCI daemon.
//!
//! Connects to a PCI over TCP or serial, keeps the link alive, answers
//! clock requests, resynchronises group state, and logs every network event.
//! A home-automation bridge links against the `cbus` library and consumes
//! the same engine surface this binary exercises.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! transport failure after the reconnect cap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};

use cbus::config::Config;
use cbus::pci::{Engine, EngineExit, Event};
use cbus::telemetry::{self, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(
    name = "cbusd",
    version,
    about = "C-Bus PCI daemon",
    arg_required_else_help = false
)]
struct Cli {
    /// Device node that the PCI is connected to (example: /dev/ttyUSB0).
    #[arg(short = 's', long, value_name = "DEVICE", conflicts_with = "tcp")]
    serial: Option<String>,

    /// IP address and TCP port of a CNI or networked PCI
    /// (example: 192.0.2.1:10001).
    #[arg(short = 't', long, value_name = "ADDR:PORT")]
    tcp: Option<String>,

    /// Config file path. Settings are also read from CBUSD_* environment
    /// variables; flags override both.
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Send time broadcasts every n seconds (0 disables).
    #[arg(short = 'T', long, value_name = "SECONDS")]
    timesync: Option<u64>,

    /// Do not answer clock request SALs with the system time.
    #[arg(short = 'C', long, default_value_t = false)]
    no_clock: bool,

    /// Request status sweeps every n seconds to keep cached group levels
    /// honest (0 disables).
    #[arg(short = 'S', long, value_name = "SECONDS")]
    status_resync: Option<u64>,

    /// Append logs to this file as well as stderr.
    #[arg(short = 'l', long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Errors only.
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_or_default(path),
        None => Config::default(),
    };
    config.apply_env_overrides();
    apply_cli_overrides(&mut config, &cli);

    let verbosity = if cli.quiet { 0 } else { 1 + cli.verbose };
    let _telemetry_guard = telemetry::init(TelemetryConfig::new(verbosity, &config.logging));

    match run(config) {
        Ok(EngineExit::Closed) => {}
        Ok(EngineExit::ReconnectExhausted) => {
            tracing::error!("giving up on the PCI after the reconnect cap");
            std::process::exit(2);
        }
        Err(err) => {
            tracing::error!("fatal: {err}");
            std::process::exit(1);
        }
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(tcp) = &cli.tcp {
        config.pci.tcp = Some(tcp.clone());
        config.pci.serial = None;
    }
    if let Some(serial) = &cli.serial {
        config.pci.serial = Some(serial.clone());
        config.pci.tcp = None;
    }
    if let Some(secs) = cli.timesync {
        config.timesync.interval_secs = secs;
    }
    if cli.no_clock {
        config.timesync.answer_requests = false;
    }
    if let Some(secs) = cli.status_resync {
        config.resync.interval_secs = secs;
    }
    if let Some(path) = &cli.log_file {
        config.logging.file = Some(path.clone());
    }
}

fn run(config: Config) -> cbus::Result<EngineExit> {
    let connector = config.connector()?;
    let (handle, events, groups, join) = Engine::spawn(connector, config.engine_options());

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown signal received");
            handle.close();
            break;
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => log_event(&event, &groups),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            // Engine thread exited on its own (reconnect cap).
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let exit = join.join().unwrap_or_else(|_| {
        tracing::error!("engine thread panicked");
        EngineExit::Closed
    });
    Ok(exit)
}

fn log_event(event: &Event, groups: &cbus::pci::GroupDb) {
    match event {
        Event::Connected => tracing::info!("PCI connected"),
        Event::Disconnected { reason } => tracing::warn!(?reason, "PCI disconnected"),
        Event::LightingOn {
            source_address,
            application,
            group,
        } => tracing::info!(source_address, application, group, "light on"),
        Event::LightingOff {
            source_address,
            application,
            group,
        } => tracing::info!(source_address, application, group, "light off"),
        Event::LightingRamp {
            source_address,
            application,
            group,
            level,
            duration,
        } => tracing::info!(
            source_address,
            application,
            group,
            level,
            duration_secs = duration,
            "light ramp"
        ),
        Event::LightingTerminateRamp {
            source_address,
            application,
            group,
        } => tracing::info!(source_address, application, group, "ramp terminated"),
        Event::ClockUpdate {
            source_address,
            update,
        } => tracing::debug!(source_address, ?update, "clock update"),
        Event::ClockRequest { source_address } => {
            tracing::debug!(source_address, "clock request")
        }
        Event::Temperature {
            source_address,
            group,
            degrees,
        } => tracing::info!(source_address, group, degrees, "temperature broadcast"),
        Event::LevelReport {
            application,
            block_start,
            changed,
            ..
        } => tracing::debug!(
            application,
            block_start,
            changed = changed.iter().filter(|&&c| c).count(),
            known_groups = groups.len(),
            "level report"
        ),
        Event::CommandAbandoned { op } => tracing::warn!(?op, "command abandoned"),
    }
}
