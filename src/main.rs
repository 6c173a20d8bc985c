//! Heater Hub daemon
//!
//! Starts the device listener and SMS receiver threads, then runs the hub
//! cycle until interrupted.

use anyhow::Context;
use clap::Parser;
use heater_hub::commands::CommandQueue;
use heater_hub::config::Config;
use heater_hub::connections::{ConnectionRegistry, DeviceListener};
use heater_hub::hub::Hub;
use heater_hub::messaging::{Messenger, SmsReceiver, SpoolMessenger};
use heater_hub::probes::{LinuxProbe, SystemProbe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Heating-control hub: serves heater modes, takes SMS commands
#[derive(Parser)]
#[command(name = "heater-hub")]
#[command(version, about = "Heating-control hub daemon")]
struct Cli {
    /// TCP port heater controllers connect to
    #[arg(long = "device-server-port", alias = "port")]
    device_server_port: Option<u16>,

    /// State file location
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// JSON config file overriding the defaults
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    run_daemon(&config)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => match Config::default_path().filter(|p| p.exists()) {
            Some(path) => {
                info!("Using config file {}", path.display());
                Config::from_file(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?
            }
            None => Config::default(),
        },
    };

    if let Some(port) = cli.device_server_port {
        config.device_port = port;
    }
    if let Some(path) = &cli.state_file {
        config.state_file = path.clone();
    }
    Ok(config)
}

fn run_daemon(config: &Config) -> anyhow::Result<()> {
    info!("Heater hub {} starting", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let spool = SpoolMessenger::new(config);
    match spool.clean_outgoing() {
        Ok(0) => {}
        Ok(n) => info!("Removed {} stale outgoing SMS", n),
        Err(e) => warn!("Could not clean outgoing SMS spool: {}", e),
    }
    let messenger: Arc<dyn Messenger> = Arc::new(spool);
    let probe: Arc<dyn SystemProbe> = Arc::new(LinuxProbe::new(config));

    let registry = ConnectionRegistry::new();
    let queue = CommandQueue::new();

    let listener = DeviceListener::bind(config.device_port)
        .with_context(|| format!("binding device server on port {}", config.device_port))?;
    let listener_thread = listener.spawn(registry.clone(), Arc::clone(&running));

    let receiver_thread = match SmsReceiver::new(config).spawn(queue.clone(), Arc::clone(&running)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(
                "Could not watch {}: {}. SMS commands disabled",
                config.sms_incoming_dir.display(),
                e
            );
            None
        }
    };

    let mut hub = Hub::new(config, registry.clone(), queue, messenger, probe);
    let cycle = Duration::from_millis(config.cycle_interval_ms);

    // Main loop
    while running.load(Ordering::Relaxed) {
        hub.process();
        std::thread::sleep(cycle);
    }

    if listener_thread.join().is_err() {
        error!("Device server thread panicked");
    }
    if let Some(handle) = receiver_thread {
        if handle.join().is_err() {
            error!("SMS receiver thread panicked");
        }
    }
    registry.close_all();

    info!("Heater hub stopped");
    Ok(())
}
