//! CAN Assure - Main Entry Point
//!
//! Replays a CAN test vector against a device under test and records what the
//! device reports back.

use anyhow::{bail, Context, Result};
use can_assure::{
    backend::{load_sources, poll_once, Engine, EngineParts, TelemetryEvent, VectorStore},
    config::{self, AppConfig, ConfigStore},
    shutdown::{ShutdownCoordinator, ShutdownReason, FORCE_EXIT_CODE},
};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Scripted CAN test vector replay
#[derive(Parser, Debug)]
#[command(name = "can-assure", version)]
#[command(about = "Scripted CAN test vector replay with device state capture", long_about = None)]
struct Args {
    /// Bench configuration file (defaults to the app data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine and replay the test vector once
    Run {
        /// Use a simulated device, a recording bus and an always-up link
        #[arg(long)]
        dry_run: bool,

        /// Keep the heartbeat and poller running without replaying
        #[arg(long)]
        no_replay: bool,
    },
    /// Poll the device once and print its state
    Validate {
        /// Use a simulated device
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a sample configuration
    InitConfig {
        /// Where to write it
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Copy the vector store's time column into the delay list
    SyncDelays,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    tracing::info!("Starting CAN Assure v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::InitConfig { path, force } => init_config(&path, force),
        Command::Run { dry_run, no_replay } => run(&config_store(args.config)?, dry_run, no_replay),
        Command::Validate { dry_run } => validate(&config_store(args.config)?, dry_run),
        Command::SyncDelays => sync_delays(&config_store(args.config)?),
    }
}

/// Console logging plus a daily log file in the app data directory
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,can_assure=debug"))
    };

    let file = config::ensure_app_data_dir()
        .map(|dir| tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "can-assure.log")));

    match file {
        Ok((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer())
                .init();
            tracing::warn!("File logging disabled: {}", e);
            None
        }
    }
}

fn config_store(path: Option<PathBuf>) -> Result<Arc<ConfigStore>> {
    let path = match path {
        Some(path) => path,
        None => config::default_config_path().context("Could not determine app data directory")?,
    };
    if !path.exists() {
        bail!(
            "No configuration at {:?}; create one with `can-assure init-config {}`",
            path,
            path.display()
        );
    }
    Ok(Arc::new(ConfigStore::load(&path)?))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    AppConfig::sample().save(path)?;
    println!("Wrote sample configuration to {}", path.display());
    Ok(())
}

fn run(store: &Arc<ConfigStore>, dry_run: bool, no_replay: bool) -> Result<()> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.register_signals()?;

    let parts = EngineParts::from_config(store.clone(), dry_run)?;
    let (engine, telemetry) = Engine::new(parts);
    engine.start_background();

    if no_replay {
        println!("Heartbeat and poller running, press Enter or Ctrl+C to stop");
        let trigger = shutdown.clone();
        std::thread::Builder::new()
            .name("stdin-watch".into())
            .spawn(move || {
                let mut line = String::new();
                if std::io::stdin().lock().read_line(&mut line).is_ok() {
                    trigger.request_shutdown(ShutdownReason::UserRequest);
                }
            })?;
        shutdown.wait_for_shutdown();
        engine.shutdown();
        shutdown.stop_signal_listener();
        return Ok(());
    }

    if !engine.start_replay() {
        bail!("Replay could not be started");
    }

    let summary = engine.supervise_replay(&shutdown, &telemetry, |entry| match entry.event {
        TelemetryEvent::Tx { delay_ms, values } => {
            tracing::info!("TX {:>6} ms: {} signals", delay_ms, values.len());
        }
        TelemetryEvent::Rx { delay_ms, snapshot } => {
            let found = snapshot.iter().filter(|(_, v)| v.is_value()).count();
            tracing::info!("RX {:>6} ms: {}/{} values", delay_ms, found, snapshot.len());
        }
        TelemetryEvent::LinkStatus { interface, state } => {
            tracing::info!("Link {} is {}", interface, state);
        }
    });
    if shutdown.is_force_exit() {
        std::process::exit(FORCE_EXIT_CODE);
    }
    engine.shutdown();
    shutdown.stop_signal_listener();

    let Some(summary) = summary else {
        bail!("Replay thread ended without a summary");
    };
    println!(
        "Completed {}/{} cycles{}{}, results {}",
        summary.cycles_completed,
        summary.delays_total,
        if summary.delays_skipped > 0 {
            format!(" ({} skipped)", summary.delays_skipped)
        } else {
            String::new()
        },
        if summary.stopped { " (stopped)" } else { "" },
        if summary.saved { "saved" } else { "NOT saved" }
    );
    if let Some(error) = summary.error {
        bail!("Replay failed: {}", error);
    }
    Ok(())
}

fn validate(store: &Arc<ConfigStore>, dry_run: bool) -> Result<()> {
    let parts = EngineParts::from_config(store.clone(), dry_run)?;
    let (engine, _telemetry) = Engine::new(parts);

    let outcome = poll_once(engine.state(), &engine.state().timing());
    if !outcome.device_ok {
        println!("Device did not answer");
    }
    for (signal, value) in outcome.snapshot.iter() {
        println!("{:<40} {}", signal, value);
    }
    println!("{} signals tracked", outcome.tracked_signals);
    engine.shutdown();
    Ok(())
}

fn sync_delays(store: &Arc<ConfigStore>) -> Result<()> {
    let mut settings = store.snapshot().config.clone();
    if let Some(base) = store.path().and_then(Path::parent) {
        settings.resolve_paths(base);
    }
    let sources = load_sources(&settings)?;
    let delays = sources.store.read_delay_list()?;

    store.update(|cfg| cfg.delays = delays.clone())?;
    println!("Synced {} delays from {:?}", delays.len(), settings.vector_path);
    Ok(())
}
