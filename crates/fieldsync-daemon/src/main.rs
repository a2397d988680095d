//! fieldsync-daemon: headless host for the fieldsync engine.
//!
//! Runs the same engine as the browser build, with local storage in a data
//! directory and a directory-backed replica standing in for the cloud.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldsync_core::EngineEvent;
use fieldsync_daemon::{HostOptions, NativeHost, load_config};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the engine is driven (debounce deadlines, inbox, poll).
const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "fieldsync-daemon")]
#[command(about = "Local-first sync host for field inspection photo metadata")]
struct Args {
    /// Local storage directory
    #[arg(short, long, global = true, default_value = ".fieldsync")]
    data_dir: PathBuf,

    /// Shared replica directory
    #[arg(short, long, global = true, default_value = ".fieldsync-remote")]
    remote_dir: PathBuf,

    /// Owner account (generated and remembered if not provided)
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Project name (overrides the config file)
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the project and keep it in sync until Ctrl+C
    Run,
    /// Load the project and print its state as JSON
    Dump,
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::CollectionChanged { collection, origin } => {
            debug!("{} changed ({})", collection, origin);
        }
        EngineEvent::Flushed { collection } => {
            debug!("Flushed {}", collection);
        }
        EngineEvent::RemoteWriteFailed { collection, error } => {
            warn!("Remote write of {} failed: {}", collection, error);
        }
        EngineEvent::PollFailed { error } => {
            warn!("Poll failed: {}", error);
        }
        EngineEvent::SelectionDropped {
            instance_id,
            file_name,
            reason,
        } => {
            warn!("Dropped selection {} ({}): {}", instance_id, file_name, reason);
        }
        EngineEvent::StorageFailed { collection, error } => {
            error!("Local save of {} failed: {}", collection, error);
        }
    }
}

async fn run(mut host: NativeHost) -> Result<()> {
    let engine = host.engine_mut();
    let _events = engine.events().subscribe(log_event);

    match engine.load_all().await {
        Ok(report) => info!(
            "Loaded {} local collection(s), {} updated, {} URL(s) resolved",
            report.local.len(),
            report.updated.len(),
            report.urls_resolved
        ),
        Err(e) => warn!("Remote unavailable during load, continuing from local state: {}", e),
    }

    engine.start_background_sync();
    let mut interval = tokio::time::interval(TICK_INTERVAL);

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.background_tick().await;
                if let Some(poll) = report.poll {
                    debug!("Poll: {:?}", poll);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.stop_background_sync();
    engine.process_inbound();
    if let Err(e) = engine.save_all_now().await {
        error!("Final save failed: {}", e);
        return Err(e.into());
    }
    info!("Shutting down");
    Ok(())
}

async fn dump(mut host: NativeHost) -> Result<()> {
    let engine = host.engine_mut();
    if let Err(e) = engine.load_all().await {
        warn!("Remote unavailable, dumping local state: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(engine.snapshot())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,fieldsync_core=debug,fieldsync_daemon=debug"
    } else {
        "info,fieldsync_core=info,fieldsync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref(), args.project.as_deref())?;
    info!("Data dir: {:?}", args.data_dir);
    info!("Remote dir: {:?}", args.remote_dir);

    let options = HostOptions {
        data_dir: args.data_dir,
        remote_dir: args.remote_dir,
        owner: args.owner,
        config,
        watch: matches!(args.command, Command::Run),
    };
    let host = NativeHost::open(options)?;

    match args.command {
        Command::Run => run(host).await,
        Command::Dump => dump(host).await,
    }
}
