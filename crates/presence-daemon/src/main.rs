//! Presence Daemon - Main entry point
//!
//! Runs the configured trackers and keeps the presence of home devices up
//! to date.

mod config;

use anyhow::Result;
use clap::Parser;
use presence_discovery::{BroadcastSink, EventSink, LogSink, Registry, TrackerFactories};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "presenced")]
#[command(about = "Home network device presence daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "presence.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the available trackers and exit
    #[arg(long)]
    list_trackers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the event stream, keep logs on stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let factories = TrackerFactories::builtin();
    if args.list_trackers {
        for name in factories.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    info!("presenced v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;
    let trackers = factories.build(&config.trackers)?;

    let sink: Arc<dyn EventSink> = if config.events.enabled {
        let sink = BroadcastSink::new(config.events.buffer);
        tokio::spawn(print_events(sink.subscribe()));
        Arc::new(sink)
    } else {
        Arc::new(LogSink)
    };

    let registry = Registry::new(config.devices, trackers, sink, config.presence);
    registry.start().await;

    shutdown_signal().await;
    registry.stop().await;

    Ok(())
}

/// Write every event as one JSON line on stdout
async fn print_events(mut events: broadcast::Receiver<presence_core::DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received termination signal, shutting down"),
    }
}
