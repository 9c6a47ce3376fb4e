//! Castle Server
//!
//! Loads a configuration, builds the system and runs it until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use castle::devices::{MessageBus, bridge_json_lines};
use castle::{CastleAcDc, SystemHandle};

/// Castle device automation server
#[derive(Parser, Debug)]
#[command(name = "castle")]
#[command(about = "Castle device automation server", long_about = None)]
struct Args {
    /// Path to the configuration file (.json or .toml)
    #[arg(short, long, default_value = "./castle.json")]
    config: PathBuf,

    /// Don't start any engine
    #[arg(long)]
    no_auto_start: bool,

    /// Validate the configuration, print the problems and exit
    #[arg(long)]
    check: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Feed the message bus from JSON lines on stdin, write control messages to stdout
    #[arg(long)]
    bus_stdio: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    // stdout carries bus messages when bridging
    let writer = if args.bus_stdio {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let fmt_layer = if args.json_logs {
        tracing_subscriber::fmt::layer().json().with_writer(writer).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_writer(writer).boxed()
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("castle=info")))
        .with(fmt_layer)
        .init();

    info!("Starting Castle v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from: {}", args.config.display());

    let bus = Arc::new(MessageBus::default());
    if args.bus_stdio {
        bus.attach_feeder();
    }
    let system = CastleAcDc::from_file_with_bus(&args.config, Arc::clone(&bus))
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.check {
        for e in system.errors() {
            println!("{e}");
        }
        system.disconnect().await;
        if system.is_valid() {
            println!("Configuration is valid");
            return Ok(());
        }
        anyhow::bail!("Configuration has {} error(s)", system.errors().len());
    }

    if args.bus_stdio {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::spawn(async move {
            if let Err(e) = bridge_json_lines(bus, reader, tokio::io::stdout()).await {
                error!("Message bus bridge failed: {}", e);
            }
        });
    }

    let handle =
        SystemHandle::new(system, Some(args.config.clone())).with_auto_start(!args.no_auto_start);
    match handle.auto_start().await {
        Ok(true) => info!("System running"),
        Ok(false) => info!("System built, engines not started"),
        Err(e) => warn!("System started with errors: {}", e),
    }

    let status = handle.current().await.status();
    for engine in &status.engines {
        info!(
            "  - {} ({}, running: {})",
            engine.key, engine.kind, engine.status.should_run
        );
    }

    shutdown_signal().await;

    info!("Shutting down...");
    if let Err(e) = handle.shutdown().await {
        error!("System did not shut down cleanly: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
