//! buslinkd - Bus Coordinator Daemon
//!
//! Runs the coordinator loop on a serial bus:
//! - Address assignment for announcing devices
//! - Frame decoding, control dispatch, poll tracking
//! - Periodic framing-health reporting

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use buslink::{AppConfig, SerialLink, Server};

/// Buslink coordinator daemon
#[derive(Parser, Debug)]
#[command(
    name = "buslinkd",
    version,
    about = "Multi-drop serial bus coordinator",
    long_about = None
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "buslink.toml")]
    config: PathBuf,

    /// Serial port override
    #[arg(long)]
    port: Option<String>,

    /// Baud rate override
    #[arg(long)]
    baud: Option<u32>,

    /// Seconds between framing-health reports
    #[arg(long, default_value_t = 60)]
    health_interval: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .init();

    tracing::info!("Starting buslinkd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", args.config.display()))?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }

    let link = SerialLink::open(&config.serial)
        .with_context(|| format!("failed to open serial port {}", config.serial.port))?;
    let server = Server::new(Box::new(link), &config.coordinator);
    tracing::info!(
        port = %config.serial.port,
        baud = config.serial.baud_rate,
        server_id = server.id(),
        "coordinator online"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    tokio::select! {
        result = server.run(cancel.clone()) => {
            result.context("coordinator loop failed")?;
        }
        () = report_health(&server, Duration::from_secs(args.health_interval)) => {}
    }

    tracing::info!("buslinkd stopped");
    Ok(())
}

/// Periodically read and reset the framing counters.
async fn report_health(server: &Server, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        let counters = server.reset_counters().await;
        if counters.err_crc > 0 || counters.err_frame > 0 {
            tracing::warn!(
                err_crc = counters.err_crc,
                err_frame = counters.err_frame,
                acks = counters.acks,
                "bus health degraded"
            );
        } else {
            tracing::debug!(acks = counters.acks, "bus healthy");
        }
    }
}
