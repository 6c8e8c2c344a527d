//! # nodebus
//!
//! Runs a simulated lidar pipeline on the nodebus message bus: a scan
//! sensor, a pose estimator, a display process and a message monitor.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! nodebus
//!
//! # Run with a specific config file
//! nodebus --config /path/to/nodebus.toml
//!
//! # Override settings with environment variables
//! NODEBUS__NODES__RUN_FOR_SECS=30 NODEBUS__BUS__POLL_INTERVAL_MS=100 nodebus
//! ```

mod metrics;
mod nodes;
mod settings;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodebus=info,nodebus_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    // Children re-execute this binary; they stop here.
    let table = nodes::process_table();
    if nodebus_core::dispatch(&table).context("Process node failed")? {
        return Ok(());
    }

    let settings = match config_path() {
        Some(path) => settings::Settings::from_file(path)?,
        None => settings::Settings::load()?,
    };
    tracing::info!(
        poll_interval_ms = settings.bus.poll_interval_ms,
        run_for_secs = ?settings.nodes.run_for_secs,
        "Starting nodebus"
    );

    metrics::init_metrics();
    if settings.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(settings.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let stats = nodes::run(&settings, &table)?;
    tracing::info!(
        published = stats.published,
        delivered = stats.delivered,
        dropped = stats.dropped,
        relayed = stats.relayed,
        "nodebus stopped"
    );

    Ok(())
}

fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}
