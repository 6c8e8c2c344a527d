//! Runner configuration.
//!
//! Sources, lowest priority first:
//! - `/etc/nodebus/nodebus.toml`
//! - `~/.config/nodebus/nodebus.toml`
//! - `nodebus.toml` in the working directory
//! - Environment variables (`NODEBUS__BUS__POLL_INTERVAL_MS=100`)
//!
//! Every file is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{builder::DefaultState, ConfigBuilder, Environment, File};
use anyhow::{Context, Result};
use nodebus_core::ManagerConfig;
use serde::{Deserialize, Serialize};

const CONFIG_PATHS: [&str; 3] = [
    "/etc/nodebus/nodebus.toml",
    "~/.config/nodebus/nodebus.toml",
    "nodebus.toml",
];

/// Runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bus timings and capacities.
    pub bus: BusSettings,

    /// Which nodes run and how.
    pub nodes: NodeSettings,

    /// Metrics configuration.
    pub metrics: MetricsSettings,
}

/// Bus timings and capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Poll interval of every wait that must observe exit flags.
    pub poll_interval_ms: u64,

    /// Capacity of the broker queue.
    pub broker_capacity: usize,

    /// Capacity of the process relay queue.
    pub relay_capacity: usize,

    /// Capacity of each node's inbound queue.
    pub inbound_capacity: usize,

    /// How long `publish` waits for room, in microseconds.
    pub publish_timeout_us: u64,

    /// How long to wait for the broker and relay to come up.
    pub startup_timeout_ms: u64,

    /// How long a child process has to connect.
    pub connect_timeout_ms: u64,

    /// How long nodes wait for subscription replies.
    pub ack_timeout_ms: u64,

    /// How long nodes and the runner wait at group checkpoints.
    pub checkpoint_timeout_ms: u64,
}

/// Node selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Run the message monitor.
    pub monitor: bool,

    /// Topics the monitor subscribes to.
    pub monitor_topics: Vec<String>,

    /// Run the simulated scan sensor.
    pub sensor: bool,

    /// Scans published per second.
    pub sensor_rate_hz: f64,

    /// Ranges per scan.
    pub scan_points: usize,

    /// Run the pose estimator.
    pub estimator: bool,

    /// Run the display process.
    pub display: bool,

    /// Stop everything after this many seconds. Runs until killed if unset.
    pub run_for_secs: Option<u64>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Serve Prometheus metrics.
    pub enabled: bool,

    /// Metrics port.
    pub port: u16,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            broker_capacity: 4096,
            relay_capacity: 4096,
            inbound_capacity: 1024,
            publish_timeout_us: 1000,
            startup_timeout_ms: 20_000,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 1000,
            checkpoint_timeout_ms: 30_000,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            monitor: true,
            monitor_topics: vec![String::new()],
            sensor: true,
            sensor_rate_hz: 10.0,
            scan_points: 360,
            estimator: true,
            display: true,
            run_for_secs: Some(10),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl BusSettings {
    /// Build the manager configuration.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            broker_capacity: self.broker_capacity,
            relay_capacity: self.relay_capacity,
            inbound_capacity: self.inbound_capacity,
            publish_timeout: Duration::from_micros(self.publish_timeout_us),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..ManagerConfig::default()
        }
    }

    /// Get the acknowledgement timeout.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Get the checkpoint timeout.
    #[must_use]
    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }
}

impl Settings {
    /// Load configuration from the default files and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file or variable cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            builder = builder
                .add_source(File::from(PathBuf::from(expanded.as_ref())).required(false));
        }
        Self::build(builder.add_source(
            Environment::with_prefix("NODEBUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        ))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::config::FileFormat;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bus.poll_interval_ms, 1000);
        assert_eq!(settings.nodes.monitor_topics, vec![String::new()]);
        assert!(!settings.metrics.enabled);

        let config = settings.bus.manager_config();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.publish_timeout, Duration::from_millis(1));
        assert_eq!(config.inbound_capacity, 1024);
    }

    #[test]
    fn test_settings_from_toml() {
        let toml_str = r#"
            [bus]
            poll_interval_ms = 50

            [nodes]
            display = false
            monitor_topics = ["lidar", "slam/pose"]

            [metrics]
            enabled = true
        "#;

        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.bus.poll_interval_ms, 50);
        assert_eq!(settings.bus.broker_capacity, 4096);
        assert!(!settings.nodes.display);
        assert!(settings.nodes.sensor);
        assert_eq!(settings.nodes.monitor_topics, vec!["lidar", "slam/pose"]);
        assert!(settings.metrics.enabled);
        assert_eq!(settings.metrics.port, 9090);
    }

    #[test]
    fn test_layered_sources() {
        let builder = ::config::Config::builder()
            .add_source(File::from_str(
                "[nodes]\nrun_for_secs = 3\nsensor_rate_hz = 5.0\n",
                FileFormat::Toml,
            ))
            .add_source(File::from_str("[nodes]\nrun_for_secs = 7\n", FileFormat::Toml));

        let settings = Settings::build(builder).unwrap();
        assert_eq!(settings.nodes.run_for_secs, Some(7));
        assert!((settings.nodes.sensor_rate_hz - 5.0).abs() < f64::EPSILON);
        assert_eq!(settings.bus.ack_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::from_file("/nonexistent/nodebus.toml").is_err());
    }
}
