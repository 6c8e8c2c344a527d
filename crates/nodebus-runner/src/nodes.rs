//! The simulated lidar pipeline.
//!
//! ```text
//!  lidar-scan ──lidar/scan──▶ slam ──slam/pose──▶ display (process)
//!       └──────────────┬─────────┘
//!                      ▼
//!                   monitor
//! ```
//!
//! Each node sits in its own group. The runner releases the groups' setup
//! and ready checkpoints one group at a time, in a fixed order.

use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use nodebus_core::{Manager, NodeContext, ProcessTable, StatsSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::settings::Settings;

/// Topic carrying [`Scan`]s.
pub const SCAN_TOPIC: &str = "lidar/scan";

/// Topic carrying [`Pose`]s.
pub const POSE_TOPIC: &str = "slam/pose";

/// Process table entry of the display node.
pub const DISPLAY_ENTRY: &str = "display";

const MAX_PREVIEW_BYTES: usize = 16;

/// One sweep of range readings, evenly spaced over a full turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub seq: u64,
    pub ranges: Vec<f32>,
}

/// Pose estimated from one scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub seq: u64,
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

/// Timeouts handed to every node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Timeouts {
    ack_ms: u64,
    checkpoint_ms: u64,
}

impl Timeouts {
    fn ack(self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }

    fn checkpoint(self) -> Duration {
        Duration::from_millis(self.checkpoint_ms)
    }
}

/// Arguments of the display process.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DisplayArgs {
    group: String,
    timeouts: Timeouts,
}

/// Entries this binary can run as a child process.
#[must_use]
pub fn process_table() -> ProcessTable {
    ProcessTable::new().with(DISPLAY_ENTRY, display)
}

/// Generate a scan of `points` ranges.
#[must_use]
pub fn synthetic_scan(seq: u64, points: usize) -> Scan {
    let phase = (seq % 628) as f32 * 0.01;
    let ranges = (0..points)
        .map(|i| {
            let angle = i as f32 / points as f32 * TAU;
            2.0 + (angle + phase).sin()
        })
        .collect();
    Scan { seq, ranges }
}

/// Estimate a pose as the centroid of the scan's points.
#[must_use]
pub fn estimate_pose(scan: &Scan) -> Option<Pose> {
    if scan.ranges.is_empty() {
        return None;
    }

    let n = scan.ranges.len() as f32;
    let (sx, sy) = scan
        .ranges
        .iter()
        .enumerate()
        .fold((0.0f32, 0.0f32), |(sx, sy), (i, range)| {
            let angle = i as f32 / n * TAU;
            (sx + range * angle.cos(), sy + range * angle.sin())
        });
    let (x, y) = (sx / n, sy / n);

    Some(Pose {
        seq: scan.seq,
        x,
        y,
        theta: y.atan2(x),
    })
}

/// Hex preview of a payload, truncated.
fn preview(payload: &[u8]) -> String {
    let mut out: String = payload
        .iter()
        .take(MAX_PREVIEW_BYTES)
        .map(|b| format!("{b:02x}"))
        .collect();
    if payload.len() > MAX_PREVIEW_BYTES {
        out.push_str("...");
    }
    out
}

/// Set up the pipeline, run it, and return the bus counters.
///
/// # Errors
///
/// Returns an error if the bus or a node fails to start.
pub fn run(settings: &Settings, table: &ProcessTable) -> Result<StatsSnapshot> {
    let nodes = &settings.nodes;
    let timeouts = Timeouts {
        ack_ms: settings.bus.ack_timeout_ms,
        checkpoint_ms: settings.bus.checkpoint_timeout_ms,
    };
    let mut manager =
        Manager::new(settings.bus.manager_config()).context("Failed to start the bus")?;
    let mut order = Vec::new();

    if nodes.monitor {
        manager.add_group("monitor", 1)?;
        let topics = nodes.monitor_topics.clone();
        manager.register_thread("monitor", move |ctx| monitor(ctx, "monitor", &topics, timeouts))?;
        order.push("monitor");
    }

    if nodes.sensor {
        manager.add_group("lidar", 1)?;
        let rate = nodes.sensor_rate_hz;
        let points = nodes.scan_points;
        manager.register_thread("lidar-scan", move |ctx| {
            scan_sensor(ctx, "lidar", rate, points, timeouts);
        })?;
        order.push("lidar");
    }

    if nodes.estimator {
        manager.add_group("slam", 1)?;
        manager.register_thread("slam", move |ctx| estimator(ctx, "slam", timeouts))?;
        order.push("slam");
    }

    if nodes.display {
        ensure!(
            table.get(DISPLAY_ENTRY).is_some(),
            "Process table has no {DISPLAY_ENTRY} entry"
        );
        manager.add_group("display", 1)?;
        manager.register_process(
            "display",
            DISPLAY_ENTRY,
            DisplayArgs {
                group: "display".into(),
                timeouts,
            },
        )?;
        order.push("display");
    }

    if let Some(secs) = nodes.run_for_secs {
        let run_for = Duration::from_secs(secs);
        manager.register_thread("watchdog", move |ctx| watchdog(ctx, run_for))?;
    }

    manager.start_all().context("Failed to start nodes")?;

    let checkpoint = settings.bus.checkpoint_timeout();
    for group in order {
        info!(group, "Setting up group");
        if !manager.release_setup(group, checkpoint)? {
            warn!(group, "Group setup not released, continuing");
        }
        if !manager.release_ready(group, checkpoint)? {
            warn!(group, "Group not ready, continuing");
        }
    }
    info!(nodes = ?manager.node_names(), "Pipeline running");

    manager.join_all();
    Ok(manager.stats())
}

/// Log every envelope on the given topics.
fn monitor(ctx: &NodeContext, group: &str, topics: &[String], timeouts: Timeouts) {
    ctx.wait_setup(group, timeouts.checkpoint());
    for topic in topics {
        if ctx.subscribe(topic.as_str(), true, timeouts.ack()) {
            info!(node = %ctx.name(), topic = %topic, "Monitoring");
        } else {
            warn!(node = %ctx.name(), topic = %topic, "Monitor subscription failed");
        }
    }
    ctx.wait_ready(group, timeouts.checkpoint());

    let poll = ctx.timings().poll_interval;
    while !ctx.is_exiting() {
        for envelope in ctx.receive(true, poll) {
            info!(
                topic = %envelope.topic,
                sender = %envelope.sender,
                bytes = envelope.payload_size(),
                payload = %preview(envelope.payload()),
                "Monitor"
            );
        }
    }
    debug!(node = %ctx.name(), "Monitor exiting");
}

/// Publish synthetic scans at `rate_hz`.
fn scan_sensor(ctx: &NodeContext, group: &str, rate_hz: f64, points: usize, timeouts: Timeouts) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(0.1));
    ctx.wait_setup(group, timeouts.checkpoint());
    info!(node = %ctx.name(), ?period, points, "Scan sensor ready");
    ctx.wait_ready(group, timeouts.checkpoint());

    let mut seq = 0u64;
    let mut dropped = 0u64;
    let mut next = Instant::now();
    while !ctx.is_exiting() {
        if !ctx.publish_value(SCAN_TOPIC, &synthetic_scan(seq, points)) {
            dropped += 1;
        }
        seq += 1;

        next += period;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    info!(node = %ctx.name(), scans = seq, dropped, "Scan sensor exiting");
}

/// Turn scans into poses.
fn estimator(ctx: &NodeContext, group: &str, timeouts: Timeouts) {
    ctx.wait_setup(group, timeouts.checkpoint());
    if !ctx.subscribe(SCAN_TOPIC, true, timeouts.ack()) {
        warn!(node = %ctx.name(), "Scan subscription failed");
    }
    ctx.wait_ready(group, timeouts.checkpoint());

    let poll = ctx.timings().poll_interval;
    let mut estimated = 0u64;
    while !ctx.is_exiting() {
        for envelope in ctx.receive(true, poll) {
            let scan: Scan = match envelope.decode() {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(node = %ctx.name(), error = %e, "Bad scan");
                    continue;
                }
            };
            if let Some(pose) = estimate_pose(&scan) {
                ctx.publish_value(POSE_TOPIC, &pose);
                estimated += 1;
            }
        }
    }
    info!(node = %ctx.name(), estimated, "Estimator exiting");
}

/// Print poses; runs in a child process.
fn display(ctx: &NodeContext, args: serde_json::Value) {
    let args: DisplayArgs = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => {
            warn!(node = %ctx.name(), error = %e, "Bad display arguments");
            return;
        }
    };

    ctx.wait_setup(&args.group, args.timeouts.checkpoint());
    if !ctx.subscribe("slam", true, args.timeouts.ack()) {
        warn!(node = %ctx.name(), "Pose subscription failed");
    }
    ctx.wait_ready(&args.group, args.timeouts.checkpoint());

    let poll = ctx.timings().poll_interval;
    let mut last: Option<Pose> = None;
    let mut shown = Instant::now();
    while !ctx.is_exiting() {
        for envelope in ctx.receive(true, poll) {
            match envelope.decode::<Pose>() {
                Ok(pose) => last = Some(pose),
                Err(e) => debug!(topic = %envelope.topic, error = %e, "Not a pose"),
            }
        }
        if shown.elapsed() >= Duration::from_secs(1) {
            shown = Instant::now();
            if let Some(pose) = last {
                info!(seq = pose.seq, x = pose.x, y = pose.y, theta = pose.theta, "Pose");
            }
        }
    }
    debug!(node = %ctx.name(), "Display exiting");
}

/// Request exit for every thread node after `run_for`.
fn watchdog(ctx: &NodeContext, run_for: Duration) {
    let deadline = Instant::now() + run_for;
    let poll = ctx.timings().poll_interval;
    while !ctx.is_exiting() {
        let now = Instant::now();
        if now >= deadline {
            info!(?run_for, "Run time elapsed, stopping");
            ctx.request_exit();
            break;
        }
        thread::sleep(poll.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_scan() {
        let scan = synthetic_scan(3, 90);
        assert_eq!(scan.seq, 3);
        assert_eq!(scan.ranges.len(), 90);
        assert!(scan.ranges.iter().all(|r| (1.0..=3.0).contains(r)));
    }

    #[test]
    fn test_estimate_pose() {
        assert_eq!(estimate_pose(&Scan { seq: 0, ranges: vec![] }), None);

        // A single return straight ahead.
        let pose = estimate_pose(&Scan {
            seq: 9,
            ranges: vec![4.0, 0.0, 0.0, 0.0],
        })
        .unwrap();
        assert_eq!(pose.seq, 9);
        assert!((pose.x - 1.0).abs() < 1e-5);
        assert!(pose.y.abs() < 1e-5);
        assert!(pose.theta.abs() < 1e-5);

        // A circle centred on the sensor.
        let pose = estimate_pose(&Scan {
            seq: 0,
            ranges: vec![2.0; 64],
        })
        .unwrap();
        assert!(pose.x.abs() < 1e-4 && pose.y.abs() < 1e-4);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(&[0x01, 0xab]), "01ab");
        let long = [0u8; 20];
        assert_eq!(preview(&long), format!("{}...", "00".repeat(16)));
    }

    #[test]
    fn test_thread_pipeline_runs_to_completion() {
        let mut settings = Settings::default();
        settings.bus.poll_interval_ms = 20;
        settings.bus.checkpoint_timeout_ms = 5000;
        settings.nodes.display = false;
        settings.nodes.sensor_rate_hz = 50.0;
        settings.nodes.scan_points = 8;
        settings.nodes.run_for_secs = Some(1);

        let stats = run(&settings, &process_table()).unwrap();
        assert!(stats.published > 0);
        // The monitor is on the root topic, so it sees scans and poses.
        assert!(stats.delivered >= stats.published);
    }
}
