//! Shared fixtures for the nodebus benchmarks.

use std::sync::Arc;
use std::time::Duration;

use nodebus_core::node::{NodeRecord, Registry};
use nodebus_core::signal::ExitFlags;
use nodebus_core::{Broker, BusError, BusStats, Envelope, ExecutionKind, ManagerConfig, MemoryQueue};

/// Inbound capacity large enough that benchmarks never drop.
pub const BENCH_INBOUND: usize = 1 << 16;

/// A broker with `subscribers` nodes on `topic` and one publisher, `"pub"`.
///
/// Returns the registry too, so benchmarks can drain inbound queues.
///
/// # Errors
///
/// Returns an error if `topic` is invalid.
pub fn subscribed_broker(
    subscribers: usize,
    topic: &str,
) -> Result<(Broker, Arc<Registry>), BusError> {
    let registry = Arc::new(Registry::new());
    let mut broker = Broker::new(
        Arc::clone(&registry),
        MemoryQueue::bounded(16),
        ExitFlags::new(),
        Arc::new(BusStats::new()),
        Duration::from_millis(10),
    );

    for name in std::iter::once("pub".to_string()).chain((0..subscribers).map(|i| format!("sub-{i}"))) {
        let record = Arc::new(NodeRecord::new(name.as_str(), ExecutionKind::Thread, BENCH_INBOUND));
        registry.insert(record)?;
        if name != "pub" {
            broker.dispatch(Envelope::subscribe(name, topic))?;
        }
    }
    drain(&registry);
    Ok((broker, registry))
}

/// Empty every node's queues.
pub fn drain(registry: &Registry) -> usize {
    registry.records().iter().map(|record| record.drain()).sum()
}

/// Manager configuration for benchmarks: short polls, large queues.
#[must_use]
pub fn bench_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_millis(10),
        inbound_capacity: BENCH_INBOUND,
        publish_timeout: Duration::from_millis(10),
        ..ManagerConfig::default()
    }
}
