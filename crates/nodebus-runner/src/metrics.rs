//! Metrics export for the runner.
//!
//! The bus records through the `metrics` facade; this module describes
//! those metrics and optionally serves them in Prometheus format.

use metrics_exporter_prometheus::PrometheusBuilder;
use nodebus_core::metrics::names;
use std::net::SocketAddr;
use tracing::info;

/// Describe the bus metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::ENVELOPES_TOTAL,
        "Envelopes taken by the broker, by kind"
    );
    metrics::describe_counter!(
        names::DELIVERED_TOTAL,
        "Envelopes delivered into node inbound queues"
    );
    metrics::describe_counter!(names::DROPPED_TOTAL, "Envelopes dropped, by reason");
    metrics::describe_counter!(
        names::ROUTING_ERRORS_TOTAL,
        "Envelopes from unregistered senders"
    );
    metrics::describe_counter!(
        names::RELAYED_TOTAL,
        "Envelopes forwarded from process nodes to the broker"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of topic subscriptions"
    );
    metrics::describe_gauge!(names::NODES_ALIVE, "Nodes whose thread or process is running");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
