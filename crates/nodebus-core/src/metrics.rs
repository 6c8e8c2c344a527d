//! Bus instrumentation.
//!
//! Records through the `metrics` facade; nothing is exported unless the
//! embedding program installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const ENVELOPES_TOTAL: &str = "nodebus_envelopes_total";
    pub const DELIVERED_TOTAL: &str = "nodebus_delivered_total";
    pub const DROPPED_TOTAL: &str = "nodebus_dropped_total";
    pub const ROUTING_ERRORS_TOTAL: &str = "nodebus_routing_errors_total";
    pub const RELAYED_TOTAL: &str = "nodebus_relayed_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "nodebus_subscriptions_active";
    pub const NODES_ALIVE: &str = "nodebus_nodes_alive";
}

/// Record an envelope taken by the broker.
pub fn record_envelope(kind: &'static str) {
    counter!(names::ENVELOPES_TOTAL, "kind" => kind).increment(1);
}

/// Record a delivery to a node's inbound queue.
pub fn record_delivery() {
    counter!(names::DELIVERED_TOTAL).increment(1);
}

/// Record a dropped envelope.
pub fn record_drop(reason: &'static str) {
    counter!(names::DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record an envelope from an unknown sender.
pub fn record_routing_error() {
    counter!(names::ROUTING_ERRORS_TOTAL).increment(1);
}

/// Record an envelope forwarded by the process relay.
pub fn record_relayed() {
    counter!(names::RELAYED_TOTAL).increment(1);
}

/// Update the active subscription count.
pub fn set_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

/// Record a node becoming alive or dead.
pub fn record_node_alive(alive: bool) {
    if alive {
        gauge!(names::NODES_ALIVE).increment(1.0);
    } else {
        gauge!(names::NODES_ALIVE).decrement(1.0);
    }
}
