//! The broker: routes envelopes from the thread-domain queue.
//!
//! The broker is the only owner of the [`TopicTree`]. It runs on its own
//! thread, drains the queue shared by thread nodes (and fed by the process
//! relay), fans publishes out to subscribers and answers subscription
//! requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nodebus_protocol::EnvelopeKind;
use tracing::{debug, error, info, trace, warn};

use crate::error::BusError;
use crate::message::{Envelope, Reply};
use crate::metrics;
use crate::node::{NodeRecord, Registry};
use crate::queue::{MemoryQueue, QueueError, Sink};
use crate::signal::{Checkpoint, ExitFlags};
use crate::topic::TopicTree;

/// Bus counters, shared between the broker, relay and manager.
#[derive(Debug, Default)]
pub struct BusStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    routing_errors: AtomicU64,
    subscriptions: AtomicU64,
    unsubscriptions: AtomicU64,
    relayed: AtomicU64,
}

impl BusStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, reason: &'static str) {
        Self::bump(&self.dropped);
        metrics::record_drop(reason);
    }

    pub(crate) fn record_relayed(&self) {
        Self::bump(&self.relayed);
        metrics::record_relayed();
    }

    /// Get a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            unsubscriptions: self.unsubscriptions.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

/// Bus statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Publish envelopes routed.
    pub published: u64,
    /// Deliveries into inbound queues.
    pub delivered: u64,
    /// Deliveries and forwards dropped.
    pub dropped: u64,
    /// Envelopes from unregistered senders.
    pub routing_errors: u64,
    /// Accepted subscribe requests.
    pub subscriptions: u64,
    /// Accepted unsubscribe requests.
    pub unsubscriptions: u64,
    /// Envelopes forwarded by the process relay.
    pub relayed: u64,
}

/// The central router.
pub struct Broker {
    tree: TopicTree,
    registry: Arc<Registry>,
    queue: MemoryQueue<Envelope>,
    flags: ExitFlags,
    stats: Arc<BusStats>,
    poll_interval: Duration,
}

impl Broker {
    /// Create a broker reading from `queue`.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        queue: MemoryQueue<Envelope>,
        flags: ExitFlags,
        stats: Arc<BusStats>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tree: TopicTree::new(),
            registry,
            queue,
            flags,
            stats,
            poll_interval,
        }
    }

    /// Get the topic tree.
    #[must_use]
    pub fn tree(&self) -> &TopicTree {
        &self.tree
    }

    /// Run until either exit flag is set, then set both.
    ///
    /// Waits at `startup` first so the manager knows the loop is up.
    pub fn run(mut self, startup: Arc<Checkpoint>, startup_timeout: Duration) {
        if let Err(e) = startup.wait(startup_timeout) {
            warn!(error = %e, "Broker startup checkpoint failed, proceeding");
        }
        info!(poll_interval = ?self.poll_interval, "Broker started");

        while !self.flags.any_set() {
            match self.queue.pop_timeout(self.poll_interval) {
                Ok(envelope) => {
                    if let Err(e) = self.dispatch(envelope) {
                        debug!(error = %e, "Envelope rejected");
                    }
                }
                Err(QueueError::Timeout) => {}
                Err(e) => {
                    error!(error = %e, "Broker queue failed");
                    break;
                }
            }
        }

        self.flags.set_all();
        let stats = self.stats.snapshot();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Broker stopped"
        );
    }

    /// Route one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is unregistered or an unsubscribe
    /// request did not match a subscription. Rejected requests are still
    /// answered.
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let Some(sender) = self.registry.get(&envelope.sender) else {
            BusStats::bump(&self.stats.routing_errors);
            metrics::record_routing_error();
            warn!(sender = %envelope.sender, topic = %envelope.topic, "Envelope from unregistered node");
            return Err(BusError::UnknownNode(envelope.sender));
        };

        match envelope.kind {
            EnvelopeKind::Publish => {
                BusStats::bump(&self.stats.published);
                metrics::record_envelope("publish");
                self.route(&envelope);
                Ok(())
            }
            EnvelopeKind::Subscribe => {
                metrics::record_envelope("subscribe");
                self.tree.add_subscriber(&envelope.topic, &envelope.sender);
                let result = Ok(());
                self.answer(&sender, &envelope, &result, &self.stats.subscriptions);
                result
            }
            EnvelopeKind::Unsubscribe => {
                metrics::record_envelope("unsubscribe");
                let result = self
                    .tree
                    .remove_subscriber(&envelope.topic, &envelope.sender)
                    .map_err(BusError::from);
                self.answer(&sender, &envelope, &result, &self.stats.unsubscriptions);
                result
            }
        }
    }

    fn route(&self, envelope: &Envelope) {
        let targets = self.tree.resolve(&envelope.topic);
        trace!(topic = %envelope.topic, targets = targets.len(), "Routing publish");

        for target in targets {
            let Some(record) = self.registry.get(target) else {
                self.stats.record_dropped("unknown");
                debug!(node = %target, topic = %envelope.topic, "Dropped: subscriber not registered");
                continue;
            };
            if !record.is_alive() {
                self.stats.record_dropped("dead");
                debug!(node = %target, topic = %envelope.topic, "Dropped: subscriber not alive");
                continue;
            }
            match record.inbound().try_push(envelope.clone()) {
                Ok(()) => {
                    BusStats::bump(&self.stats.delivered);
                    metrics::record_delivery();
                }
                Err(e) => {
                    self.stats.record_dropped("full");
                    debug!(node = %target, topic = %envelope.topic, error = %e, "Dropped: inbound queue");
                }
            }
        }
    }

    fn answer(
        &self,
        sender: &NodeRecord,
        envelope: &Envelope,
        result: &Result<(), BusError>,
        accepted: &AtomicU64,
    ) {
        match result {
            Ok(()) => {
                BusStats::bump(accepted);
                metrics::set_subscriptions(self.tree.stats().subscriptions);
                debug!(node = %sender.name(), topic = %envelope.topic, kind = ?envelope.kind, "Request accepted");
            }
            Err(e) => {
                debug!(node = %sender.name(), topic = %envelope.topic, kind = ?envelope.kind, error = %e, "Request rejected");
            }
        }

        if let Err(e) = sender.command().try_push(Reply::to(envelope, result.is_ok())) {
            debug!(node = %sender.name(), error = %e, "Reply lost");
        }
    }
}
