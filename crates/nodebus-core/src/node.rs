//! Node records and the handle user code runs with.
//!
//! The manager owns a [`NodeRecord`] per node in its [`Registry`]. User code
//! only ever sees a [`NodeContext`], which wraps the node's own queues, the
//! outbound sink of its execution kind, and its exit flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use nodebus_protocol::Phase;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::BusError;
use crate::message::{Envelope, NodeId, Reply};
use crate::metrics;
use crate::queue::{MemoryQueue, QueueError, Sink};
use crate::signal::{ExitFlag, Rendezvous};

/// How a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionKind {
    /// An OS thread in the manager's process.
    Thread,
    /// A child OS process connected over a link.
    Process,
}

impl ExecutionKind {
    /// Suffix used in generated node names.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            ExecutionKind::Thread => "t",
            ExecutionKind::Process => "p",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Thread => f.write_str("thread"),
            ExecutionKind::Process => f.write_str("process"),
        }
    }
}

/// Node lifecycle state. Ordered; a node only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NodeState {
    Registered = 0,
    WaitingToStart = 1,
    Running = 2,
    ExitRequested = 3,
    Joined = 4,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Registered,
            1 => NodeState::WaitingToStart,
            2 => NodeState::Running,
            3 => NodeState::ExitRequested,
            _ => NodeState::Joined,
        }
    }
}

/// Shared, monotonic node state.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in `Registered`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn get(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `state` unless already past it. Returns the resulting state.
    pub fn advance(&self, state: NodeState) -> NodeState {
        let previous = self.0.fetch_max(state as u8, Ordering::AcqRel);
        NodeState::from_u8(previous.max(state as u8))
    }
}

/// Timings handed to every node.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Poll interval for waits that must observe exit flags.
    pub poll_interval: Duration,
    /// How long `publish` waits for room in the outbound queue.
    pub publish_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(1),
        }
    }
}

/// The manager's record of one node.
#[derive(Debug)]
pub struct NodeRecord {
    name: NodeId,
    kind: ExecutionKind,
    inbound: MemoryQueue<Envelope>,
    command: MemoryQueue<Reply>,
    state: Arc<StateCell>,
    alive: AtomicBool,
    tracked: AtomicBool,
}

impl NodeRecord {
    /// Create a record with fresh queues.
    #[must_use]
    pub fn new(name: impl Into<NodeId>, kind: ExecutionKind, inbound_capacity: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            inbound: MemoryQueue::bounded(inbound_capacity),
            command: MemoryQueue::bounded(1),
            state: Arc::new(StateCell::new()),
            alive: AtomicBool::new(true),
            tracked: AtomicBool::new(false),
        }
    }

    /// Get the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the execution kind.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// Get the inbound queue.
    #[must_use]
    pub fn inbound(&self) -> &MemoryQueue<Envelope> {
        &self.inbound
    }

    /// Get the command queue.
    #[must_use]
    pub fn command(&self) -> &MemoryQueue<Reply> {
        &self.command
    }

    /// Get the shared state cell.
    #[must_use]
    pub fn state(&self) -> &Arc<StateCell> {
        &self.state
    }

    /// Whether the node's execution primitive can still take deliveries.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Count the node in the alive gauge until it is marked dead.
    pub(crate) fn track_liveness(&self) {
        if self.is_alive() && !self.tracked.swap(true, Ordering::AcqRel) {
            metrics::record_node_alive(true);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire)
    }

    /// Mark the node's execution primitive as finished.
    pub fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            if self.tracked.load(Ordering::Acquire) {
                metrics::record_node_alive(false);
            }
            debug!(node = %self.name, kind = %self.kind, "Node no longer alive");
        }
    }

    /// Discard everything queued for the node.
    pub fn drain(&self) -> usize {
        self.inbound.drain() + self.command.drain()
    }
}

/// Node records keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: DashMap<NodeId, Arc<NodeRecord>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if the name is taken.
    pub fn insert(&self, record: Arc<NodeRecord>) -> Result<(), BusError> {
        match self.nodes.entry(record.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(BusError::DuplicateNode(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NodeRecord>> {
        self.nodes.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Check if a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Get every record, sorted by name.
    #[must_use]
    pub fn records(&self) -> Vec<Arc<NodeRecord>> {
        let mut records: Vec<_> = self.nodes.iter().map(|r| Arc::clone(r.value())).collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    /// Get the number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no nodes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Handle through which a node talks to the bus.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct NodeContext {
    name: NodeId,
    kind: ExecutionKind,
    inbound: MemoryQueue<Envelope>,
    command: MemoryQueue<Reply>,
    outbound: Arc<dyn Sink<Envelope>>,
    exit: ExitFlag,
    rendezvous: Arc<dyn Rendezvous>,
    state: Arc<StateCell>,
    timings: Timings,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Assemble a context from its parts.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: impl Into<NodeId>,
        kind: ExecutionKind,
        inbound: MemoryQueue<Envelope>,
        command: MemoryQueue<Reply>,
        outbound: Arc<dyn Sink<Envelope>>,
        exit: ExitFlag,
        rendezvous: Arc<dyn Rendezvous>,
        state: Arc<StateCell>,
        timings: Timings,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            inbound,
            command,
            outbound,
            exit,
            rendezvous,
            state,
            timings,
        }
    }

    /// Build the context for a registered record.
    #[must_use]
    pub fn for_record(
        record: &NodeRecord,
        outbound: Arc<dyn Sink<Envelope>>,
        exit: ExitFlag,
        rendezvous: Arc<dyn Rendezvous>,
        timings: Timings,
    ) -> Self {
        Self::new(
            record.name(),
            record.kind(),
            record.inbound().clone(),
            record.command().clone(),
            outbound,
            exit,
            rendezvous,
            Arc::clone(record.state()),
            timings,
        )
    }

    /// Get the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the execution kind.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Get the node's timings.
    #[must_use]
    pub fn timings(&self) -> Timings {
        self.timings
    }

    /// Publish a payload to `topic`.
    ///
    /// Returns `false` if the outbound queue stayed full for the publish
    /// timeout. Delivery itself is best effort.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> bool {
        self.send(Envelope::publish(self.name.clone(), topic, payload))
    }

    /// Publish a MessagePack encoded value to `topic`.
    pub fn publish_value<T: Serialize + ?Sized>(&self, topic: impl Into<String>, value: &T) -> bool {
        match Envelope::publish_value(self.name.clone(), topic, value) {
            Ok(envelope) => self.send(envelope),
            Err(e) => {
                warn!(node = %self.name, error = %e, "Failed to encode payload");
                false
            }
        }
    }

    fn send(&self, envelope: Envelope) -> bool {
        let topic = envelope.topic.clone();
        match self
            .outbound
            .push_timeout(envelope, self.timings.publish_timeout)
        {
            Ok(()) => {
                trace!(node = %self.name, topic = %topic, "Published");
                true
            }
            Err(e) => {
                debug!(node = %self.name, topic = %topic, error = %e, "Publish failed");
                false
            }
        }
    }

    /// Subscribe to `topic` and everything below it.
    ///
    /// With `ensure_ack` the call waits up to `ack_timeout` for the broker's
    /// answer and returns it, or `false` on timeout. Without it the call
    /// returns once the request is queued.
    pub fn subscribe(&self, topic: impl Into<String>, ensure_ack: bool, ack_timeout: Duration) -> bool {
        self.request(Envelope::subscribe(self.name.clone(), topic), ensure_ack, ack_timeout)
    }

    /// Unsubscribe from exactly `topic`. Same acknowledgement rules as
    /// [`subscribe`](Self::subscribe).
    pub fn unsubscribe(
        &self,
        topic: impl Into<String>,
        ensure_ack: bool,
        ack_timeout: Duration,
    ) -> bool {
        self.request(Envelope::unsubscribe(self.name.clone(), topic), ensure_ack, ack_timeout)
    }

    fn request(&self, envelope: Envelope, ensure_ack: bool, ack_timeout: Duration) -> bool {
        // Replies to earlier requests would hold the single reply slot.
        let stale = self.command.drain();
        if stale > 0 {
            debug!(node = %self.name, stale, "Discarded stale replies");
        }

        let id = envelope.id;
        let topic = envelope.topic.clone();
        let kind = envelope.kind;
        let push_timeout = ack_timeout.max(self.timings.publish_timeout);
        if let Err(e) = self.outbound.push_timeout(envelope, push_timeout) {
            warn!(node = %self.name, topic = %topic, ?kind, error = %e, "Request not sent");
            return false;
        }

        if !ensure_ack {
            return true;
        }

        let deadline = Instant::now().checked_add(ack_timeout);
        loop {
            let left = deadline.map_or(ack_timeout, |d| d.saturating_duration_since(Instant::now()));
            match self.command.pop_timeout(left) {
                Ok(reply) if reply.request == id => {
                    let accepted = reply.accepted;
                    debug!(node = %self.name, topic = %topic, ?kind, accepted, "Request answered");
                    return accepted;
                }
                Ok(reply) => {
                    debug!(node = %self.name, request = reply.request, "Discarded reply to an earlier request");
                }
                Err(QueueError::Timeout) => {
                    warn!(node = %self.name, topic = %topic, ?kind, "Request not acknowledged in time");
                    return false;
                }
                Err(e) => {
                    warn!(node = %self.name, topic = %topic, ?kind, error = %e, "Request failed");
                    return false;
                }
            }
        }
    }

    /// Take the envelopes waiting in the inbound queue.
    ///
    /// The first pop waits up to `timeout` when `block` is set. After that
    /// at most as many envelopes as were queued at that moment are taken,
    /// without waiting, so a busy publisher cannot keep the call running.
    pub fn receive(&self, block: bool, timeout: Duration) -> Vec<Envelope> {
        let first = if block {
            self.inbound.pop_timeout(timeout)
        } else {
            self.inbound.try_pop()
        };
        let Ok(first) = first else {
            return Vec::new();
        };

        let pending = self.inbound.len();
        let mut envelopes = Vec::with_capacity(pending + 1);
        envelopes.push(first);
        for _ in 0..pending {
            match self.inbound.try_pop() {
                Ok(envelope) => envelopes.push(envelope),
                Err(_) => break,
            }
        }
        envelopes
    }

    /// Ask every node of this execution kind to stop.
    pub fn request_exit(&self) {
        if self.exit.set() {
            debug!(node = %self.name, kind = %self.kind, "Exit requested");
        }
        self.state.advance(NodeState::ExitRequested);
    }

    /// Whether this node's exit flag is set.
    pub fn is_exiting(&self) -> bool {
        let exiting = self.exit.is_set();
        if exiting {
            self.state.advance(NodeState::ExitRequested);
        }
        exiting
    }

    /// Arrive at `group`'s setup checkpoint.
    ///
    /// Returns `false` if the wait failed; the failure is logged and the
    /// node is expected to carry on.
    pub fn wait_setup(&self, group: &str, timeout: Duration) -> bool {
        self.arrive(group, Phase::Setup, timeout)
    }

    /// Arrive at `group`'s ready checkpoint.
    pub fn wait_ready(&self, group: &str, timeout: Duration) -> bool {
        self.arrive(group, Phase::Ready, timeout)
    }

    fn arrive(&self, group: &str, phase: Phase, timeout: Duration) -> bool {
        match self.rendezvous.arrive(group, phase, timeout) {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %self.name, group = %group, phase = %phase, error = %e, "Checkpoint failed, proceeding");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signal::{GroupTable, NodeGroup};
    use std::thread;

    /// A thread context whose outbound queue nobody drains.
    pub(crate) fn detached_context(
        name: &str,
    ) -> (NodeContext, Arc<NodeRecord>, MemoryQueue<Envelope>, Arc<GroupTable>) {
        let record = Arc::new(NodeRecord::new(name, ExecutionKind::Thread, 16));
        let outbound = MemoryQueue::bounded(16);
        let groups = Arc::new(GroupTable::new());
        let ctx = NodeContext::for_record(
            &record,
            Arc::new(outbound.clone()),
            ExitFlag::new(),
            groups.clone(),
            Timings::default(),
        );
        (ctx, record, outbound, groups)
    }

    #[test]
    fn test_state_is_monotonic() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), NodeState::Registered);
        assert_eq!(cell.advance(NodeState::Running), NodeState::Running);
        assert_eq!(cell.advance(NodeState::WaitingToStart), NodeState::Running);
        assert_eq!(cell.advance(NodeState::Joined), NodeState::Joined);
        assert_eq!(cell.advance(NodeState::ExitRequested), NodeState::Joined);
    }

    #[test]
    fn test_only_tracked_records_count_as_alive() {
        let record = NodeRecord::new("a", ExecutionKind::Thread, 4);
        assert!(record.is_alive());
        assert!(!record.is_tracked());

        record.track_liveness();
        record.track_liveness();
        assert!(record.is_tracked());

        let dead = NodeRecord::new("b", ExecutionKind::Process, 4);
        dead.mark_dead();
        dead.track_liveness();
        assert!(!dead.is_tracked());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = Registry::new();
        registry
            .insert(Arc::new(NodeRecord::new("a", ExecutionKind::Thread, 4)))
            .unwrap();
        assert!(matches!(
            registry.insert(Arc::new(NodeRecord::new("a", ExecutionKind::Process, 4))),
            Err(BusError::DuplicateNode(name)) if name == "a"
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().kind(), ExecutionKind::Thread);
    }

    #[test]
    fn test_publish_enqueues_envelope() {
        let (ctx, _record, outbound, _) = detached_context("lidar");
        assert!(ctx.publish("lidar/scan", vec![1u8, 2, 3]));

        let env = outbound.try_pop().unwrap();
        assert_eq!(env.sender, "lidar");
        assert_eq!(env.topic, "lidar/scan");
        assert_eq!(env.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_publish_full_returns_false() {
        let record = NodeRecord::new("n", ExecutionKind::Thread, 4);
        let outbound = MemoryQueue::bounded(1);
        let ctx = NodeContext::for_record(
            &record,
            Arc::new(outbound.clone()),
            ExitFlag::new(),
            Arc::new(GroupTable::new()),
            Timings::default(),
        );
        assert!(ctx.publish("a", vec![0u8]));
        assert!(!ctx.publish("a", vec![1u8]));
        assert_eq!(outbound.len(), 1);
    }

    #[test]
    fn test_subscribe_times_out_when_broker_stalls() {
        let (ctx, _record, outbound, _) = detached_context("node-d");

        let started = Instant::now();
        assert!(!ctx.subscribe("y", true, Duration::from_millis(100)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_secs(2));

        // The request itself was queued.
        assert_eq!(outbound.len(), 1);
    }

    #[test]
    fn test_stale_reply_is_discarded() {
        let (ctx, record, outbound, _) = detached_context("n");

        // Late reply to a request that already gave up.
        record
            .command()
            .try_push(Reply {
                request: 1,
                accepted: true,
            })
            .unwrap();

        let answer = thread::spawn({
            let command = record.command().clone();
            let outbound = outbound.clone();
            move || {
                let request = outbound.pop_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(request.topic, "x");
                command.try_push(Reply::to(&request, false)).unwrap();
            }
        });

        assert!(!ctx.subscribe("x", true, Duration::from_secs(5)));
        answer.join().unwrap();
    }

    #[test]
    fn test_reply_in_flight_is_not_taken_for_next_request() {
        let (ctx, record, outbound, _) = detached_context("n");

        // The broker answers both requests, but only after the second one
        // has started waiting.
        let broker = thread::spawn({
            let command = record.command().clone();
            let outbound = outbound.clone();
            move || {
                let first = outbound.pop_timeout(Duration::from_secs(5)).unwrap();
                let second = outbound.pop_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(first.topic, "a");
                assert_eq!(second.topic, "b");

                command
                    .push_timeout(Reply::to(&first, true), Duration::from_secs(5))
                    .unwrap();
                command
                    .push_timeout(Reply::to(&second, false), Duration::from_secs(5))
                    .unwrap();
            }
        });

        assert!(ctx.subscribe("a", false, Duration::from_secs(5)));
        assert!(!ctx.subscribe("b", true, Duration::from_secs(5)));
        broker.join().unwrap();
    }

    #[test]
    fn test_receive_drains_snapshot() {
        let (ctx, record, _, _) = detached_context("n");
        assert!(ctx.receive(false, Duration::ZERO).is_empty());

        for i in 0..3u8 {
            record
                .inbound()
                .try_push(Envelope::publish("p", "t", vec![i]))
                .unwrap();
        }
        let got = ctx.receive(true, Duration::from_millis(10));
        let payloads: Vec<u8> = got.iter().map(|e| e.payload()[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);

        let started = Instant::now();
        assert!(ctx.receive(true, Duration::from_millis(30)).is_empty());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_request_exit() {
        let (ctx, record, _, _) = detached_context("n");
        assert!(!ctx.is_exiting());
        ctx.request_exit();
        ctx.request_exit();
        assert!(ctx.is_exiting());
        assert_eq!(record.state().get(), NodeState::ExitRequested);
    }

    #[test]
    fn test_wait_setup_timeout_proceeds() {
        let (ctx, _, _, groups) = detached_context("n");
        groups.insert(NodeGroup::new("g", 1));

        // The manager never arrives.
        assert!(!ctx.wait_setup("g", Duration::from_millis(20)));
        assert!(!ctx.wait_ready("missing", Duration::from_millis(1)));
    }
}
