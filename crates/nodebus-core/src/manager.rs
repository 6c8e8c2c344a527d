//! The manager: owns the broker, the relay and every node.
//!
//! A [`Manager`] is a scoped resource. Creating one starts the broker and
//! relay threads; dropping it asks every node to exit, joins them, and
//! stops the background threads, even while unwinding.

use std::env;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::signal::Rendezvous;
use nodebus_protocol::Phase;
use nodebus_transport::LoopbackListener;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BusStats, StatsSnapshot};
use crate::context;
use crate::error::BusError;
use crate::message::{Envelope, NodeId};
use crate::node::{ExecutionKind, NodeContext, NodeRecord, NodeState, Registry, Timings};
use crate::process::{ChildProgram, LinkShared, PendingProcess, ProcessHandle};
use crate::queue::{MemoryQueue, Sink};
use crate::relay::ProcessRelay;
use crate::signal::{Checkpoint, ExitFlags, GroupTable, NodeGroup, StartGate};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Poll interval of every wait that must observe exit flags.
    pub poll_interval: Duration,
    /// Capacity of the queue thread nodes publish into.
    pub broker_capacity: usize,
    /// Capacity of the queue process links publish into.
    pub relay_capacity: usize,
    /// Capacity of each node's inbound queue.
    pub inbound_capacity: usize,
    /// How long `publish` waits for room.
    pub publish_timeout: Duration,
    /// How long to wait for the broker and relay to come up.
    pub startup_timeout: Duration,
    /// How long a child has to connect and say hello.
    pub connect_timeout: Duration,
    /// Program re-executed for process nodes. Defaults to the current executable.
    pub child_program: Option<PathBuf>,
    /// Arguments passed to children. Defaults to this process's own arguments.
    pub child_args: Option<Vec<String>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            broker_capacity: 4096,
            relay_capacity: 4096,
            inbound_capacity: 1024,
            publish_timeout: Duration::from_millis(1),
            startup_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            child_program: None,
            child_args: None,
        }
    }
}

impl ManagerConfig {
    fn timings(&self) -> Timings {
        Timings {
            poll_interval: self.poll_interval,
            publish_timeout: self.publish_timeout,
        }
    }
}

/// Queue depths at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueDepths {
    /// Envelopes waiting for the broker.
    pub broker: usize,
    /// Envelopes waiting for the relay.
    pub relay: usize,
    /// Per-node depths, sorted by name.
    pub nodes: Vec<NodeQueueDepth>,
}

/// Queue depths of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQueueDepth {
    pub name: NodeId,
    pub kind: ExecutionKind,
    /// Envelopes waiting to be received.
    pub inbound: usize,
    /// Unread subscription replies.
    pub command: usize,
}

type ThreadBody = Box<dyn FnOnce(&NodeContext) + Send + 'static>;

struct PendingThread {
    record: Arc<NodeRecord>,
    body: ThreadBody,
}

struct ThreadHandle {
    record: Arc<NodeRecord>,
    handle: JoinHandle<()>,
}

/// Marks the node dead when its thread finishes, panics included.
struct AliveGuard(Arc<NodeRecord>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.mark_dead();
    }
}

/// Owns the bus and every node registered with it.
pub struct Manager {
    config: ManagerConfig,
    registry: Arc<Registry>,
    groups: Arc<GroupTable>,
    flags: ExitFlags,
    stats: Arc<BusStats>,
    broker_queue: MemoryQueue<Envelope>,
    relay_queue: MemoryQueue<Envelope>,
    pending_threads: Vec<PendingThread>,
    pending_processes: Vec<PendingProcess>,
    threads: Vec<ThreadHandle>,
    processes: Vec<ProcessHandle>,
    services: Vec<JoinHandle<()>>,
    started: bool,
    next_id: usize,
}

impl Manager {
    /// Start the broker and relay threads.
    ///
    /// Waits up to `startup_timeout` for both loops to come up. A slow
    /// start is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a background thread cannot be spawned.
    pub fn new(config: ManagerConfig) -> Result<Self, BusError> {
        let mut manager = Self {
            registry: Arc::new(Registry::new()),
            groups: Arc::new(GroupTable::new()),
            flags: ExitFlags::new(),
            stats: Arc::new(BusStats::new()),
            broker_queue: MemoryQueue::bounded(config.broker_capacity),
            relay_queue: MemoryQueue::bounded(config.relay_capacity),
            pending_threads: Vec::new(),
            pending_processes: Vec::new(),
            threads: Vec::new(),
            processes: Vec::new(),
            services: Vec::with_capacity(2),
            started: false,
            next_id: 0,
            config,
        };

        let startup = Arc::new(Checkpoint::new(3));
        let startup_timeout = manager.config.startup_timeout;

        let broker = Broker::new(
            Arc::clone(&manager.registry),
            manager.broker_queue.clone(),
            manager.flags.clone(),
            Arc::clone(&manager.stats),
            manager.config.poll_interval,
        );
        let broker_startup = Arc::clone(&startup);
        manager.services.push(
            thread::Builder::new()
                .name("nodebus-broker".into())
                .spawn(move || broker.run(broker_startup, startup_timeout))?,
        );

        let relay = ProcessRelay::new(
            manager.relay_queue.clone(),
            Arc::new(manager.broker_queue.clone()),
            manager.flags.clone(),
            Arc::clone(&manager.stats),
            manager.config.poll_interval,
        );
        let relay_startup = Arc::clone(&startup);
        manager.services.push(
            thread::Builder::new()
                .name("nodebus-relay".into())
                .spawn(move || relay.run(relay_startup, startup_timeout))?,
        );

        match startup.wait(startup_timeout) {
            Ok(_) => info!(
                poll_interval = ?manager.config.poll_interval,
                broker_capacity = manager.config.broker_capacity,
                relay_capacity = manager.config.relay_capacity,
                "Manager ready"
            ),
            Err(e) => warn!(error = %e, "Broker and relay slow to start, proceeding"),
        }

        Ok(manager)
    }

    /// Register a node that runs `f` on its own thread.
    ///
    /// An empty name is replaced by a generated one. Returns the node name.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if the name is taken, or `AlreadyStarted`
    /// after [`start_all`](Self::start_all).
    pub fn register_thread<F>(&mut self, name: &str, f: F) -> Result<NodeId, BusError>
    where
        F: FnOnce(&NodeContext) + Send + 'static,
    {
        let record = self.register(name, ExecutionKind::Thread)?;
        let name = record.name().to_string();
        self.pending_threads.push(PendingThread {
            record,
            body: Box::new(f),
        });
        Ok(name)
    }

    /// Register a node that runs process table entry `entry` in a child
    /// process, passing it `args` as JSON.
    ///
    /// The child's link listener is bound here so that starting needs no
    /// further setup.
    ///
    /// # Errors
    ///
    /// Same as [`register_thread`](Self::register_thread), plus argument
    /// encoding and listener errors.
    pub fn register_process<A: Serialize>(
        &mut self,
        name: &str,
        entry: &str,
        args: A,
    ) -> Result<NodeId, BusError> {
        if self.started {
            return Err(BusError::AlreadyStarted);
        }
        let args = serde_json::to_string(&args)?;
        let listener = LoopbackListener::bind()?;

        let record = self.register(name, ExecutionKind::Process)?;
        let name = record.name().to_string();
        debug!(node = %name, entry = %entry, link = %listener.local_addr(), "Link listener bound");
        self.pending_processes.push(PendingProcess {
            record,
            listener,
            entry: entry.to_string(),
            args,
        });
        Ok(name)
    }

    fn register(&mut self, name: &str, kind: ExecutionKind) -> Result<Arc<NodeRecord>, BusError> {
        if self.started {
            return Err(BusError::AlreadyStarted);
        }
        let name = if name.is_empty() {
            self.generate_name(kind)
        } else {
            name.to_string()
        };
        if self.registry.contains(&name) {
            return Err(BusError::DuplicateNode(name));
        }

        let record = Arc::new(NodeRecord::new(name, kind, self.config.inbound_capacity));
        self.registry.insert(Arc::clone(&record))?;
        record.track_liveness();
        info!(node = %record.name(), kind = %kind, "Node registered");
        Ok(record)
    }

    fn generate_name(&mut self, kind: ExecutionKind) -> String {
        loop {
            self.next_id += 1;
            let name = format!("node-{}-{}", self.next_id, kind.suffix());
            if !self.registry.contains(&name) {
                return name;
            }
        }
    }

    /// Add a group of `nodes` nodes that meet at setup and ready checkpoints.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGroup` if the name is taken.
    pub fn add_group(&mut self, name: &str, nodes: usize) -> Result<(), BusError> {
        if !self.groups.insert(NodeGroup::new(name, nodes)) {
            return Err(BusError::DuplicateGroup(name.to_string()));
        }
        debug!(group = %name, nodes, "Group added");
        Ok(())
    }

    /// Meet `group`'s nodes at the setup checkpoint.
    ///
    /// Returns `false` if the checkpoint timed out or broke.
    ///
    /// # Errors
    ///
    /// Returns `UnknownGroup` if there is no such group.
    pub fn release_setup(&self, group: &str, timeout: Duration) -> Result<bool, BusError> {
        self.release(group, Phase::Setup, timeout)
    }

    /// Meet `group`'s nodes at the ready checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `UnknownGroup` if there is no such group.
    pub fn release_ready(&self, group: &str, timeout: Duration) -> Result<bool, BusError> {
        self.release(group, Phase::Ready, timeout)
    }

    fn release(&self, name: &str, phase: Phase, timeout: Duration) -> Result<bool, BusError> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| BusError::UnknownGroup(name.to_string()))?;
        match group.arrive(phase, timeout) {
            Ok(()) => {
                info!(group = %name, phase = %phase, "Group released");
                Ok(true)
            }
            Err(e) => {
                warn!(group = %name, phase = %phase, error = %e, "Group release failed");
                Ok(false)
            }
        }
    }

    /// Start every registered node.
    ///
    /// Every thread and child is created first; both start gates are then
    /// opened together. Nodes that failed to start are marked dead and the
    /// first failure is returned once the rest are running.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call, or the first spawn error.
    pub fn start_all(&mut self) -> Result<(), BusError> {
        if self.started {
            return Err(BusError::AlreadyStarted);
        }
        self.started = true;

        let thread_gate = StartGate::new();
        let process_gate = StartGate::new();
        let mut first_error = None;

        for pending in mem::take(&mut self.pending_threads) {
            match self.spawn_thread(pending, thread_gate.clone()) {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    error!(error = %e, "Thread node failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        let pending_processes = mem::take(&mut self.pending_processes);
        if !pending_processes.is_empty() {
            match self.child_program() {
                Ok(program) => {
                    let shared = Arc::new(self.link_shared());
                    for pending in pending_processes {
                        match pending.launch(&program, process_gate.clone(), Arc::clone(&shared)) {
                            Ok(handle) => self.processes.push(handle),
                            Err(e) => {
                                error!(error = %e, "Process node failed to start");
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "No program to start process nodes with");
                    for pending in pending_processes {
                        pending.record.mark_dead();
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        thread_gate.open();
        process_gate.open();
        info!(
            threads = self.threads.len(),
            processes = self.processes.len(),
            "Nodes started"
        );

        first_error.map_or(Ok(()), Err)
    }

    fn spawn_thread(&self, pending: PendingThread, gate: StartGate) -> Result<ThreadHandle, BusError> {
        let PendingThread { record, body } = pending;
        let exit = self.flags.thread.clone();
        let ctx = NodeContext::for_record(
            &record,
            Arc::new(self.broker_queue.clone()),
            exit.clone(),
            Arc::clone(&self.groups) as Arc<dyn Rendezvous>,
            self.config.timings(),
        );
        let poll = self.config.poll_interval;
        let node = Arc::clone(&record);
        record.state().advance(NodeState::WaitingToStart);

        let spawned = thread::Builder::new()
            .name(record.name().to_string())
            .spawn(move || {
                let _alive = AliveGuard(Arc::clone(&node));
                while !gate.wait_timeout(poll) {
                    if exit.is_set() {
                        debug!(node = %node.name(), "Exit before start");
                        return;
                    }
                }
                node.state().advance(NodeState::Running);
                debug!(node = %node.name(), "Thread node running");

                let _guard = context::enter(ctx.clone());
                body(&ctx);
                debug!(node = %node.name(), "Thread node returned");
            });

        match spawned {
            Ok(handle) => Ok(ThreadHandle { record, handle }),
            Err(e) => {
                record.mark_dead();
                Err(e.into())
            }
        }
    }

    fn child_program(&self) -> Result<ChildProgram, BusError> {
        let program = match &self.config.child_program {
            Some(program) => program.clone(),
            None => env::current_exe()?,
        };
        let args = self
            .config
            .child_args
            .clone()
            .unwrap_or_else(|| env::args().skip(1).collect());
        Ok(ChildProgram { program, args })
    }

    fn link_shared(&self) -> LinkShared {
        LinkShared {
            relay: self.relay_queue.clone(),
            flags: self.flags.clone(),
            groups: Arc::clone(&self.groups),
            stats: Arc::clone(&self.stats),
            timings: self.config.timings(),
            connect_timeout: self.config.connect_timeout,
            inbound_capacity: self.config.inbound_capacity,
        }
    }

    /// Set both exit flags. Safe to call any number of times.
    pub fn exit_all(&self) {
        let thread = self.flags.thread.set();
        let process = self.flags.process.set();
        if thread || process {
            info!("Exit requested for all nodes");
        }
        for record in self.registry.records() {
            record.state().advance(NodeState::ExitRequested);
        }
    }

    /// Wait for every node to finish, thread nodes first.
    ///
    /// Does not request exit; nodes that never check
    /// [`is_exiting`](NodeContext::is_exiting) block this call.
    pub fn join_all(&mut self) {
        for ThreadHandle { record, handle } in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(node = %record.name(), "Thread node panicked");
            }
            finish(&record);
        }

        for handle in self.processes.drain(..) {
            let record = Arc::clone(handle.record());
            handle.join();
            finish(&record);
        }

        // Registered but never started.
        for PendingThread { record, .. } in self.pending_threads.drain(..) {
            finish(&record);
        }
        for pending in self.pending_processes.drain(..) {
            finish(&pending.record);
        }

        let broker = self.broker_queue.drain();
        let relay = self.relay_queue.drain();
        if broker + relay > 0 {
            debug!(broker, relay, "Discarded undelivered envelopes");
        }
    }

    /// Get a node's state.
    #[must_use]
    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.registry.get(name).map(|record| record.state().get())
    }

    /// Get every node name, sorted.
    #[must_use]
    pub fn node_names(&self) -> Vec<NodeId> {
        self.registry
            .records()
            .iter()
            .map(|record| record.name().to_string())
            .collect()
    }

    /// Get the current queue depths.
    #[must_use]
    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            broker: self.broker_queue.len(),
            relay: self.relay_queue.len(),
            nodes: self
                .registry
                .records()
                .iter()
                .map(|record| NodeQueueDepth {
                    name: record.name().to_string(),
                    kind: record.kind(),
                    inbound: record.inbound().len(),
                    command: record.command().len(),
                })
                .collect(),
        }
    }

    /// Get the bus counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether either exit flag is set.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.flags.any_set()
    }
}

fn finish(record: &NodeRecord) {
    record.mark_dead();
    let drained = record.drain();
    record.state().advance(NodeState::Joined);
    debug!(node = %record.name(), drained, "Node joined");
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.exit_all();
        self.join_all();
        for service in self.services.drain(..) {
            if service.join().is_err() {
                error!("Bus service thread panicked");
            }
        }
        self.broker_queue.drain();
        self.relay_queue.drain();
        debug!("Manager stopped");
    }
}
