//! Process nodes.
//!
//! A process node runs in a child OS process started by re-executing the
//! current program with [`NODE_ENV`] and [`LINK_ENV`] set. The child must
//! call [`dispatch`] early in `main`; it connects back to the manager over
//! a loopback link, runs the entry function named in the handshake, and
//! exits.
//!
//! ```text
//!   manager process                              child process
//!  ┌────────────────────────────┐   link   ┌──────────────────────────┐
//!  │ inbound/command ─▶ writer  │─────────▶│ pump ─▶ inbound/command  │
//!  │ relay queue ◀──── reader   │◀─────────│ drain ◀───── LinkSink    │
//!  └────────────────────────────┘          └──────────────────────────┘
//! ```

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use nodebus_protocol::{Frame, Phase, PROTOCOL_VERSION};
use nodebus_transport::{
    FrameSink, FrameSource, LinkReader, LinkWriter, LoopbackLink, LoopbackListener,
    TransportError,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::BusStats;
use crate::context;
use crate::error::BusError;
use crate::message::{Envelope, Reply};
use crate::node::{ExecutionKind, NodeContext, NodeRecord, NodeState, StateCell, Timings};
use crate::queue::{MemoryQueue, QueueError, Sink};
use crate::signal::{CheckpointError, ExitFlag, ExitFlags, GroupTable, Rendezvous, StartGate};

/// Environment variable carrying the child's node name.
pub const NODE_ENV: &str = "NODEBUS_NODE";

/// Environment variable carrying the manager's link address.
pub const LINK_ENV: &str = "NODEBUS_LINK";

/// How long a child waits for the manager during the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point of a process node.
pub type ProcessEntry = fn(&NodeContext, serde_json::Value);

/// Process entry points by name.
///
/// Both the manager and the child build the same table; only names and
/// JSON arguments cross the process boundary.
#[derive(Clone, Default)]
pub struct ProcessTable {
    entries: HashMap<String, ProcessEntry>,
}

impl ProcessTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, entry: ProcessEntry) -> Self {
        self.insert(name, entry);
        self
    }

    /// Add an entry, replacing any previous one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, entry: ProcessEntry) -> Option<ProcessEntry> {
        self.entries.insert(name.into(), entry)
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProcessEntry> {
        self.entries.get(name).copied()
    }

    /// Get the entry names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Run this process as a process node if it was started as one.
///
/// Returns `Ok(false)` in an ordinary process, and `Ok(true)` in a child
/// once its entry function has returned and the link is closed.
///
/// # Errors
///
/// Returns an error if the link or handshake fails, or the requested entry
/// is not in `table`.
pub fn dispatch(table: &ProcessTable) -> Result<bool, BusError> {
    let Ok(node) = env::var(NODE_ENV) else {
        return Ok(false);
    };
    let link = env::var(LINK_ENV)
        .map_err(|_| BusError::Handshake(format!("{LINK_ENV} is not set")))?;
    let addr: SocketAddr = link
        .parse()
        .map_err(|_| BusError::Handshake(format!("invalid link address {link:?}")))?;

    run_child(table, &node, addr)?;
    Ok(true)
}

fn run_child(table: &ProcessTable, node: &str, addr: SocketAddr) -> Result<(), BusError> {
    let (writer, mut reader) = LoopbackLink::connect(addr, HANDSHAKE_TIMEOUT)?.split()?;
    writer.send_frame(&Frame::hello(node, PROTOCOL_VERSION), None)?;

    let (entry, args, timings, inbound_capacity, outbound_capacity) =
        match reader.recv_frame(Some(HANDSHAKE_TIMEOUT))? {
            Some(Frame::Welcome {
                entry,
                args,
                poll_interval_ms,
                inbound_capacity,
                outbound_capacity,
                publish_timeout_us,
            }) => {
                let timings = Timings {
                    poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
                    publish_timeout: Duration::from_micros(publish_timeout_us),
                };
                (
                    entry,
                    args,
                    timings,
                    inbound_capacity as usize,
                    outbound_capacity as usize,
                )
            }
            Some(other) => {
                return Err(BusError::Handshake(format!(
                    "expected welcome, got {:?}",
                    other.frame_type()
                )))
            }
            None => return Err(BusError::Handshake("link closed before welcome".into())),
        };

    let Some(run) = table.get(&entry) else {
        let _ = writer.send_frame(&Frame::Goodbye, None);
        return Err(BusError::UnknownEntry(entry));
    };
    let args: serde_json::Value = serde_json::from_str(&args)?;

    let sink: Arc<dyn FrameSink> = writer.clone();
    let inbound = MemoryQueue::bounded(inbound_capacity);
    let command = MemoryQueue::bounded(1);
    let exit = ExitFlag::new();
    let gate = StartGate::new();
    let state = Arc::new(StateCell::new());
    let (released_tx, released_rx) = crossbeam_channel::bounded(1);
    let (outbound, drain) = LinkSink::spawn(node, Arc::clone(&sink), outbound_capacity)?;

    let ctx = NodeContext::new(
        node,
        ExecutionKind::Process,
        inbound.clone(),
        command.clone(),
        Arc::new(outbound),
        exit.clone(),
        Arc::new(RemoteRendezvous::new(
            Arc::clone(&sink),
            released_rx,
            timings.poll_interval,
        )),
        Arc::clone(&state),
        timings,
    );
    state.advance(NodeState::WaitingToStart);

    let pump = ChildPump {
        node: node.to_string(),
        inbound,
        command,
        exit: exit.clone(),
        gate: gate.clone(),
        released: released_tx,
        writer: Arc::clone(&sink),
        poll: timings.poll_interval,
    };
    let pump = thread::Builder::new()
        .name(format!("{node}-link"))
        .spawn(move || pump.run(reader))?;

    while !gate.wait_timeout(timings.poll_interval) {
        if exit.is_set() {
            break;
        }
    }

    if gate.is_open() {
        state.advance(NodeState::Running);
        info!(node = %node, entry = %entry, "Process node running");
        let _guard = context::enter(ctx.clone());
        run(&ctx, args);
    } else {
        warn!(node = %node, "Link closed before start");
    }

    if !drain.finish() {
        error!(node = %node, "Link drain panicked");
    }
    if let Err(e) = writer.send_frame(&Frame::Goodbye, None) {
        debug!(node = %node, error = %e, "Goodbye not sent");
    }
    writer.close();
    if pump.join().is_err() {
        error!(node = %node, "Link pump panicked");
    }
    state.advance(NodeState::Joined);
    Ok(())
}

/// Child side reader: feeds frames from the manager into local queues.
struct ChildPump {
    node: String,
    inbound: MemoryQueue<Envelope>,
    command: MemoryQueue<Reply>,
    exit: ExitFlag,
    gate: StartGate,
    released: Sender<bool>,
    writer: Arc<dyn FrameSink>,
    poll: Duration,
}

impl ChildPump {
    fn run<S: FrameSource>(self, mut source: S) {
        let mut exit_announced = false;

        loop {
            if !exit_announced && self.exit.is_set() {
                exit_announced = true;
                if let Err(e) = self.writer.send_frame(&Frame::Exit, Some(self.poll)) {
                    debug!(node = %self.node, error = %e, "Exit not announced");
                }
            }

            match source.recv_frame(Some(self.poll)) {
                Ok(Some(frame)) => exit_announced |= self.handle(frame),
                Ok(None) => {
                    debug!(node = %self.node, "Manager closed the link");
                    break;
                }
                Err(TransportError::Timeout) => {}
                Err(e) => {
                    warn!(node = %self.node, error = %e, "Link failed");
                    break;
                }
            }
        }

        self.exit.set();
    }

    /// Returns `true` if the frame was an exit request from the manager.
    fn handle(&self, frame: Frame) -> bool {
        let frame = match Envelope::try_from(frame) {
            Ok(envelope) => {
                if let Err(e) = self.inbound.try_push(envelope) {
                    debug!(node = %self.node, error = %e, "Dropped inbound envelope");
                }
                return false;
            }
            Err(frame) => frame,
        };

        match frame {
            Frame::Reply { request, ok } => {
                let reply = Reply {
                    request,
                    accepted: ok,
                };
                if self.command.try_push(reply).is_err() {
                    debug!(node = %self.node, request, "Reply lost");
                }
            }
            Frame::Start => self.gate.open(),
            Frame::CheckpointReleased { ok } => {
                let _ = self.released.try_send(ok);
            }
            Frame::Exit => {
                self.exit.set();
                return true;
            }
            other => {
                warn!(node = %self.node, frame_type = ?other.frame_type(), "Unexpected frame from manager");
            }
        }
        false
    }
}

/// Outbound sink of a process node.
///
/// Envelopes wait in a bounded queue until a drain thread writes them to
/// the link. A manager that stops reading fills the queue, and publishers
/// then see `Full` or `Timeout` as they would on a thread node.
pub struct LinkSink {
    queue: MemoryQueue<Envelope>,
    writer: Arc<dyn FrameSink>,
}

impl LinkSink {
    /// Create a sink of `capacity` envelopes and start draining it.
    ///
    /// # Errors
    ///
    /// Returns an error if the drain thread cannot be spawned.
    pub fn spawn(
        node: &str,
        writer: Arc<dyn FrameSink>,
        capacity: usize,
    ) -> Result<(Self, LinkDrain), BusError> {
        let queue = MemoryQueue::bounded(capacity);
        let (close, closed) = crossbeam_channel::bounded(0);
        let drain = Drain {
            node: node.to_string(),
            queue: queue.clone(),
            writer: Arc::clone(&writer),
            closed,
        };
        let thread = thread::Builder::new()
            .name(format!("{node}-drain"))
            .spawn(move || drain.run())?;

        Ok((Self { queue, writer }, LinkDrain { close, thread }))
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.writer.is_open() {
            Ok(())
        } else {
            Err(QueueError::Disconnected)
        }
    }
}

impl Sink<Envelope> for LinkSink {
    fn try_push(&self, item: Envelope) -> Result<(), QueueError> {
        self.check_open()?;
        self.queue.try_push(item)
    }

    fn push_timeout(&self, item: Envelope, timeout: Duration) -> Result<(), QueueError> {
        self.check_open()?;
        self.queue.push_timeout(item, timeout)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The drain thread behind a [`LinkSink`].
pub struct LinkDrain {
    close: Sender<()>,
    thread: JoinHandle<()>,
}

impl LinkDrain {
    /// Write what is still queued, then stop.
    ///
    /// Returns `false` if the drain thread panicked.
    pub fn finish(self) -> bool {
        drop(self.close);
        self.thread.join().is_ok()
    }
}

struct Drain {
    node: String,
    queue: MemoryQueue<Envelope>,
    writer: Arc<dyn FrameSink>,
    closed: Receiver<()>,
}

impl Drain {
    fn run(self) {
        let queue = self.queue.receiver().clone();
        loop {
            select! {
                recv(queue) -> envelope => match envelope {
                    Ok(envelope) => {
                        if !self.send(envelope) {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                recv(self.closed) -> _ => break,
            }
        }

        while let Ok(envelope) = self.queue.try_pop() {
            if !self.send(envelope) {
                return;
            }
        }
    }

    /// Returns `false` once the link is unusable.
    fn send(&self, envelope: Envelope) -> bool {
        match self.writer.send_frame(&Frame::from(envelope), None) {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                debug!(node = %self.node, error = %e, "Link drain stopped");
                false
            }
            Err(_) => true,
        }
    }
}

/// Checkpoints reached through the manager.
struct RemoteRendezvous {
    writer: Arc<dyn FrameSink>,
    released: Receiver<bool>,
    serial: Mutex<()>,
    grace: Duration,
}

impl RemoteRendezvous {
    fn new(writer: Arc<dyn FrameSink>, released: Receiver<bool>, grace: Duration) -> Self {
        Self {
            writer,
            released,
            serial: Mutex::new(()),
            grace,
        }
    }
}

impl Rendezvous for RemoteRendezvous {
    fn arrive(&self, group: &str, phase: Phase, timeout: Duration) -> Result<(), CheckpointError> {
        let _serial = self.serial.lock();
        while self.released.try_recv().is_ok() {}

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self
            .writer
            .send_frame(&Frame::checkpoint(group, phase, timeout_ms), None)
        {
            warn!(group = %group, error = %e, "Checkpoint arrival not sent");
            return Err(CheckpointError::Broken);
        }

        match self.released.recv_timeout(timeout + self.grace) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CheckpointError::Broken),
            Err(_) => Err(CheckpointError::Timeout),
        }
    }
}

/// Program and arguments used to start children.
#[derive(Debug, Clone)]
pub(crate) struct ChildProgram {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildProgram {
    fn command(&self, node: &str, addr: SocketAddr) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(NODE_ENV, node)
            .env(LINK_ENV, addr.to_string())
            .stdin(Stdio::null());
        command
    }
}

/// State shared by every parent-side link.
pub(crate) struct LinkShared {
    pub relay: MemoryQueue<Envelope>,
    pub flags: ExitFlags,
    pub groups: Arc<GroupTable>,
    pub stats: Arc<BusStats>,
    pub timings: Timings,
    pub connect_timeout: Duration,
    pub inbound_capacity: usize,
}

/// A registered process node that has not been started.
pub(crate) struct PendingProcess {
    pub record: Arc<NodeRecord>,
    pub listener: LoopbackListener,
    pub entry: String,
    pub args: String,
}

impl PendingProcess {
    /// Spawn the child and its link thread.
    pub(crate) fn launch(
        self,
        program: &ChildProgram,
        gate: StartGate,
        shared: Arc<LinkShared>,
    ) -> Result<ProcessHandle, BusError> {
        let name = self.record.name().to_string();
        let addr = self.listener.local_addr();

        let mut child = match program.command(&name, addr).spawn() {
            Ok(child) => child,
            Err(source) => {
                self.record.mark_dead();
                return Err(BusError::Spawn { node: name, source });
            }
        };
        debug!(node = %name, pid = child.id(), link = %addr, "Process node spawned");

        let stop = Arc::new(AtomicBool::new(false));
        let record = Arc::clone(&self.record);
        let link = ParentLink {
            record: self.record,
            listener: self.listener,
            entry: self.entry,
            args: self.args,
            gate,
            shared,
            stop: Arc::clone(&stop),
        };

        match thread::Builder::new()
            .name(format!("{name}-link"))
            .spawn(move || link.run())
        {
            Ok(link) => Ok(ProcessHandle {
                record,
                child,
                link: Some(link),
                stop,
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                record.mark_dead();
                Err(e.into())
            }
        }
    }
}

/// A started process node.
pub(crate) struct ProcessHandle {
    record: Arc<NodeRecord>,
    child: Child,
    link: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn record(&self) -> &Arc<NodeRecord> {
        &self.record
    }

    /// Wait for the child to exit, then close its link.
    pub(crate) fn join(mut self) {
        let name = self.record.name().to_string();
        match self.child.wait() {
            Ok(status) if status.success() => debug!(node = %name, "Process node exited"),
            Ok(status) => warn!(node = %name, status = %status, "Process node exited abnormally"),
            Err(e) => warn!(node = %name, error = %e, "Failed to wait for process node"),
        }

        self.stop.store(true, Ordering::Release);
        if let Some(link) = self.link.take() {
            if link.join().is_err() {
                error!(node = %name, "Link thread panicked");
            }
        }
        self.record.mark_dead();
    }
}

/// Manager side of one process node's link.
struct ParentLink {
    record: Arc<NodeRecord>,
    listener: LoopbackListener,
    entry: String,
    args: String,
    gate: StartGate,
    shared: Arc<LinkShared>,
    stop: Arc<AtomicBool>,
}

impl ParentLink {
    fn run(self) {
        if let Err(e) = self.serve() {
            warn!(node = %self.record.name(), error = %e, "Process link failed");
        }
        self.record.mark_dead();
        debug!(node = %self.record.name(), "Process link closed");
    }

    fn serve(&self) -> Result<(), BusError> {
        let link = self
            .listener
            .accept_timeout(self.shared.connect_timeout, &self.stop)?;
        let (writer, mut reader) = link.split()?;
        let result = self.session(&writer, &mut reader);
        writer.close();
        result
    }

    fn session(&self, writer: &Arc<LinkWriter>, reader: &mut LinkReader) -> Result<(), BusError> {
        self.handshake(writer, reader)?;

        let poll = self.shared.timings.poll_interval;
        while !self.gate.wait_timeout(poll) {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
        }
        writer.send_frame(&Frame::Start, None)?;
        self.record.state().advance(NodeState::Running);
        info!(node = %self.record.name(), "Process node started");

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let done = Arc::new(AtomicBool::new(false));
        let forwarder = Forwarder {
            record: Arc::clone(&self.record),
            writer: Arc::clone(writer),
            control: control_rx,
            exit: self.shared.flags.process.clone(),
            done: Arc::clone(&done),
            poll,
        };
        let forwarder = thread::Builder::new()
            .name(format!("{}-writer", self.record.name()))
            .spawn(move || forwarder.run())?;

        let result = self.pump(reader, &control_tx);
        done.store(true, Ordering::Release);
        if forwarder.join().is_err() {
            error!(node = %self.record.name(), "Link writer panicked");
        }
        result
    }

    fn handshake(&self, writer: &LinkWriter, reader: &mut LinkReader) -> Result<(), BusError> {
        let expected = self.record.name();
        match reader.recv_frame(Some(self.shared.connect_timeout))? {
            Some(Frame::Hello { node, version }) => {
                if node != expected {
                    return Err(BusError::Handshake(format!(
                        "expected node {expected}, got {node}"
                    )));
                }
                PROTOCOL_VERSION
                    .check_peer(version)
                    .map_err(|e| BusError::Handshake(e.to_string()))?;
            }
            Some(other) => {
                return Err(BusError::Handshake(format!(
                    "expected hello, got {:?}",
                    other.frame_type()
                )))
            }
            None => return Err(BusError::Handshake("link closed before hello".into())),
        }

        let timings = self.shared.timings;
        writer.send_frame(
            &Frame::Welcome {
                entry: self.entry.clone(),
                args: self.args.clone(),
                poll_interval_ms: u64::try_from(timings.poll_interval.as_millis()).unwrap_or(u64::MAX),
                inbound_capacity: u32::try_from(self.shared.inbound_capacity).unwrap_or(u32::MAX),
                outbound_capacity: u32::try_from(self.shared.relay.capacity()).unwrap_or(u32::MAX),
                publish_timeout_us: u64::try_from(timings.publish_timeout.as_micros())
                    .unwrap_or(u64::MAX),
            },
            None,
        )?;

        debug!(node = %expected, entry = %self.entry, "Handshake complete");
        Ok(())
    }

    fn pump(&self, reader: &mut LinkReader, control: &Sender<Frame>) -> Result<(), BusError> {
        let name = self.record.name();
        let poll = self.shared.timings.poll_interval;

        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let frame = match reader.recv_frame(Some(poll)) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(node = %name, "Process node closed its link");
                    return Ok(());
                }
                Err(TransportError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            };

            let frame = match Envelope::try_from(frame) {
                Ok(envelope) => {
                    self.relay(envelope);
                    continue;
                }
                Err(frame) => frame,
            };

            match frame {
                Frame::Exit => {
                    if self.shared.flags.process.set() {
                        info!(node = %name, "Process node requested exit");
                    }
                    self.record.state().advance(NodeState::ExitRequested);
                }
                Frame::Checkpoint {
                    group,
                    phase,
                    timeout_ms,
                } => self.checkpoint(group, phase, Duration::from_millis(timeout_ms), control),
                Frame::Goodbye => {
                    debug!(node = %name, "Process node said goodbye");
                    return Ok(());
                }
                other => {
                    warn!(node = %name, frame_type = ?other.frame_type(), "Unexpected frame from process node");
                }
            }
        }
    }

    fn relay(&self, envelope: Envelope) {
        if envelope.sender != self.record.name() {
            self.shared.stats.record_dropped("sender");
            warn!(node = %self.record.name(), sender = %envelope.sender, "Dropped envelope sent under another name");
            return;
        }
        if let Err(e) = self
            .shared
            .relay
            .push_timeout(envelope, self.shared.timings.poll_interval)
        {
            self.shared.stats.record_dropped("relay");
            warn!(node = %self.record.name(), error = %e, "Relay queue full, envelope dropped");
        }
    }

    /// Wait at the checkpoint on the child's behalf without stalling the link.
    fn checkpoint(&self, group: String, phase: Phase, timeout: Duration, control: &Sender<Frame>) {
        let node = self.record.name().to_string();
        let groups = Arc::clone(&self.shared.groups);
        let reply = control.clone();

        let spawned = thread::Builder::new()
            .name(format!("{node}-checkpoint"))
            .spawn(move || {
                let ok = match groups.arrive(&group, phase, timeout) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(node = %node, group = %group, phase = %phase, error = %e, "Checkpoint failed");
                        false
                    }
                };
                let _ = reply.send(Frame::CheckpointReleased { ok });
            });

        if let Err(e) = spawned {
            warn!(node = %self.record.name(), error = %e, "Checkpoint thread not spawned");
            let _ = control.send(Frame::CheckpointReleased { ok: false });
        }
    }
}

/// Writes the node's inbound envelopes, replies and control frames.
struct Forwarder {
    record: Arc<NodeRecord>,
    writer: Arc<LinkWriter>,
    control: Receiver<Frame>,
    exit: ExitFlag,
    done: Arc<AtomicBool>,
    poll: Duration,
}

impl Forwarder {
    fn run(self) {
        let inbound = self.record.inbound().receiver().clone();
        let command = self.record.command().receiver().clone();
        let mut exit_sent = false;

        while !self.done.load(Ordering::Acquire) {
            if !exit_sent && self.exit.is_set() {
                exit_sent = true;
                self.record.state().advance(NodeState::ExitRequested);
                debug!(node = %self.record.name(), "Forwarding exit");
                if !self.send(&Frame::Exit) {
                    break;
                }
            }

            let frame = select! {
                recv(inbound) -> envelope => envelope.ok().map(Frame::from),
                recv(command) -> reply => reply.ok().map(Frame::from),
                recv(self.control) -> frame => frame.ok(),
                default(self.poll) => None,
            };

            if let Some(frame) = frame {
                if !self.send(&frame) {
                    break;
                }
            }
        }
    }

    /// Returns `false` once the link is unusable.
    fn send(&self, frame: &Frame) -> bool {
        match self.writer.send_frame(frame, None) {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                debug!(node = %self.record.name(), error = %e, "Link writer stopped");
                false
            }
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{Manager, ManagerConfig};
    use nodebus_protocol::{EnvelopeKind, Version};
    use std::time::Instant;

    const T: Option<Duration> = Some(Duration::from_secs(5));

    fn table() -> ProcessTable {
        ProcessTable::new()
            .with("arduino", arduino_entry)
            .with("echo", echo_entry)
    }

    fn arduino_entry(ctx: &NodeContext, args: serde_json::Value) {
        let topic = args["topic"].as_str().unwrap_or("arduino/recv").to_string();
        ctx.wait_setup("bridge", Duration::from_secs(10));

        let mut seq = 0u32;
        let deadline = Instant::now() + Duration::from_secs(30);
        while !ctx.is_exiting() && Instant::now() < deadline {
            ctx.publish_value(topic.as_str(), &seq);
            seq += 1;
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn echo_entry(ctx: &NodeContext, args: serde_json::Value) {
        let reply_to = args["reply_to"].as_str().unwrap_or("echo/out").to_string();
        if !ctx.subscribe("echo/in", true, Duration::from_secs(5)) {
            return;
        }
        for _ in 0..500 {
            if let Some(envelope) = ctx.receive(true, Duration::from_millis(10)).into_iter().next() {
                ctx.publish(reply_to, envelope.payload.unwrap_or_default());
                return;
            }
        }
    }

    fn test_shared() -> Arc<LinkShared> {
        Arc::new(LinkShared {
            relay: MemoryQueue::bounded(8),
            flags: ExitFlags::new(),
            groups: Arc::new(GroupTable::new()),
            stats: Arc::new(BusStats::new()),
            timings: Timings {
                poll_interval: Duration::from_millis(10),
                publish_timeout: Duration::from_millis(1),
            },
            connect_timeout: Duration::from_secs(5),
            inbound_capacity: 8,
        })
    }

    #[test]
    fn test_table_lookup() {
        let table = table();
        assert!(table.get("arduino").is_some());
        assert!(table.get("missing").is_none());
        assert_eq!(table.names(), vec!["arduino", "echo"]);
    }

    #[test]
    fn test_dispatch_outside_child() {
        // Only a spawned child carries the node variable.
        if env::var(NODE_ENV).is_err() {
            assert!(!dispatch(&table()).unwrap());
        }
    }

    #[test]
    fn test_child_session_against_fake_manager() {
        let listener = LoopbackListener::bind().unwrap();
        let addr = listener.local_addr();
        let child = thread::spawn(move || run_child(&table(), "echo-node", addr));

        let cancel = AtomicBool::new(false);
        let (writer, mut reader) = listener
            .accept_timeout(Duration::from_secs(5), &cancel)
            .unwrap()
            .split()
            .unwrap();

        assert!(matches!(
            reader.recv_frame(T).unwrap(),
            Some(Frame::Hello { ref node, .. }) if node == "echo-node"
        ));
        writer
            .send_frame(
                &Frame::Welcome {
                    entry: "echo".into(),
                    args: r#"{"reply_to":"echo/out"}"#.into(),
                    poll_interval_ms: 10,
                    inbound_capacity: 8,
                    outbound_capacity: 8,
                    publish_timeout_us: 1000,
                },
                None,
            )
            .unwrap();
        writer.send_frame(&Frame::Start, None).unwrap();

        let request = match reader.recv_frame(T).unwrap() {
            Some(Frame::Envelope { id, kind, topic, .. }) => {
                assert_eq!(kind, EnvelopeKind::Subscribe);
                assert_eq!(topic, "echo/in");
                id
            }
            other => panic!("Expected subscribe, got {:?}", other),
        };
        // An answer to some other request does not count.
        writer.send_frame(&Frame::reply(request + 1, false), None).unwrap();
        writer.send_frame(&Frame::reply(request, true), None).unwrap();
        writer
            .send_frame(
                &Frame::from(Envelope::publish("elsewhere", "echo/in", b"ping".to_vec())),
                None,
            )
            .unwrap();

        match reader.recv_frame(T).unwrap() {
            Some(Frame::Envelope {
                kind,
                sender,
                topic,
                payload,
                ..
            }) => {
                assert_eq!(kind, EnvelopeKind::Publish);
                assert_eq!(sender, "echo-node");
                assert_eq!(topic, "echo/out");
                assert_eq!(payload.unwrap().into_vec(), b"ping".to_vec());
            }
            other => panic!("Expected publish, got {:?}", other),
        }
        assert_eq!(reader.recv_frame(T).unwrap(), Some(Frame::Goodbye));

        child.join().unwrap().unwrap();
    }

    #[test]
    fn test_child_rejects_unknown_entry() {
        let listener = LoopbackListener::bind().unwrap();
        let addr = listener.local_addr();
        let child = thread::spawn(move || run_child(&table(), "n", addr));

        let cancel = AtomicBool::new(false);
        let (writer, mut reader) = listener
            .accept_timeout(Duration::from_secs(5), &cancel)
            .unwrap()
            .split()
            .unwrap();
        reader.recv_frame(T).unwrap();
        writer
            .send_frame(
                &Frame::Welcome {
                    entry: "missing".into(),
                    args: "null".into(),
                    poll_interval_ms: 10,
                    inbound_capacity: 8,
                    outbound_capacity: 8,
                    publish_timeout_us: 1000,
                },
                None,
            )
            .unwrap();

        assert_eq!(reader.recv_frame(T).unwrap(), Some(Frame::Goodbye));
        assert!(matches!(
            child.join().unwrap(),
            Err(BusError::UnknownEntry(entry)) if entry == "missing"
        ));
    }

    fn rejected_hello(hello: Frame) {
        let record = Arc::new(NodeRecord::new("expected", ExecutionKind::Process, 4));
        let listener = LoopbackListener::bind().unwrap();
        let addr = listener.local_addr();
        let link = ParentLink {
            record: Arc::clone(&record),
            listener,
            entry: "echo".into(),
            args: "null".into(),
            gate: StartGate::new(),
            shared: test_shared(),
            stop: Arc::new(AtomicBool::new(false)),
        };
        let handle = thread::spawn(move || link.run());

        let (writer, mut reader) = LoopbackLink::connect(addr, Duration::from_secs(5))
            .unwrap()
            .split()
            .unwrap();
        writer.send_frame(&hello, None).unwrap();

        // No welcome; the link is simply closed.
        assert!(matches!(
            reader.recv_frame(T),
            Ok(None) | Err(TransportError::ConnectionClosed)
        ));
        handle.join().unwrap();
        assert!(!record.is_alive());
    }

    #[test]
    fn test_parent_rejects_wrong_node() {
        rejected_hello(Frame::hello("impostor", PROTOCOL_VERSION));
    }

    #[test]
    fn test_parent_rejects_incompatible_version() {
        rejected_hello(Frame::hello("expected", Version::new(PROTOCOL_VERSION.major + 1, 0)));
    }

    /// Connect a link whose far end is accepted but handed back unread.
    fn idle_link() -> (Arc<LinkWriter>, LinkReader, LoopbackLink) {
        let listener = LoopbackListener::bind().unwrap();
        let addr = listener.local_addr();
        let peer = thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            listener.accept_timeout(Duration::from_secs(5), &cancel).unwrap()
        });
        let (writer, reader) = LoopbackLink::connect(addr, Duration::from_secs(5))
            .unwrap()
            .split()
            .unwrap();
        (writer, reader, peer.join().unwrap())
    }

    #[test]
    fn test_link_sink_drains_then_maps_closed_link() {
        let (writer, _reader, peer) = idle_link();
        let (_peer_writer, mut peer_reader) = peer.split().unwrap();

        let (sink, drain) = LinkSink::spawn("n", writer.clone(), 4).unwrap();
        sink.try_push(Envelope::publish("n", "t", vec![1u8])).unwrap();
        assert!(matches!(
            peer_reader.recv_frame(T).unwrap(),
            Some(Frame::Envelope { ref topic, .. }) if topic == "t"
        ));

        sink.try_push(Envelope::publish("n", "t/late", vec![2u8])).unwrap();
        assert!(drain.finish());
        assert!(matches!(
            peer_reader.recv_frame(T).unwrap(),
            Some(Frame::Envelope { ref topic, .. }) if topic == "t/late"
        ));

        writer.close();
        assert_eq!(
            sink.push_timeout(Envelope::publish("n", "t", vec![3u8]), Duration::from_millis(5)),
            Err(QueueError::Disconnected)
        );
    }

    #[test]
    fn test_link_sink_publish_is_bounded_when_manager_stops_reading() {
        let (writer, _reader, peer) = idle_link();
        let (sink, drain) = LinkSink::spawn("n", writer, 4).unwrap();

        let payload = vec![0u8; 256 * 1024];
        let mut refused = None;
        for _ in 0..400 {
            let started = Instant::now();
            let result = sink.push_timeout(
                Envelope::publish("n", "lidar/scan", payload.clone()),
                Duration::from_millis(1),
            );
            assert!(started.elapsed() < Duration::from_millis(500));
            if let Err(e) = result {
                refused = Some(e);
                break;
            }
        }
        assert_eq!(refused, Some(QueueError::Timeout));

        // Closing the far end unblocks the drain thread.
        drop(peer);
        assert!(drain.finish());
    }

    /// A process node publishes; a thread node subscribed at a prefix gets it.
    #[test]
    fn test_process_node_reaches_thread_node() {
        if dispatch(&table()).unwrap() {
            return;
        }

        let config = ManagerConfig {
            poll_interval: Duration::from_millis(20),
            child_args: Some(vec![
                "process::tests::test_process_node_reaches_thread_node".into(),
                "--exact".into(),
                "--nocapture".into(),
                "--test-threads=1".into(),
            ]),
            ..ManagerConfig::default()
        };
        let mut manager = Manager::new(config).unwrap();
        manager.add_group("bridge", 2).unwrap();

        let subscribed = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicBool::new(false));
        {
            let subscribed = Arc::clone(&subscribed);
            let received = Arc::clone(&received);
            manager
                .register_thread("F", move |ctx| {
                    subscribed.store(
                        ctx.subscribe("arduino", true, Duration::from_secs(5)),
                        Ordering::Release,
                    );
                    ctx.wait_setup("bridge", Duration::from_secs(20));

                    let deadline = Instant::now() + Duration::from_secs(20);
                    while Instant::now() < deadline && !ctx.is_exiting() {
                        let got = ctx.receive(true, Duration::from_millis(50));
                        if got
                            .iter()
                            .any(|e| e.topic == "arduino/recv" && e.sender == "E")
                        {
                            received.store(true, Ordering::Release);
                            break;
                        }
                    }
                    ctx.request_exit();
                })
                .unwrap();
        }
        manager
            .register_process("E", "arduino", serde_json::json!({ "topic": "arduino/recv" }))
            .unwrap();

        manager.start_all().unwrap();
        assert!(manager.release_setup("bridge", Duration::from_secs(30)).unwrap());
        manager.join_all();

        assert!(subscribed.load(Ordering::Acquire));
        assert!(received.load(Ordering::Acquire));
        assert_eq!(manager.node_state("E"), Some(NodeState::Joined));
        assert!(manager.stats().relayed > 0);
    }

    /// A thread node publishes; a process node subscribed through the broker
    /// gets it over its link and echoes it back.
    #[test]
    fn test_thread_node_reaches_process_node() {
        if dispatch(&table()).unwrap() {
            return;
        }

        let config = ManagerConfig {
            poll_interval: Duration::from_millis(20),
            child_args: Some(vec![
                "process::tests::test_thread_node_reaches_process_node".into(),
                "--exact".into(),
                "--nocapture".into(),
                "--test-threads=1".into(),
            ]),
            ..ManagerConfig::default()
        };
        let mut manager = Manager::new(config).unwrap();

        let echoed = Arc::new(Mutex::new(None));
        {
            let echoed = Arc::clone(&echoed);
            manager
                .register_thread("G", move |ctx| {
                    if !ctx.subscribe("echo/out", true, Duration::from_secs(5)) {
                        return;
                    }

                    // Publish until the echo node has subscribed and answered.
                    let deadline = Instant::now() + Duration::from_secs(20);
                    while Instant::now() < deadline && !ctx.is_exiting() {
                        ctx.publish("echo/in", b"ping".to_vec());
                        let got = ctx.receive(true, Duration::from_millis(50));
                        if let Some(envelope) = got.into_iter().find(|e| e.sender == "H") {
                            *echoed.lock() = Some(envelope.payload().to_vec());
                            break;
                        }
                    }
                    ctx.request_exit();
                })
                .unwrap();
        }
        manager
            .register_process("H", "echo", serde_json::json!({ "reply_to": "echo/out" }))
            .unwrap();

        manager.start_all().unwrap();
        manager.join_all();

        assert_eq!(echoed.lock().as_deref(), Some(&b"ping"[..]));
        assert_eq!(manager.node_state("H"), Some(NodeState::Joined));
        let stats = manager.stats();
        assert!(stats.subscriptions >= 2);
        assert!(stats.relayed > 0);
        assert!(stats.delivered >= 2);
    }
}
