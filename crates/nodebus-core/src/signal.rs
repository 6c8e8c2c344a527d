//! Exit flags, start gates and group checkpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nodebus_protocol::Phase;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::node::ExecutionKind;

/// One-way shutdown flag shared by every node of one execution kind.
///
/// Once set it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` if this call set it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Check the flag.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The pair of exit flags owned by a manager.
#[derive(Debug, Clone, Default)]
pub struct ExitFlags {
    /// Shared by thread nodes.
    pub thread: ExitFlag,
    /// Shared by process nodes.
    pub process: ExitFlag,
}

impl ExitFlags {
    /// Create both flags unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the flag for an execution kind.
    #[must_use]
    pub fn for_kind(&self, kind: ExecutionKind) -> &ExitFlag {
        match kind {
            ExecutionKind::Thread => &self.thread,
            ExecutionKind::Process => &self.process,
        }
    }

    /// Whether either flag is set.
    #[must_use]
    pub fn any_set(&self) -> bool {
        self.thread.is_set() || self.process.is_set()
    }

    /// Set both flags.
    pub fn set_all(&self) {
        self.thread.set();
        self.process.set();
    }
}

/// One-shot event released once by the manager.
#[derive(Debug, Clone, Default)]
pub struct StartGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StartGate {
    /// Create a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate, waking every waiter.
    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    /// Check whether the gate is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Wait up to `timeout` for the gate to open.
    ///
    /// Returns whether the gate is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut open = lock.lock();
        while !*open {
            if cvar.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
        *open
    }
}

/// Checkpoint errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// This waiter gave up, breaking the checkpoint for everyone.
    #[error("Checkpoint timed out")]
    Timeout,

    /// Another waiter gave up first.
    #[error("Checkpoint broken")]
    Broken,

    /// No group with this name.
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
}

#[derive(Debug, Default)]
struct CheckpointState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// A reusable barrier whose waits are bounded.
///
/// A waiter that times out breaks the checkpoint: everyone blocked on the
/// same generation, and every later arrival, fails with `Broken`.
#[derive(Debug)]
pub struct Checkpoint {
    parties: usize,
    state: Mutex<CheckpointState>,
    cvar: Condvar,
}

impl Checkpoint {
    /// Create a checkpoint released by `parties` arrivals.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(CheckpointState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Get the number of arrivals needed.
    #[must_use]
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Whether a waiter has timed out.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Arrive and wait up to `timeout` for the other parties.
    ///
    /// Returns `true` for the arrival that released the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if this call gave up, `Broken` if another did.
    pub fn wait(&self, timeout: Duration) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(CheckpointError::Broken);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let timed_out = self.cvar.wait_until(&mut state, deadline).timed_out();
            if state.generation != generation {
                return Ok(false);
            }
            if state.broken {
                return Err(CheckpointError::Broken);
            }
            if timed_out {
                state.broken = true;
                self.cvar.notify_all();
                return Err(CheckpointError::Timeout);
            }
        }
    }
}

/// Setup and ready checkpoints for a group of nodes.
///
/// Each checkpoint needs one arrival per node plus one from the manager.
#[derive(Debug)]
pub struct NodeGroup {
    name: String,
    nodes: usize,
    setup: Checkpoint,
    ready: Checkpoint,
}

impl NodeGroup {
    /// Create a group of `nodes` nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: usize) -> Self {
        Self {
            name: name.into(),
            nodes,
            setup: Checkpoint::new(nodes + 1),
            ready: Checkpoint::new(nodes + 1),
        }
    }

    /// Get the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of nodes in the group.
    #[must_use]
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Get the checkpoint for a phase.
    #[must_use]
    pub fn checkpoint(&self, phase: Phase) -> &Checkpoint {
        match phase {
            Phase::Setup => &self.setup,
            Phase::Ready => &self.ready,
        }
    }

    /// Arrive at a phase checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint timed out or was broken.
    pub fn arrive(&self, phase: Phase, timeout: Duration) -> Result<(), CheckpointError> {
        let released = self.checkpoint(phase).wait(timeout)?;
        if released {
            debug!(group = %self.name, phase = %phase, "Checkpoint released");
        }
        Ok(())
    }
}

/// Something a node can meet its group at.
pub trait Rendezvous: Send + Sync {
    /// Arrive at `group`'s `phase` checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the group is unknown or the wait failed.
    fn arrive(&self, group: &str, phase: Phase, timeout: Duration) -> Result<(), CheckpointError>;
}

/// Groups registered with a manager, keyed by name.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: DashMap<String, Arc<NodeGroup>>,
}

impl GroupTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group. Returns `false` if the name is taken.
    pub fn insert(&self, group: NodeGroup) -> bool {
        match self.groups.entry(group.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(group));
                true
            }
        }
    }

    /// Look up a group.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NodeGroup>> {
        self.groups.get(name).map(|g| Arc::clone(g.value()))
    }
}

impl Rendezvous for GroupTable {
    fn arrive(&self, group: &str, phase: Phase, timeout: Duration) -> Result<(), CheckpointError> {
        // Clone out of the map so no shard lock is held while waiting.
        let Some(entry) = self.get(group) else {
            warn!(group = %group, "Arrival at unknown group");
            return Err(CheckpointError::UnknownGroup(group.to_string()));
        };
        entry.arrive(phase, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_exit_flag_monotonic() {
        let flags = ExitFlags::new();
        assert!(!flags.any_set());

        assert!(flags.process.set());
        assert!(!flags.process.set());
        assert!(flags.any_set());
        assert!(!flags.thread.is_set());

        flags.set_all();
        flags.set_all();
        assert!(flags.thread.is_set() && flags.process.is_set());
        assert!(flags.for_kind(ExecutionKind::Thread).is_set());
    }

    #[test]
    fn test_start_gate() {
        let gate = StartGate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(5)));

        let waiter = gate.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        gate.open();

        assert!(handle.join().unwrap());
        assert!(gate.is_open());
        assert!(gate.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_checkpoint_releases_all_parties() {
        let cp = Arc::new(Checkpoint::new(3));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cp = Arc::clone(&cp);
                thread::spawn(move || cp.wait(Duration::from_secs(5)))
            })
            .collect();

        let mine = cp.wait(Duration::from_secs(5)).unwrap();
        let leaders = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .chain(std::iter::once(mine))
            .filter(|&leader| leader)
            .count();
        assert_eq!(leaders, 1);
        assert!(!cp.is_broken());
    }

    #[test]
    fn test_checkpoint_timeout_breaks() {
        let cp = Arc::new(Checkpoint::new(3));
        let other = Arc::clone(&cp);
        let handle = thread::spawn(move || other.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        assert_eq!(
            cp.wait(Duration::from_millis(50)),
            Err(CheckpointError::Timeout)
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(handle.join().unwrap(), Err(CheckpointError::Broken));
        assert_eq!(cp.wait(Duration::from_secs(5)), Err(CheckpointError::Broken));
    }

    #[test]
    fn test_group_table() {
        let table = GroupTable::new();
        assert!(table.insert(NodeGroup::new("lidar", 1)));
        assert!(!table.insert(NodeGroup::new("lidar", 2)));

        let group = table.get("lidar").unwrap();
        assert_eq!(group.nodes(), 1);
        assert_eq!(group.checkpoint(Phase::Setup).parties(), 2);

        let node = thread::spawn({
            let group = Arc::clone(&group);
            move || group.arrive(Phase::Setup, Duration::from_secs(5))
        });
        table
            .arrive("lidar", Phase::Setup, Duration::from_secs(5))
            .unwrap();
        node.join().unwrap().unwrap();

        assert_eq!(
            table.arrive("missing", Phase::Ready, Duration::from_millis(1)),
            Err(CheckpointError::UnknownGroup("missing".to_string()))
        );
    }
}
