//! # nodebus-core
//!
//! Topic-tree broker, node lifecycle and manager for the nodebus message bus.
//!
//! Nodes are user functions running on their own thread or in a child
//! process. They exchange [`Envelope`]s addressed to slash delimited topics;
//! a subscription to a topic also covers every topic below it.
//!
//! - **Manager** - registers, starts and joins nodes; owns the threads below
//! - **Broker** - single owner of the topic tree, fans publishes out
//! - **Relay** - forwards envelopes from process links to the broker
//! - **Node** - the [`NodeContext`] handle user code runs with
//! - **Signal** - exit flags, start gates and group checkpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌─────────────┐  deliver   ┌─────────────┐
//! │ Thread node │───────────▶│   Broker    │───────────▶│   inbound   │
//! └─────────────┘            └─────────────┘            └─────────────┘
//!                                   ▲
//!                                   │
//! ┌─────────────┐   link     ┌─────────────┐
//! │Process node │───────────▶│    Relay    │
//! └─────────────┘            └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nodebus_core::{Manager, ManagerConfig};
//!
//! let mut manager = Manager::new(ManagerConfig::default())?;
//! manager.register_thread("listener", |ctx| {
//!     ctx.subscribe("lidar", true, Duration::from_secs(1));
//!     while !ctx.is_exiting() {
//!         for envelope in ctx.receive(true, Duration::from_millis(100)) {
//!             println!("{} bytes on {}", envelope.payload_size(), envelope.topic);
//!         }
//!     }
//! })?;
//! manager.start_all()?;
//! manager.exit_all();
//! manager.join_all();
//! # Ok::<(), nodebus_core::BusError>(())
//! ```

pub mod broker;
pub mod context;
pub mod error;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod node;
pub mod process;
pub mod queue;
pub mod relay;
pub mod signal;
pub mod topic;

pub use broker::{Broker, BusStats, StatsSnapshot};
pub use error::BusError;
pub use manager::{Manager, ManagerConfig, NodeQueueDepth, QueueDepths};
pub use message::{filter_by_topic, Envelope, EnvelopeKind, MessageId, NodeId, Reply};
pub use node::{ExecutionKind, NodeContext, NodeState, Timings};
pub use process::{dispatch, ProcessEntry, ProcessTable};
pub use queue::{MemoryQueue, QueueError, Sink};
pub use signal::{CheckpointError, ExitFlag};
pub use topic::{TopicError, TopicTree};
