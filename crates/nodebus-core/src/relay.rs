//! Process relay: forwards process-domain envelopes to the broker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::BusStats;
use crate::message::Envelope;
use crate::queue::{MemoryQueue, QueueError, Sink};
use crate::signal::{Checkpoint, ExitFlags};

/// Drains the queue fed by process links into the broker queue.
pub struct ProcessRelay {
    source: MemoryQueue<Envelope>,
    target: Arc<dyn Sink<Envelope>>,
    flags: ExitFlags,
    stats: Arc<BusStats>,
    poll_interval: Duration,
}

impl ProcessRelay {
    /// Create a relay from `source` into `target`.
    #[must_use]
    pub fn new(
        source: MemoryQueue<Envelope>,
        target: Arc<dyn Sink<Envelope>>,
        flags: ExitFlags,
        stats: Arc<BusStats>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            target,
            flags,
            stats,
            poll_interval,
        }
    }

    /// Forward one envelope, waiting up to the poll interval for room.
    ///
    /// Returns whether the envelope reached the broker queue.
    pub fn forward(&self, envelope: Envelope) -> bool {
        let sender = envelope.sender.clone();
        match self.target.push_timeout(envelope, self.poll_interval) {
            Ok(()) => {
                self.stats.record_relayed();
                true
            }
            Err(e) => {
                self.stats.record_dropped("relay");
                warn!(sender = %sender, error = %e, "Relay dropped envelope");
                false
            }
        }
    }

    /// Run until either exit flag is set, then set both.
    pub fn run(self, startup: Arc<Checkpoint>, startup_timeout: Duration) {
        if let Err(e) = startup.wait(startup_timeout) {
            warn!(error = %e, "Relay startup checkpoint failed, proceeding");
        }
        info!("Process relay started");

        while !self.flags.any_set() {
            match self.source.pop_timeout(self.poll_interval) {
                Ok(envelope) => {
                    self.forward(envelope);
                }
                Err(QueueError::Timeout) => {}
                Err(e) => {
                    error!(error = %e, "Relay queue failed");
                    break;
                }
            }
        }

        self.flags.set_all();
        debug!(pending = self.source.len(), "Process relay stopped");
    }
}
