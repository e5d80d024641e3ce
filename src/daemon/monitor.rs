use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    process_api::{ProcessIdentity, ProcessInspector},
    utils::clock::Clock,
};

use super::registry::Registry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Watches a single process instance on behalf of one registry entry.
///
/// The monitor only reads the process table. When the process disappears it hands the entry back
/// to the registry, which does the state transition under its own lock. It never holds that lock
/// while sleeping.
pub struct LivenessMonitor {
    key: u64,
    identity: ProcessIdentity,
    inspector: Arc<dyn ProcessInspector>,
    clock: Arc<dyn Clock>,
    registry: Weak<Registry>,
    poll_interval: Duration,
    cancellation: CancellationToken,
}

impl LivenessMonitor {
    pub fn new(
        key: u64,
        identity: ProcessIdentity,
        inspector: Arc<dyn ProcessInspector>,
        clock: Arc<dyn Clock>,
        registry: Weak<Registry>,
        poll_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            key,
            identity,
            inspector,
            clock,
            registry,
            poll_interval,
            cancellation,
        }
    }

    pub async fn run(self) {
        debug!(
            "Monitoring {} (pid {}) for entry {}",
            self.identity.name, self.identity.pid, self.key
        );
        loop {
            select! {
                _ = self.cancellation.cancelled() => {
                    debug!("Monitor of entry {} cancelled", self.key);
                    return;
                }
                _ = self.clock.sleep(self.poll_interval) => {}
            }

            if self.inspector.is_alive(&self.identity) {
                trace!("Process {} is alive", self.identity.pid);
                continue;
            }

            if self.cancellation.is_cancelled() {
                return;
            }
            debug!(
                "Process {} (pid {}) is gone",
                self.identity.name, self.identity.pid
            );
            if let Some(registry) = self.registry.upgrade() {
                registry.finalize_terminated(self.key).await;
            }
            return;
        }
    }
}
