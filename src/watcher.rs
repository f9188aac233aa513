//! TTL watcher for the active resource
//!
//! One watcher is spawned per activation and bound to the id of the resource
//! it was started for. It never touches the provider: when the TTL runs out it
//! only flips `alive` to false, and the next `get_endpoint` call rotates.
//!
//! Rotation and teardown abort the task. The identity check on every tick is
//! what keeps a watcher that already woke up from acting on a newer handle.

use crate::controller::SharedState;
use crate::provider::ResourceId;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Handle to a running TTL watcher task
pub struct TtlWatcher {
    id: ResourceId,
    handle: JoinHandle<()>,
}

impl TtlWatcher {
    /// Start watching `id`. Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        state: SharedState,
        id: ResourceId,
        ttl: Duration,
        check_interval: Duration,
    ) -> Self {
        let watched = id.clone();
        let handle = tokio::spawn(async move {
            watch(state, watched, ttl, check_interval).await;
        });

        Self { id, handle }
    }

    /// The generation this watcher is bound to
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the watcher without touching the handle it watches
    pub fn cancel(self) {
        debug!(id = %self.id, "Cancelling TTL watcher");
        self.handle.abort();
    }
}

async fn watch(state: SharedState, id: ResourceId, ttl: Duration, check_interval: Duration) {
    // A TTL too large to represent never expires
    let deadline = Instant::now().checked_add(ttl);
    let tick = check_interval.max(Duration::from_millis(1));

    debug!(id = %id, ttl_secs = ttl.as_secs(), "TTL watcher started");

    loop {
        let now = Instant::now();
        let step = match deadline {
            Some(deadline) if now >= deadline => break,
            Some(deadline) => tick.min(deadline - now),
            None => tick,
        };
        tokio::time::sleep(step).await;

        if !state.lock().is_current(&id) {
            debug!(id = %id, "TTL watcher superseded, exiting");
            return;
        }
    }

    if state.lock().expire_if_current(&id) {
        info!(id = %id, ttl_secs = ttl.as_secs(), "Active resource reached its TTL");
    } else {
        debug!(id = %id, "TTL elapsed for a superseded resource, ignoring");
    }
}
