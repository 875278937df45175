//! Best-effort live KPI fan-out.
//!
//! Accepted session-lifecycle events publish signed deltas here; SSE
//! connections subscribe and merge them between authoritative poll cycles.
//! The channel is in-process broadcast: a slow subscriber lags and skips,
//! it never blocks event processing, and the aggregate views remain the
//! source of truth.

use tokio::sync::broadcast;
use tracing::trace;

use telemetra_core::MetricUpdate;

const DEFAULT_CAPACITY: usize = 256;

/// Publishes [`MetricUpdate`]s to any number of subscribers.
///
/// Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct LivePublisher {
    tx: broadcast::Sender<MetricUpdate>,
}

impl LivePublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an update. Fire-and-forget: with no subscribers the update
    /// is dropped silently.
    pub fn publish(&self, update: MetricUpdate) {
        if self.tx.send(update).is_err() {
            trace!("live update dropped, no subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MetricUpdate> {
        self.tx.subscribe()
    }
}

impl Default for LivePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
