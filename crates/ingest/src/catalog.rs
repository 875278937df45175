//! The consumer's view of provisioned queues.
//!
//! Loaded from the store at startup and swapped wholesale on each refresh
//! signal; workers only ever read a snapshot, so a refresh never mutates a
//! catalog a worker is iterating.

use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use telemetra_core::{QueueKind, QueueRecord};
use telemetra_store::{EventStore, StoreError};

/// Shared, refreshable queue catalog.
pub struct QueueCatalog {
    store: Arc<dyn EventStore>,
    queues: RwLock<Arc<Vec<QueueRecord>>>,
}

impl QueueCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            queues: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the catalog with the store's current queue records.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let queues = self.store.list_queues().await?;
        let count = queues.len();
        *self.queues.write().expect("catalog lock poisoned") = Arc::new(queues);
        debug!(count, "queue catalog loaded");
        Ok(count)
    }

    /// All queues carrying one event kind, by the record's structured
    /// `kind` field.
    #[must_use]
    pub fn select(&self, kind: QueueKind) -> Vec<QueueRecord> {
        self.snapshot()
            .iter()
            .filter(|q| q.kind == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<QueueRecord>> {
        Arc::clone(&self.queues.read().expect("catalog lock poisoned"))
    }

    /// Reload on every provisioner refresh signal until cancelled.
    ///
    /// A failed reload keeps the previous snapshot and waits for the next
    /// signal; provisioning fires the signal only after the store write
    /// succeeded, so the records will be there on retry.
    pub async fn run_refresh(
        self: Arc<Self>,
        mut signal: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("catalog refresh task stopping");
                    return;
                }
                changed = signal.changed() => {
                    if changed.is_err() {
                        // Provisioner gone; nothing further will change.
                        return;
                    }
                    let generation = *signal.borrow_and_update();
                    match self.load().await {
                        Ok(count) => info!(generation, count, "queue catalog refreshed"),
                        Err(err) => warn!(generation, error = %err, "queue catalog refresh failed"),
                    }
                }
            }
        }
    }
}
