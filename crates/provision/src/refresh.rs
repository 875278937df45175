//! Catalog change notification.
//!
//! Consumers hold long-lived queue catalogs; the provisioner nudges them
//! over a `watch` channel after a successful mutation. The payload is a
//! generation counter, so a subscriber that misses intermediate signals
//! still converges on one reload.

use tokio::sync::watch;

/// Sender half of the catalog refresh signal.
#[derive(Debug, Clone)]
pub struct CatalogRefresh {
    tx: watch::Sender<u64>,
}

impl CatalogRefresh {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Signal that the catalog changed. Never fails; with no subscribers
    /// the generation still advances.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Subscribe to refresh signals.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for CatalogRefresh {
    fn default() -> Self {
        Self::new()
    }
}
