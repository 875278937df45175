//! Consumer workers and the ack/nack policy.
//!
//! One worker task per registered event kind. A worker drains every
//! catalog queue of its kind in turn, handing each message to the kind's
//! handler and settling the delivery according to the error taxonomy:
//!
//! `Received -> Parsed -> {Persisted -> Ack}
//!                      | {ValidationFailed -> Ack (drop)}
//!                      | {Duplicate -> Ack (no-op)}
//!                      | {NotFound -> Nack, bounded; then Ack (drop)}
//!                      | {Transient -> Nack (redeliver)}`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use telemetra_broker::{Delivery, MessageSource};
use telemetra_core::{EventError, QueueKind, QueueRecord};

use crate::catalog::QueueCatalog;
use crate::handler::{
    BusinessHandler, CustomHandler, EndSessionHandler, ErrorHandler, EventHandler,
    HandlerContext, ProgressionHandler, QualityHandler, ResourceHandler, StartSessionHandler,
};

/// Redelivery budget for `NotFound` failures (out-of-order arrival).
pub const NOT_FOUND_MAX_ATTEMPTS: u32 = 5;

/// How a processed delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handler succeeded, or failed permanently: consume the message.
    Ack,
    /// Handler failed recoverably: return the message for redelivery.
    Nack,
}

/// The ack/nack policy. `attempts` counts prior deliveries of the message.
#[must_use]
pub fn settle(result: &Result<(), EventError>, attempts: u32) -> Settlement {
    match result {
        Ok(()) | Err(EventError::Validation(_) | EventError::Duplicate) => Settlement::Ack,
        Err(EventError::NotFound(_)) => {
            if attempts + 1 >= NOT_FOUND_MAX_ATTEMPTS {
                Settlement::Ack
            } else {
                Settlement::Nack
            }
        }
        Err(EventError::Transient(_) | EventError::Provisioning(_)) => Settlement::Nack,
    }
}

/// Static table of handlers keyed by event kind.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: HashMap<QueueKind, Arc<dyn EventHandler>>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full standard handler set, one per kind.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StartSessionHandler));
        registry.register(Arc::new(EndSessionHandler));
        registry.register(Arc::new(BusinessHandler));
        registry.register(Arc::new(ErrorHandler));
        registry.register(Arc::new(ProgressionHandler));
        registry.register(Arc::new(QualityHandler));
        registry.register(Arc::new(ResourceHandler));
        registry.register(Arc::new(CustomHandler));
        registry
    }

    /// Register a handler under its own kind, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    #[must_use]
    pub fn get(&self, kind: QueueKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&kind).cloned()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<QueueKind> {
        QueueKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Worker timing knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a worker blocks on one queue waiting for a message.
    pub receive_wait: Duration,
    /// Pause after a sweep that found no messages, and after broker errors.
    pub idle_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_millis(200),
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// Spawns and owns the per-kind consumer workers.
pub struct EventRouter {
    catalog: Arc<QueueCatalog>,
    registry: Arc<ConsumerRegistry>,
    source: Arc<dyn MessageSource>,
    ctx: HandlerContext,
    config: RouterConfig,
}

impl EventRouter {
    pub fn new(
        catalog: Arc<QueueCatalog>,
        registry: Arc<ConsumerRegistry>,
        source: Arc<dyn MessageSource>,
        ctx: HandlerContext,
        config: RouterConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            source,
            ctx,
            config,
        }
    }

    /// Spawn one worker per registered kind. Workers run until the token
    /// is cancelled.
    #[must_use]
    pub fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.registry
            .kinds()
            .into_iter()
            .map(|kind| {
                let handler = self
                    .registry
                    .get(kind)
                    .expect("kinds() only returns registered kinds");
                let worker = Worker {
                    kind,
                    handler,
                    catalog: Arc::clone(&self.catalog),
                    source: Arc::clone(&self.source),
                    ctx: self.ctx.clone(),
                    config: self.config.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker {
    kind: QueueKind,
    handler: Arc<dyn EventHandler>,
    catalog: Arc<QueueCatalog>,
    source: Arc<dyn MessageSource>,
    ctx: HandlerContext,
    config: RouterConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!(kind = %self.kind, "consumer worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let queues = self.catalog.select(self.kind);
            let mut processed = 0usize;
            for queue in &queues {
                if self.cancel.is_cancelled() {
                    break;
                }
                match self.drain_queue(queue).await {
                    Ok(count) => processed += count,
                    Err(err) => {
                        warn!(
                            kind = %self.kind,
                            queue = %queue.full_name,
                            error = %err,
                            "broker receive failed, backing off"
                        );
                        self.pause(self.config.idle_backoff).await;
                    }
                }
            }

            if processed == 0 {
                self.pause(self.config.idle_backoff).await;
            }
        }
        info!(kind = %self.kind, "consumer worker stopped");
    }

    /// Process messages from one queue until it runs dry. Returns how many
    /// deliveries were settled.
    async fn drain_queue(&self, queue: &QueueRecord) -> Result<usize, telemetra_broker::BrokerError> {
        let mut settled = 0usize;
        loop {
            let delivery = tokio::select! {
                () = self.cancel.cancelled() => return Ok(settled),
                received = self.source.receive(&queue.full_name, self.config.receive_wait) => received?,
            };
            let Some(delivery) = delivery else {
                return Ok(settled);
            };
            self.process(queue, delivery).await;
            settled += 1;
        }
    }

    async fn process(&self, queue: &QueueRecord, delivery: Delivery) {
        let attempts = delivery.attempts;
        let result = self.handler.handle(&self.ctx, queue, &delivery.body).await;

        match settle(&result, attempts) {
            Settlement::Ack => {
                match &result {
                    Ok(()) => debug!(kind = %self.kind, queue = %queue.full_name, "event persisted"),
                    Err(EventError::Duplicate) => {
                        debug!(kind = %self.kind, queue = %queue.full_name, "duplicate delivery, dropped")
                    }
                    Err(EventError::NotFound(what)) => warn!(
                        kind = %self.kind,
                        queue = %queue.full_name,
                        attempts,
                        %what,
                        "redelivery budget exhausted, dropping message"
                    ),
                    Err(err) => warn!(
                        kind = %self.kind,
                        queue = %queue.full_name,
                        error = %err,
                        "unprocessable message dropped"
                    ),
                }
                if let Err(err) = delivery.ack().await {
                    warn!(kind = %self.kind, error = %err, "ack failed");
                }
            }
            Settlement::Nack => {
                debug!(
                    kind = %self.kind,
                    queue = %queue.full_name,
                    attempts,
                    error = %result.as_ref().expect_err("nack implies error"),
                    "returning message for redelivery"
                );
                if let Err(err) = delivery.nack().await {
                    warn!(kind = %self.kind, error = %err, "nack failed");
                }
            }
        }
    }

    async fn pause(&self, wait: Duration) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }
}
