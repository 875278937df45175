//! The at-least-once consumption capability.
//!
//! A [`MessageSource`] hands out [`Delivery`] values one at a time per
//! queue, preserving queue order. Every delivery must be settled exactly
//! once: [`Delivery::ack`] removes it, [`Delivery::nack`] requeues it at
//! the front (preserving order) with an incremented attempt counter. A
//! delivery dropped unsettled is the implementation's cue to requeue, the
//! same as a consumer crash.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

/// Settles a single delivery. Implemented per backend.
#[async_trait]
pub trait Acknowledger: Send {
    /// Remove the message from the queue permanently.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Return the message to the front of its queue for redelivery.
    async fn nack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message received from a queue, not yet settled.
pub struct Delivery {
    /// Full broker name of the queue this came from.
    pub queue: String,
    /// Raw message body (JSON on every Telemetra queue).
    pub body: Vec<u8>,
    /// How many times this message has been redelivered (0 on first
    /// delivery). Drives the bounded not-found retry policy.
    pub attempts: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Assemble a delivery. Backends call this; consumers only settle.
    #[must_use]
    pub fn new(queue: String, body: Vec<u8>, attempts: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            queue,
            body,
            attempts,
            acker,
        }
    }

    /// Acknowledge: the message is done (processed, or permanently dropped).
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject for redelivery.
    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// A source of deliveries from named broker queues.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Receive the next message from `queue`, waiting up to `wait`.
    ///
    /// Returns `Ok(None)` when the queue stayed empty for the full wait.
    /// Within one queue, messages are delivered in order and at most one
    /// delivery is outstanding per call site.
    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;
}
