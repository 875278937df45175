use thiserror::Error;

/// Shared error taxonomy for event processing.
///
/// The consumer's ack/nack policy is driven entirely by these variants:
/// validation failures are permanently unprocessable (ack-drop), duplicates
/// are idempotent successes, not-found conditions may be out-of-order
/// deliveries (bounded retry), and transient broker/store failures are
/// nacked so the broker redelivers.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload is malformed or missing a required field. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced session, client, or token does not exist (yet).
    /// Possibly an out-of-order delivery; retried a bounded number of times.
    #[error("not found: {0}")]
    NotFound(String),

    /// The `(time, client, session)` triple already exists. Treated as an
    /// idempotent success, not an error.
    #[error("duplicate event")]
    Duplicate,

    /// The broker rejected an account/vhost/queue operation.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Connection loss or timeout talking to the broker or store.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl EventError {
    /// Whether the broker should redeliver the message indefinitely
    /// (true only for transient infrastructure failures).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the message is permanently unprocessable and must be
    /// acknowledged to stop redelivery.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Duplicate)
    }
}
