use thiserror::Error;

/// Errors from broker provisioning and consumption.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker already has this principal. Fatal for account creation:
    /// the existing password cannot be recovered, so silent reuse is never
    /// safe.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The broker rejected a provisioning request with an unexpected status.
    #[error("provisioning rejected (status {status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// Network-level failure talking to the broker.
    #[error("connection error: {0}")]
    Connection(String),

    /// A delivery could not be acknowledged or rejected (channel gone).
    #[error("acknowledgement failed: {0}")]
    AckFailed(String),
}

impl BrokerError {
    /// Whether the operation may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(BrokerError::Connection("reset".into()).is_retryable());
        assert!(!BrokerError::AlreadyExists("u1".into()).is_retryable());
        assert!(
            !BrokerError::Rejected {
                status: 400,
                detail: "bad".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn display() {
        let err = BrokerError::Rejected {
            status: 500,
            detail: "boom".into(),
        };
        assert_eq!(err.to_string(), "provisioning rejected (status 500): boom");
    }
}
