use thiserror::Error;

use telemetra_broker::BrokerError;
use telemetra_store::StoreError;

/// Errors from the provisioning flow.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A broker principal for this tenant already exists. Fatal: the
    /// existing password cannot be recovered, so the flow never reuses it.
    #[error("tenant already provisioned: {0}")]
    TenantExists(String),

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    /// Caller-supplied input failed validation (bad queue name segment).
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_wrap_transparently() {
        let err: ProvisionError = BrokerError::Connection("refused".into()).into();
        assert_eq!(err.to_string(), "connection error: refused");
    }
}
