//! The broker management capability.
//!
//! Provisioning talks to the broker's management surface, not its wire
//! protocol: create principals, vhosts, and durable queues. Implementations
//! must reproduce the idempotency contract documented on each method --
//! the provisioning flow relies on it to avoid leaving partial state.

use async_trait::async_trait;

use telemetra_core::{TenantId, VhostId};

use crate::error::BrokerError;

/// Credentials minted for a new broker principal.
///
/// The password exists only in this value at creation time; the broker
/// cannot return it again later.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
}

/// Management operations against the broker.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Whether a principal with this name exists.
    async fn account_exists(&self, username: &str) -> Result<bool, BrokerError>;

    /// Create a broker principal for a tenant and return its credentials.
    ///
    /// Fails with [`BrokerError::AlreadyExists`] if the principal is
    /// already present. Callers must treat that as fatal: the existing
    /// account's password is unrecoverable.
    async fn create_account(&self, tenant: &TenantId) -> Result<AccountCredentials, BrokerError>;

    /// Delete a broker principal.
    ///
    /// Fails with [`BrokerError::NotFound`] if absent.
    async fn delete_account(&self, username: &str) -> Result<(), BrokerError>;

    /// Create a vhost for a tenant and grant the tenant principal
    /// write-only permission on it. Create-if-exists is success.
    async fn create_vhost(&self, tenant: &TenantId) -> Result<VhostId, BrokerError>;

    /// Delete a vhost. Fails with [`BrokerError::NotFound`] if absent.
    async fn delete_vhost(&self, vhost: &VhostId) -> Result<(), BrokerError>;

    /// Declare a durable queue. Idempotent by name: declaring an existing
    /// queue is success. Any other rejection is [`BrokerError::Rejected`].
    async fn create_queue(&self, vhost: &VhostId, full_name: &str) -> Result<(), BrokerError>;

    /// Delete a queue. Fails with [`BrokerError::NotFound`] if absent.
    async fn delete_queue(&self, vhost: &VhostId, full_name: &str) -> Result<(), BrokerError>;
}
