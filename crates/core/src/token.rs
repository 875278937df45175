//! Token records: the capability credential minted once per product.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ProductId, TenantId, TokenValue, VhostId};

/// A credential scoping all telemetry for one product.
///
/// Minted at product registration, immutable afterwards. Revocation is the
/// job of [`Token::is_expired`], currently a constant extension point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Opaque unique value presented by SDK clients.
    pub value: TokenValue,
    /// Human-readable label chosen at issuance.
    pub name: String,
    /// Owning tenant (broker principal).
    pub tenant: TenantId,
    /// The product this token scopes.
    pub product: ProductId,
    /// The vhost provisioned for this token's queues.
    pub vhost: VhostId,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Expiry predicate. Always false today; the hook where revocation
    /// plugs in.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        false
    }
}
