//! Tenant and token provisioning for Telemetra.

mod error;
mod provisioner;
mod refresh;

pub use error::ProvisionError;
pub use provisioner::{Provisioner, TokenGrant};
pub use refresh::CatalogRefresh;
