pub mod error;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use record::{EventDetails, EventRow, TenantRecord};
pub use store::{BucketRange, EventStore};
