//! Consumer process core: queue catalog, per-kind event handlers, the
//! ack/nack router, and the live KPI fan-out.

pub mod catalog;
pub mod handler;
pub mod live;
pub mod router;

pub use catalog::QueueCatalog;
pub use handler::{EventHandler, HandlerContext};
pub use live::LivePublisher;
pub use router::{ConsumerRegistry, EventRouter, RouterConfig, Settlement, settle};
