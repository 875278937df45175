pub mod error;
pub mod event;
pub mod metric;
pub mod queue;
pub mod session;
pub mod token;
pub mod types;

pub use error::EventError;
pub use event::{
    BusinessPayload, CustomPayload, ErrorPayload, ProgressionPayload, QualityPayload,
    ResourcePayload, SessionEndPayload, SessionStartPayload, Severity,
};
pub use metric::{Metric, MetricUpdate, SeriesPoint, topic};
pub use queue::{QueueKind, QueueRecord, queue_name};
pub use session::Session;
pub use token::Token;
pub use types::{ClientId, ProductId, SessionId, TenantId, TokenValue, VhostId};
