//! The [`EventStore`] trait.
//!
//! One backend call per logical operation; the backend owns transaction
//! boundaries. The single hard rule: [`EventStore::insert_event`] writes
//! the envelope row and its specialized row in one transaction -- both
//! visible or neither.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use telemetra_core::{
    ClientId, Metric, ProductId, QueueRecord, SeriesPoint, Session, SessionId, TenantId, Token,
    TokenValue,
};

use crate::error::StoreError;
use crate::record::{EventDetails, EventRow, TenantRecord};

/// Inclusive time range for series queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Persistent storage for tenants, tokens, queues, clients, sessions,
/// events, and the bucketed aggregate views.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait EventStore: Send + Sync {
    // --- registration-time records -------------------------------------

    /// Persist a tenant and its broker credentials.
    async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError>;

    /// Look up a tenant by id. `None` if unknown.
    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError>;

    /// Persist a freshly minted token.
    async fn insert_token(&self, token: &Token) -> Result<(), StoreError>;

    /// Resolve a token credential to its record. `None` if unknown.
    async fn resolve_token(&self, value: &TokenValue) -> Result<Option<Token>, StoreError>;

    /// Remove a token record. Used when a failed issuance unwinds; succeeds
    /// even if the token is already gone.
    async fn delete_token(&self, value: &TokenValue) -> Result<(), StoreError>;

    /// Record a provisioned queue in the catalog.
    async fn insert_queue(&self, queue: &QueueRecord) -> Result<(), StoreError>;

    /// All provisioned queues, across every token. Read at consumer
    /// startup and on each catalog refresh.
    async fn list_queues(&self) -> Result<Vec<QueueRecord>, StoreError>;

    /// Remove all queue records for a token (token retirement).
    async fn delete_queues_for_token(&self, token: &TokenValue) -> Result<(), StoreError>;

    // --- clients -------------------------------------------------------

    /// Register a new client under a token, assigning a random unique
    /// integer id. Retries with resampling on collision, bounded; fails
    /// with [`StoreError::IdExhausted`] past the budget.
    async fn register_client(&self, token: &TokenValue) -> Result<ClientId, StoreError>;

    /// Whether this client id is registered under the token.
    async fn client_exists(&self, token: &TokenValue, client: ClientId)
    -> Result<bool, StoreError>;

    // --- sessions ------------------------------------------------------

    /// Create a session row. Fails with [`StoreError::Duplicate`] if a
    /// session with this (token, client, id) already exists.
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Look up a session by id within a token's scope. When `client` is
    /// given, the lookup is exact; otherwise the first match across the
    /// token's clients is returned.
    async fn find_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
    ) -> Result<Option<Session>, StoreError>;

    /// Close a session: set `end_time`, recompute duration, persist.
    ///
    /// Fails `NotFound` for an unknown session, `Constraint` when the end
    /// is not after the start or the session is already closed.
    async fn close_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
        end_time: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    // --- events --------------------------------------------------------

    /// Insert the envelope and its specialized row in one transaction.
    ///
    /// Returns the envelope id. Fails with [`StoreError::Duplicate`] when
    /// the `(time, client, session)` triple already exists; no partial row
    /// is left behind in that case or any other failure.
    async fn insert_event(&self, row: &EventRow, details: &EventDetails)
    -> Result<i64, StoreError>;

    // --- aggregate views -----------------------------------------------

    /// Query one metric's bucketed series for a product, ascending by
    /// bucket, bounded by the inclusive range.
    async fn query_series(
        &self,
        metric: Metric,
        product: &ProductId,
        range: BucketRange,
    ) -> Result<Vec<SeriesPoint>, StoreError>;

    /// The min and max bucket available for a metric and product, used to
    /// default an unspecified SSE time range. `None` when no data exists.
    async fn bucket_bounds(
        &self,
        metric: Metric,
        product: &ProductId,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError>;
}
