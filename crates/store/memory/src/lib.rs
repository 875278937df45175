//! In-memory [`EventStore`] with full invariant enforcement.
//!
//! The reference backend: every uniqueness and lifecycle rule the Postgres
//! backend gets from constraints is enforced here in code, so consumer and
//! SSE tests exercise real semantics without a database. Aggregates are
//! computed on demand over hourly buckets -- a stand-in for the continuous
//! aggregate views, adequate at test scale.
//!
//! All state sits behind one mutex; `insert_event` is therefore trivially
//! atomic across the envelope and specialized maps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rand::Rng;

use telemetra_core::{
    ClientId, EventError, Metric, ProductId, QueueRecord, SeriesPoint, Session, SessionId,
    Severity, TenantId, Token, TokenValue,
};
use telemetra_store::{BucketRange, EventDetails, EventRow, EventStore, StoreError, TenantRecord};

/// Resampling budget for random client-id assignment.
const CLIENT_ID_ATTEMPTS: u32 = 16;

type SessionKey = (TokenValue, ClientId, SessionId);

#[derive(Default)]
struct Inner {
    tenants: HashMap<String, TenantRecord>,
    tokens: HashMap<TokenValue, Token>,
    queues: Vec<QueueRecord>,
    /// Registered client ids per token.
    clients: HashMap<TokenValue, HashSet<ClientId>>,
    sessions: HashMap<SessionKey, Session>,
    /// Envelope uniqueness index: (time, client, session) -> envelope id.
    event_index: HashMap<(DateTime<Utc>, ClientId, SessionId), i64>,
    events: Vec<(i64, EventRow, EventDetails)>,
    next_event_id: i64,
}

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Truncate to the hour bucket.
    fn bucket_of(time: DateTime<Utc>) -> DateTime<Utc> {
        time.duration_trunc(TimeDelta::hours(1))
            .expect("hour truncation cannot overflow for event timestamps")
    }
}

/// Accumulate `(bucket -> values)` and reduce to a sorted series.
fn reduce<F>(buckets: BTreeMap<DateTime<Utc>, Vec<f64>>, f: F) -> Vec<SeriesPoint>
where
    F: Fn(&[f64]) -> f64,
{
    buckets
        .into_iter()
        .map(|(bucket, values)| SeriesPoint {
            bucket,
            value: f(&values),
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl Inner {
    /// Compute one metric's hourly series for a product.
    fn series(&self, metric: Metric, product: &ProductId) -> Vec<SeriesPoint> {
        let rows = || {
            self.events
                .iter()
                .filter(move |(_, row, _)| &row.product == product)
        };
        let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();

        match metric {
            Metric::ActiveUsers => {
                let mut per_bucket: BTreeMap<DateTime<Utc>, HashSet<ClientId>> = BTreeMap::new();
                for (_, row, _) in rows() {
                    per_bucket
                        .entry(MemoryEventStore::bucket_of(row.time))
                        .or_default()
                        .insert(row.client);
                }
                return per_bucket
                    .into_iter()
                    .map(|(bucket, clients)| SeriesPoint {
                        bucket,
                        value: clients.len() as f64,
                    })
                    .collect();
            }
            Metric::EventCount => {
                for (_, row, _) in rows() {
                    buckets
                        .entry(MemoryEventStore::bucket_of(row.time))
                        .or_default()
                        .push(1.0);
                }
                return reduce(buckets, |v| v.len() as f64);
            }
            Metric::AvgFps => {
                for (_, row, details) in rows() {
                    if let EventDetails::Quality { fps, .. } = details {
                        buckets
                            .entry(MemoryEventStore::bucket_of(row.time))
                            .or_default()
                            .push(*fps);
                    }
                }
                reduce(buckets, mean)
            }
            Metric::AvgMemoryUsage => {
                for (_, row, details) in rows() {
                    if let EventDetails::Quality { memory_usage, .. } = details {
                        buckets
                            .entry(MemoryEventStore::bucket_of(row.time))
                            .or_default()
                            .push(*memory_usage);
                    }
                }
                reduce(buckets, mean)
            }
            Metric::AvgSessionDuration => {
                for session in self.sessions.values() {
                    let Some(duration) = session.duration_secs else {
                        continue;
                    };
                    let owns_product = self.tokens.get(&session.token).is_some_and(|t| {
                        &t.product == product
                    });
                    if owns_product {
                        buckets
                            .entry(MemoryEventStore::bucket_of(session.start_time))
                            .or_default()
                            .push(duration as f64);
                    }
                }
                reduce(buckets, mean)
            }
            Metric::RevenuePerCurrency => {
                for (_, row, details) in rows() {
                    if let EventDetails::Business { amount, .. } = details {
                        buckets
                            .entry(MemoryEventStore::bucket_of(row.time))
                            .or_default()
                            .push(*amount);
                    }
                }
                reduce(buckets, |v| v.iter().sum())
            }
            Metric::Arppu => {
                let mut revenue: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
                let mut payers: BTreeMap<DateTime<Utc>, HashSet<ClientId>> = BTreeMap::new();
                for (_, row, details) in rows() {
                    if let EventDetails::Business { amount, .. } = details {
                        let bucket = MemoryEventStore::bucket_of(row.time);
                        *revenue.entry(bucket).or_default() += amount;
                        payers.entry(bucket).or_default().insert(row.client);
                    }
                }
                return revenue
                    .into_iter()
                    .map(|(bucket, total)| {
                        let n = payers.get(&bucket).map_or(1, HashSet::len).max(1);
                        SeriesPoint {
                            bucket,
                            value: total / n as f64,
                        }
                    })
                    .collect();
            }
            Metric::CrashRate => {
                for (_, row, details) in rows() {
                    if let EventDetails::Error { severity, .. } = details {
                        let crash = f64::from(u8::from(*severity == Severity::Critical));
                        buckets
                            .entry(MemoryEventStore::bucket_of(row.time))
                            .or_default()
                            .push(crash);
                    }
                }
                reduce(buckets, mean)
            }
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.tenants.contains_key(tenant.id.as_str()) {
            return Err(StoreError::Duplicate(format!("tenant {}", tenant.id)));
        }
        inner
            .tenants
            .insert(tenant.id.to_string(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.lock().tenants.get(id.as_str()).cloned())
    }

    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.tokens.contains_key(&token.value) {
            return Err(StoreError::Duplicate(format!("token {}", token.value)));
        }
        inner.tokens.insert(token.value.clone(), token.clone());
        Ok(())
    }

    async fn resolve_token(&self, value: &TokenValue) -> Result<Option<Token>, StoreError> {
        Ok(self.lock().tokens.get(value).cloned())
    }

    async fn delete_token(&self, value: &TokenValue) -> Result<(), StoreError> {
        self.lock().tokens.remove(value);
        Ok(())
    }

    async fn insert_queue(&self, queue: &QueueRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.queues.iter().any(|q| q.full_name == queue.full_name) {
            return Err(StoreError::Duplicate(format!("queue {}", queue.full_name)));
        }
        inner.queues.push(queue.clone());
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueRecord>, StoreError> {
        Ok(self.lock().queues.clone())
    }

    async fn delete_queues_for_token(&self, token: &TokenValue) -> Result<(), StoreError> {
        self.lock().queues.retain(|q| &q.token != token);
        Ok(())
    }

    async fn register_client(&self, token: &TokenValue) -> Result<ClientId, StoreError> {
        let mut inner = self.lock();
        if !inner.tokens.contains_key(token) {
            return Err(StoreError::NotFound(format!("token {token}")));
        }
        let ids = inner.clients.entry(token.clone()).or_default();
        let mut rng = rand::thread_rng();
        for _ in 0..CLIENT_ID_ATTEMPTS {
            let candidate = ClientId(rng.gen_range(1..=i64::from(i32::MAX)));
            if ids.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(StoreError::IdExhausted {
            attempts: CLIENT_ID_ATTEMPTS,
        })
    }

    async fn client_exists(
        &self,
        token: &TokenValue,
        client: ClientId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .clients
            .get(token)
            .is_some_and(|ids| ids.contains(&client)))
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (
            session.token.clone(),
            session.client,
            session.id.clone(),
        );
        if inner.sessions.contains_key(&key) {
            return Err(StoreError::Duplicate(format!("session {}", session.id)));
        }
        inner.sessions.insert(key, session.clone());
        Ok(())
    }

    async fn find_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
    ) -> Result<Option<Session>, StoreError> {
        let inner = self.lock();
        let found = match client {
            Some(client) => inner
                .sessions
                .get(&(token.clone(), client, id.clone()))
                .cloned(),
            None => inner
                .sessions
                .values()
                .find(|s| &s.token == token && &s.id == id)
                .cloned(),
        };
        Ok(found)
    }

    async fn close_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
        end_time: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.lock();
        let key = match client {
            Some(client) => (token.clone(), client, id.clone()),
            None => inner
                .sessions
                .keys()
                .find(|(t, _, s)| t == token && s == id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?,
        };
        let session = inner
            .sessions
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.close(end_time).map_err(|e| match e {
            EventError::Validation(msg) => StoreError::Constraint(msg),
            other => StoreError::Backend(other.to_string()),
        })?;
        Ok(session.clone())
    }

    async fn insert_event(
        &self,
        row: &EventRow,
        details: &EventDetails,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let index_key = (row.time, row.client, row.session.clone());
        if inner.event_index.contains_key(&index_key) {
            return Err(StoreError::Duplicate(format!(
                "game_event ({}, {}, {})",
                row.time, row.client, row.session
            )));
        }
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.event_index.insert(index_key, id);
        inner.events.push((id, row.clone(), details.clone()));
        Ok(id)
    }

    async fn query_series(
        &self,
        metric: Metric,
        product: &ProductId,
        range: BucketRange,
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        let series = self.lock().series(metric, product);
        Ok(series
            .into_iter()
            .filter(|p| p.bucket >= range.start && p.bucket <= range.end)
            .collect())
    }

    async fn bucket_bounds(
        &self,
        metric: Metric,
        product: &ProductId,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let series = self.lock().series(metric, product);
        Ok(match (series.first(), series.last()) {
            (Some(first), Some(last)) => Some((first.bucket, last.bucket)),
            _ => None,
        })
    }
}
