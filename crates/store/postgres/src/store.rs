use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{PgPool, Row};
use tracing::instrument;

use telemetra_core::{
    ClientId, Metric, ProductId, QueueKind, QueueRecord, SeriesPoint, Session, SessionId, TenantId,
    Token, TokenValue, VhostId,
};
use telemetra_store::error::StoreError;
use telemetra_store::record::{EventDetails, EventRow, TenantRecord};
use telemetra_store::store::{BucketRange, EventStore};

use crate::config::PostgresConfig;
use crate::migrations;

/// Build `PgConnectOptions` from a [`PostgresConfig`].
pub(crate) fn build_connect_options(
    config: &PostgresConfig,
) -> Result<sqlx::postgres::PgConnectOptions, StoreError> {
    config
        .url
        .parse()
        .map_err(|e: sqlx::Error| StoreError::Connection(e.to_string()))
}

/// Translate a database failure, mapping unique violations (SQLSTATE 23505)
/// to [`StoreError::Duplicate`].
fn map_db_err(err: sqlx::Error, unique_what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate(unique_what.to_string());
        }
    }
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Connection(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn backend_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Connection(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

/// PostgreSQL-backed implementation of [`EventStore`].
///
/// With `config.timescale` set, `game_event` is a hypertable and the
/// aggregate views are TimescaleDB continuous aggregates; without it the
/// same views are computed at query time. The query surface is identical
/// either way.
pub struct PostgresEventStore {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresEventStore {
    /// Connect, create the pool, and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if pool creation fails, or
    /// [`StoreError::Backend`] if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StoreError> {
        let connect_options = build_connect_options(&config)?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::from_pool(pool, config).await
    }

    /// Create a store from an existing pool. Runs migrations on creation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if migrations fail.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow, token: &TokenValue) -> Session {
    Session {
        id: SessionId::from(row.get::<String, _>("id")),
        token: token.clone(),
        client: ClientId(row.get::<i64, _>("client")),
        platform: row.get("platform"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        duration_secs: row.get("duration_secs"),
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenant (id, display_name, broker_username, broker_password) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.display_name)
        .bind(&tenant.broker_username)
        .bind(&tenant.broker_password)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "tenant"))?;

        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, display_name, broker_username, broker_password FROM tenant WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(row.map(|row| TenantRecord {
            id: TenantId::from(row.get::<String, _>("id")),
            display_name: row.get("display_name"),
            broker_username: row.get("broker_username"),
            broker_password: row.get("broker_password"),
        }))
    }

    async fn insert_token(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO token (value, name, tenant, product, vhost, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(token.value.as_str())
        .bind(&token.name)
        .bind(token.tenant.as_str())
        .bind(token.product.as_str())
        .bind(token.vhost.as_str())
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "token"))?;

        Ok(())
    }

    async fn resolve_token(&self, value: &TokenValue) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query(
            "SELECT value, name, tenant, product, vhost, created_at FROM token WHERE value = $1",
        )
        .bind(value.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(row.map(|row| Token {
            value: TokenValue::from(row.get::<String, _>("value")),
            name: row.get("name"),
            tenant: TenantId::from(row.get::<String, _>("tenant")),
            product: ProductId::from(row.get::<String, _>("product")),
            vhost: VhostId::from(row.get::<String, _>("vhost")),
            created_at: row.get("created_at"),
        }))
    }

    async fn delete_token(&self, value: &TokenValue) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM token WHERE value = $1")
            .bind(value.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    async fn insert_queue(&self, queue: &QueueRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO queue (full_name, logical_name, kind, token, vhost) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&queue.full_name)
        .bind(&queue.logical_name)
        .bind(queue.kind.as_str())
        .bind(queue.token.as_str())
        .bind(queue.vhost.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "queue"))?;

        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT full_name, logical_name, kind, token, vhost FROM queue ORDER BY full_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                let kind = QueueKind::parse(&kind_str).ok_or_else(|| {
                    StoreError::Backend(format!("unknown queue kind in catalog: {kind_str}"))
                })?;
                Ok(QueueRecord {
                    full_name: row.get("full_name"),
                    logical_name: row.get("logical_name"),
                    kind,
                    token: TokenValue::from(row.get::<String, _>("token")),
                    vhost: VhostId::from(row.get::<String, _>("vhost")),
                })
            })
            .collect()
    }

    async fn delete_queues_for_token(&self, token: &TokenValue) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue WHERE token = $1")
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn register_client(&self, token: &TokenValue) -> Result<ClientId, StoreError> {
        // Resample on collision; the ON CONFLICT guard makes a lost race
        // indistinguishable from a pre-existing id.
        for _ in 0..self.config.client_id_attempts {
            let candidate: i64 = rand::thread_rng().gen_range(1..=i64::from(i32::MAX));

            let result = sqlx::query(
                "INSERT INTO client (token, id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(token.as_str())
            .bind(candidate)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

            if result.rows_affected() > 0 {
                return Ok(ClientId(candidate));
            }
        }

        Err(StoreError::IdExhausted {
            attempts: self.config.client_id_attempts,
        })
    }

    async fn client_exists(
        &self,
        token: &TokenValue,
        client: ClientId,
    ) -> Result<bool, StoreError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM client WHERE token = $1 AND id = $2)")
                .bind(token.as_str())
                .bind(client.value())
                .fetch_one(&self.pool)
                .await
                .map_err(backend_err)?;

        Ok(exists)
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session (token, client, id, platform, start_time, end_time, duration_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session.token.as_str())
        .bind(session.client.value())
        .bind(session.id.as_str())
        .bind(&session.platform)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.duration_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err(e, "session"))?;

        Ok(())
    }

    async fn find_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
    ) -> Result<Option<Session>, StoreError> {
        let row = match client {
            Some(client) => {
                sqlx::query(
                    "SELECT id, client, platform, start_time, end_time, duration_secs \
                     FROM session WHERE token = $1 AND id = $2 AND client = $3",
                )
                .bind(token.as_str())
                .bind(id.as_str())
                .bind(client.value())
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, client, platform, start_time, end_time, duration_secs \
                     FROM session WHERE token = $1 AND id = $2 \
                     ORDER BY client LIMIT 1",
                )
                .bind(token.as_str())
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(backend_err)?;

        Ok(row.map(|row| session_from_row(&row, token)))
    }

    #[instrument(skip(self))]
    async fn close_session(
        &self,
        token: &TokenValue,
        id: &SessionId,
        client: Option<ClientId>,
        end_time: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        // Conditional update: only an open session whose start precedes the
        // requested end is closed. No row updated means a diagnostic lookup
        // decides between NotFound and Constraint.
        let updated = match client {
            Some(client) => {
                sqlx::query(
                    "UPDATE session \
                     SET end_time = $4, \
                         duration_secs = EXTRACT(EPOCH FROM ($4 - start_time))::BIGINT \
                     WHERE token = $1 AND id = $2 AND client = $3 \
                       AND end_time IS NULL AND start_time < $4 \
                     RETURNING id, client, platform, start_time, end_time, duration_secs",
                )
                .bind(token.as_str())
                .bind(id.as_str())
                .bind(client.value())
                .bind(end_time)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE session \
                     SET end_time = $3, \
                         duration_secs = EXTRACT(EPOCH FROM ($3 - start_time))::BIGINT \
                     WHERE token = $1 AND id = $2 \
                       AND end_time IS NULL AND start_time < $3 \
                     RETURNING id, client, platform, start_time, end_time, duration_secs",
                )
                .bind(token.as_str())
                .bind(id.as_str())
                .bind(end_time)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(backend_err)?;

        if let Some(row) = updated {
            return Ok(session_from_row(&row, token));
        }

        match self.find_session(token, id, client).await? {
            None => Err(StoreError::NotFound(format!("session {id}"))),
            Some(existing) if !existing.is_open() => Err(StoreError::Constraint(format!(
                "session {id} already ended"
            ))),
            Some(existing) => Err(StoreError::Constraint(format!(
                "session {id} end time {end_time} is not after start time {}",
                existing.start_time
            ))),
        }
    }

    #[instrument(skip(self, row, details), fields(kind = details.kind_label()))]
    async fn insert_event(
        &self,
        row: &EventRow,
        details: &EventDetails,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let (event_id,): (i64,) = sqlx::query_as(
            "INSERT INTO game_event (time, client, session, product, token) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id",
        )
        .bind(row.time)
        .bind(row.client.value())
        .bind(row.session.as_str())
        .bind(row.product.as_str())
        .bind(row.token.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "game_event"))?;

        let detail_query = match details {
            EventDetails::SessionStart { platform } => sqlx::query(
                "INSERT INTO event_session_start (game_event_id, platform) VALUES ($1, $2)",
            )
            .bind(event_id)
            .bind(platform),
            EventDetails::SessionEnd => {
                sqlx::query("INSERT INTO event_session_end (game_event_id) VALUES ($1)")
                    .bind(event_id)
            }
            EventDetails::Business {
                cart_type,
                item_type,
                item_id,
                amount,
                currency,
            } => sqlx::query(
                "INSERT INTO event_business \
                 (game_event_id, cart_type, item_type, item_id, amount, currency) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(event_id)
            .bind(cart_type)
            .bind(item_type)
            .bind(item_id)
            .bind(amount)
            .bind(currency),
            EventDetails::Error { message, severity } => sqlx::query(
                "INSERT INTO event_error (game_event_id, message, severity) VALUES ($1, $2, $3)",
            )
            .bind(event_id)
            .bind(message)
            .bind(severity.as_str()),
            EventDetails::Progression {
                status,
                progression01,
                progression02,
                progression03,
                value,
            } => sqlx::query(
                "INSERT INTO event_progression \
                 (game_event_id, status, progression01, progression02, progression03, value) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(event_id)
            .bind(status)
            .bind(progression01)
            .bind(progression02)
            .bind(progression03)
            .bind(*value),
            EventDetails::Quality { fps, memory_usage } => sqlx::query(
                "INSERT INTO event_quality (game_event_id, fps, memory_usage) VALUES ($1, $2, $3)",
            )
            .bind(event_id)
            .bind(*fps)
            .bind(*memory_usage),
            EventDetails::Resource {
                flow_type,
                item_type,
                item_id,
                amount,
                resource_currency,
            } => sqlx::query(
                "INSERT INTO event_resource \
                 (game_event_id, flow_type, item_type, item_id, amount, resource_currency) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(event_id)
            .bind(flow_type)
            .bind(item_type)
            .bind(item_id)
            .bind(*amount)
            .bind(resource_currency),
            EventDetails::Custom {
                field1,
                field2,
                field3,
                field4,
                field5,
            } => sqlx::query(
                "INSERT INTO event_custom \
                 (game_event_id, field1, field2, field3, field4, field5) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(event_id)
            .bind(field1)
            .bind(field2)
            .bind(field3)
            .bind(field4)
            .bind(field5),
        };

        detail_query.execute(&mut *tx).await.map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;

        Ok(event_id)
    }

    async fn query_series(
        &self,
        metric: Metric,
        product: &ProductId,
        range: BucketRange,
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        let view = view_for(metric);

        // revenue_per_currency keeps one row per currency; collapse at
        // query time so every metric yields one value per bucket.
        let query = if metric == Metric::RevenuePerCurrency {
            format!(
                "SELECT bucket, SUM(value) AS value FROM {view} \
                 WHERE product = $1 AND bucket >= $2 AND bucket <= $3 \
                 GROUP BY bucket ORDER BY bucket"
            )
        } else {
            format!(
                "SELECT bucket, value FROM {view} \
                 WHERE product = $1 AND bucket >= $2 AND bucket <= $3 \
                 ORDER BY bucket"
            )
        };

        let rows: Vec<(DateTime<Utc>, f64)> = sqlx::query_as(&query)
            .bind(product.as_str())
            .bind(range.start)
            .bind(range.end)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(rows
            .into_iter()
            .map(|(bucket, value)| SeriesPoint { bucket, value })
            .collect())
    }

    async fn bucket_bounds(
        &self,
        metric: Metric,
        product: &ProductId,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let view = view_for(metric);
        let query = format!("SELECT MIN(bucket), MAX(bucket) FROM {view} WHERE product = $1");

        let (min, max): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(&query)
            .bind(product.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(min.zip(max))
    }
}

/// The aggregate view backing a metric.
fn view_for(metric: Metric) -> &'static str {
    match metric {
        Metric::ActiveUsers => "agg_active_users",
        Metric::AvgFps => "agg_avg_fps",
        Metric::AvgMemoryUsage => "agg_avg_memory_usage",
        Metric::AvgSessionDuration => "agg_avg_session_duration",
        Metric::RevenuePerCurrency => "agg_revenue_per_currency",
        Metric::Arppu => "agg_arppu",
        Metric::CrashRate => "agg_crash_rate",
        Metric::EventCount => "agg_event_count",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_metric_has_a_view() {
        for m in [
            Metric::ActiveUsers,
            Metric::AvgFps,
            Metric::AvgMemoryUsage,
            Metric::AvgSessionDuration,
            Metric::RevenuePerCurrency,
            Metric::Arppu,
            Metric::CrashRate,
            Metric::EventCount,
        ] {
            assert!(view_for(m).starts_with("agg_"));
        }
    }

    #[test]
    fn bad_url_is_a_connection_error() {
        let config = PostgresConfig {
            url: "not a url".into(),
            ..PostgresConfig::default()
        };
        let err = build_connect_options(&config).unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
