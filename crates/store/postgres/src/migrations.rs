//! Schema setup: base tables, the event hypertable, and the hourly
//! aggregate views.
//!
//! With TimescaleDB available, `game_event` becomes a hypertable and the
//! aggregates are continuous materialized views with refresh policies.
//! Without it, plain SQL views over `date_trunc` expose the identical
//! query surface (computed at query time instead of incrementally).

use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Run idempotent migrations against the pool.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    for statement in base_tables() {
        sqlx::query(statement).execute(pool).await?;
    }

    if config.timescale {
        sqlx::query(
            "SELECT create_hypertable('game_event', 'time', if_not_exists => TRUE, migrate_data => TRUE)",
        )
        .execute(pool)
        .await?;
    }

    for statement in aggregate_views(config.timescale) {
        sqlx::query(&statement).execute(pool).await?;
    }

    if config.timescale {
        for statement in refresh_policies() {
            sqlx::query(statement).execute(pool).await?;
        }
    }

    Ok(())
}

fn base_tables() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS tenant (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            broker_username TEXT NOT NULL,
            broker_password TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS token (
            value TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tenant TEXT NOT NULL REFERENCES tenant(id),
            product TEXT NOT NULL,
            vhost TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS queue (
            full_name TEXT PRIMARY KEY,
            logical_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            token TEXT NOT NULL REFERENCES token(value),
            vhost TEXT NOT NULL,
            UNIQUE (token, logical_name, kind)
        )",
        "CREATE TABLE IF NOT EXISTS client (
            token TEXT NOT NULL REFERENCES token(value),
            id BIGINT NOT NULL,
            PRIMARY KEY (token, id)
        )",
        "CREATE TABLE IF NOT EXISTS session (
            token TEXT NOT NULL,
            client BIGINT NOT NULL,
            id TEXT NOT NULL,
            platform TEXT NOT NULL,
            start_time TIMESTAMPTZ NOT NULL,
            end_time TIMESTAMPTZ,
            duration_secs BIGINT,
            PRIMARY KEY (token, client, id),
            CHECK (end_time IS NULL OR end_time > start_time)
        )",
        // The append-only envelope. The uniqueness triple contains `time`,
        // which also satisfies the hypertable partitioning requirement.
        "CREATE TABLE IF NOT EXISTS game_event (
            id BIGINT GENERATED ALWAYS AS IDENTITY,
            time TIMESTAMPTZ NOT NULL,
            client BIGINT NOT NULL,
            session TEXT NOT NULL,
            product TEXT NOT NULL,
            token TEXT NOT NULL,
            UNIQUE (time, client, session)
        )",
        "CREATE INDEX IF NOT EXISTS game_event_product_time_idx
            ON game_event (product, time)",
        "CREATE TABLE IF NOT EXISTS event_session_start (
            game_event_id BIGINT NOT NULL,
            platform TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_session_end (
            game_event_id BIGINT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_business (
            game_event_id BIGINT NOT NULL,
            cart_type TEXT NOT NULL,
            item_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            amount DOUBLE PRECISION NOT NULL,
            currency TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_error (
            game_event_id BIGINT NOT NULL,
            message TEXT NOT NULL,
            severity TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_progression (
            game_event_id BIGINT NOT NULL,
            status TEXT NOT NULL,
            progression01 TEXT NOT NULL,
            progression02 TEXT,
            progression03 TEXT,
            value DOUBLE PRECISION
        )",
        "CREATE TABLE IF NOT EXISTS event_quality (
            game_event_id BIGINT NOT NULL,
            fps DOUBLE PRECISION NOT NULL,
            memory_usage DOUBLE PRECISION NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_resource (
            game_event_id BIGINT NOT NULL,
            flow_type TEXT NOT NULL,
            item_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            amount DOUBLE PRECISION NOT NULL,
            resource_currency TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS event_custom (
            game_event_id BIGINT NOT NULL,
            field1 TEXT NOT NULL,
            field2 TEXT,
            field3 TEXT,
            field4 TEXT,
            field5 TEXT
        )",
    ]
}

/// The aggregate view definitions: (view name, SELECT body).
///
/// Every view exposes `(bucket, product, value)`; `revenue_per_currency`
/// additionally exposes `currency` and is summed at query time.
fn view_bodies(bucket: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "agg_active_users",
            format!(
                "SELECT {bucket} AS bucket, product,
                        count(DISTINCT ge.client)::DOUBLE PRECISION AS value
                 FROM game_event ge
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_event_count",
            format!(
                "SELECT {bucket} AS bucket, product,
                        count(*)::DOUBLE PRECISION AS value
                 FROM game_event ge
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_avg_fps",
            format!(
                "SELECT {bucket} AS bucket, ge.product, avg(q.fps) AS value
                 FROM game_event ge
                 JOIN event_quality q ON q.game_event_id = ge.id
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_avg_memory_usage",
            format!(
                "SELECT {bucket} AS bucket, ge.product, avg(q.memory_usage) AS value
                 FROM game_event ge
                 JOIN event_quality q ON q.game_event_id = ge.id
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_avg_session_duration",
            format!(
                "SELECT {bucket} AS bucket, ge.product,
                        avg(s.duration_secs)::DOUBLE PRECISION AS value
                 FROM game_event ge
                 JOIN session s
                   ON s.token = ge.token AND s.client = ge.client AND s.id = ge.session
                 WHERE s.duration_secs IS NOT NULL
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_revenue_per_currency",
            format!(
                "SELECT {bucket} AS bucket, ge.product, b.currency, sum(b.amount) AS value
                 FROM game_event ge
                 JOIN event_business b ON b.game_event_id = ge.id
                 GROUP BY 1, 2, 3"
            ),
        ),
        (
            "agg_arppu",
            format!(
                "SELECT {bucket} AS bucket, ge.product,
                        sum(b.amount) / greatest(count(DISTINCT ge.client), 1) AS value
                 FROM game_event ge
                 JOIN event_business b ON b.game_event_id = ge.id
                 GROUP BY 1, 2"
            ),
        ),
        (
            "agg_crash_rate",
            format!(
                "SELECT {bucket} AS bucket, ge.product,
                        avg(CASE WHEN e.severity = 'Critical' THEN 1.0 ELSE 0.0 END) AS value
                 FROM game_event ge
                 JOIN event_error e ON e.game_event_id = ge.id
                 GROUP BY 1, 2"
            ),
        ),
    ]
}

fn aggregate_views(timescale: bool) -> Vec<String> {
    let bucket = if timescale {
        "time_bucket('1 hour', ge.time)"
    } else {
        "date_trunc('hour', ge.time)"
    };
    view_bodies(bucket)
        .into_iter()
        .map(|(name, body)| {
            if timescale {
                format!(
                    "CREATE MATERIALIZED VIEW IF NOT EXISTS {name}
                     WITH (timescaledb.continuous) AS {body}
                     WITH NO DATA"
                )
            } else {
                format!("CREATE OR REPLACE VIEW {name} AS {body}")
            }
        })
        .collect()
}

fn refresh_policies() -> Vec<&'static str> {
    vec![
        // Active users refresh fast; the rest on a 15 minute cadence.
        "SELECT add_continuous_aggregate_policy('agg_active_users',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '30 seconds',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_event_count',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_avg_fps',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_avg_memory_usage',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_avg_session_duration',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_revenue_per_currency',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_arppu',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
        "SELECT add_continuous_aggregate_policy('agg_crash_rate',
            start_offset => INTERVAL '7 days',
            end_offset => INTERVAL '1 hour',
            schedule_interval => INTERVAL '15 minutes',
            if_not_exists => TRUE)",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_views_use_date_trunc() {
        let views = aggregate_views(false);
        assert_eq!(views.len(), 8);
        assert!(views.iter().all(|v| v.contains("date_trunc('hour'")));
        assert!(views.iter().all(|v| v.starts_with("CREATE OR REPLACE VIEW")));
    }

    #[test]
    fn timescale_views_are_continuous() {
        let views = aggregate_views(true);
        assert!(views.iter().all(|v| v.contains("timescaledb.continuous")));
        assert!(views.iter().all(|v| v.contains("time_bucket('1 hour'")));
    }

    #[test]
    fn one_policy_per_view() {
        assert_eq!(refresh_policies().len(), aggregate_views(true).len());
    }
}
