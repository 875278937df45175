//! TOML configuration for the server binary.
//!
//! Every section and field has a default, so an empty (or missing) config
//! file yields a runnable single-process setup: memory broker, memory
//! store, bind on localhost.

use serde::Deserialize;

use telemetra_broker_rabbitmq::RabbitMqConfig;
use telemetra_store_postgres::PostgresConfig;

/// Top-level configuration, deserialized from the TOML file named on the
/// command line.
#[derive(Debug, Default, Deserialize)]
pub struct TelemetraConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on how long shutdown waits for consumer workers to settle
    /// their in-flight message.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Concurrent SSE stream cap per product.
    #[serde(default = "default_max_sse")]
    pub max_sse_connections_per_product: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            max_sse_connections_per_product: default_max_sse(),
        }
    }
}

/// Which broker implementation backs provisioning and consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process queues; provisioning and consumption in one process.
    Memory,
    /// RabbitMQ management API. Provisioning only -- event delivery is
    /// consumed out of RabbitMQ by a separately deployed ingest process.
    Rabbitmq,
}

#[derive(Debug, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_backend")]
    pub backend: BrokerBackend,
    /// Required when `backend = "rabbitmq"`.
    pub rabbitmq: Option<RabbitMqConfig>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: default_broker_backend(),
            rabbitmq: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Required when `backend = "postgres"`.
    pub postgres: Option<PostgresConfig>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            postgres: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    /// How long a worker blocks waiting for a delivery before re-checking
    /// for shutdown, in milliseconds.
    #[serde(default = "default_receive_wait")]
    pub receive_wait_ms: u64,
    /// Backoff after an idle sweep across a kind's queues, in milliseconds.
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff_ms: u64,
    /// Capacity of the live metric broadcast channel.
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            receive_wait_ms: default_receive_wait(),
            idle_backoff_ms: default_idle_backoff(),
            live_capacity: default_live_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    20
}

fn default_max_sse() -> usize {
    100
}

fn default_broker_backend() -> BrokerBackend {
    BrokerBackend::Memory
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_receive_wait() -> u64 {
    200
}

fn default_idle_backoff() -> u64 {
    1000
}

fn default_live_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_a_full_config() {
        let cfg: TelemetraConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.broker.backend, BrokerBackend::Memory);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.consumer.receive_wait_ms, 200);
    }

    #[test]
    fn backend_sections_parse() {
        let cfg: TelemetraConfig = toml::from_str(
            r#"
            [server]
            port = 9100
            max_sse_connections_per_product = 4

            [broker]
            backend = "rabbitmq"

            [broker.rabbitmq]
            api_url = "http://mq:15672/api"
            admin_user = "admin"
            admin_password = "secret"

            [store]
            backend = "postgres"

            [store.postgres]
            url = "postgres://telemetra@db/telemetra"
            timescale = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.max_sse_connections_per_product, 4);
        assert_eq!(cfg.broker.backend, BrokerBackend::Rabbitmq);
        assert_eq!(
            cfg.broker.rabbitmq.unwrap().api_url,
            "http://mq:15672/api"
        );
        assert_eq!(cfg.store.backend, StoreBackend::Postgres);
        assert!(!cfg.store.postgres.unwrap().timescale);
    }
}
