//! PostgreSQL (optionally TimescaleDB) backend for the event store.

mod config;
mod migrations;
mod store;

pub use config::PostgresConfig;
pub use store::PostgresEventStore;
