mod admin;
mod config;

pub use admin::RabbitMqAdmin;
pub use config::RabbitMqConfig;
