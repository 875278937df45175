pub mod admin;
pub mod consume;
pub mod error;

pub use admin::{AccountCredentials, BrokerAdmin};
pub use consume::{Acknowledger, Delivery, MessageSource};
pub use error::BrokerError;
