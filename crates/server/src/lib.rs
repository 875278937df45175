//! Telemetra HTTP/SSE server.
//!
//! Hosts the provisioning API, the live KPI stream, and -- in the
//! single-process memory-broker mode -- the consumer workers themselves.

pub mod api;
pub mod config;
pub mod telemetry;
