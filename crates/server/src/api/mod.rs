//! HTTP API: provisioning endpoints, liveness, and the KPI SSE stream.

pub mod health;
pub mod stream;
pub mod tenants;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use telemetra_ingest::LivePublisher;
use telemetra_provision::Provisioner;
use telemetra_store::EventStore;

use stream::ConnectionRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub provisioner: Arc<Provisioner>,
    /// Live metric fan-out; SSE connections subscribe to it.
    pub live: LivePublisher,
    pub connections: Arc<ConnectionRegistry>,
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/tenants", post(tenants::create_tenant))
        .route("/v1/tenants/{tenant}/tokens", post(tenants::issue_token))
        .route("/v1/kpi/stream", get(stream::kpi_stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
