//! Liveness endpoint.

use axum::Json;
use serde_json::{Value, json};

/// `GET /health` -- process liveness. No backend round-trips.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
