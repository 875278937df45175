use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use futures::StreamExt;
use tower::ServiceExt;

use telemetra_broker_memory::MemoryBroker;
use telemetra_ingest::LivePublisher;
use telemetra_provision::{CatalogRefresh, Provisioner};
use telemetra_server::api::stream::ConnectionRegistry;
use telemetra_server::api::{AppState, router};
use telemetra_store_memory::MemoryEventStore;

// -- Helpers --------------------------------------------------------------

fn build_state(max_sse_per_product: usize) -> AppState {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryEventStore::new());
    let provisioner = Arc::new(Provisioner::new(
        broker,
        Arc::clone(&store) as _,
        CatalogRefresh::new(),
    ));
    AppState {
        store,
        provisioner,
        live: LivePublisher::default(),
        connections: Arc::new(ConnectionRegistry::new(max_sse_per_product)),
    }
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create_tenant(state: &AppState, id: &str) -> serde_json::Value {
    let response = router(state.clone())
        .oneshot(post_json(
            "/v1/tenants",
            serde_json::json!({ "id": id, "display_name": id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

// -- Health ---------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok() {
    let response = router(build_state(10))
        .oneshot(get("/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

// -- Provisioning ---------------------------------------------------------

#[tokio::test]
async fn tenant_registration_returns_credentials_once() {
    let state = build_state(10);
    let json = create_tenant(&state, "acme").await;
    assert_eq!(json["id"], "acme");
    assert_eq!(json["broker_username"], "acme");
    assert_eq!(json["broker_password"].as_str().unwrap().len(), 64);

    // Second registration is fatal: the password cannot be recovered.
    let response = router(state)
        .oneshot(post_json(
            "/v1/tenants",
            serde_json::json!({ "id": "acme", "display_name": "Acme again" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn token_issuance_provisions_a_queue_per_kind() {
    let state = build_state(10);
    create_tenant(&state, "acme").await;

    let response = router(state)
        .oneshot(post_json(
            "/v1/tenants/acme/tokens",
            serde_json::json!({ "product_id": "7", "name": "shipped" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["token"].as_str().unwrap().len(), 64);
    assert_eq!(json["product_id"], "7");
    assert_eq!(json["vhost"], "acme_vhost");
    assert_eq!(json["queues"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn token_for_unknown_tenant_is_not_found() {
    let response = router(build_state(10))
        .oneshot(post_json(
            "/v1/tenants/ghost/tokens",
            serde_json::json!({ "product_id": "7", "name": "shipped" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_logical_name_is_rejected() {
    let state = build_state(10);
    create_tenant(&state, "acme").await;

    let response = router(state)
        .oneshot(post_json(
            "/v1/tenants/acme/tokens",
            serde_json::json!({ "product_id": "7", "name": "dots.break.names" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// -- KPI stream -----------------------------------------------------------

#[tokio::test]
async fn stream_without_product_sends_invalid_request_frame() {
    let response = router(build_state(10))
        .oneshot(get("/v1/kpi/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
    // The stream ends after the single frame, so the body is finite.
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: Invalid request"), "body: {text}");
}

#[tokio::test]
async fn stream_with_unknown_metric_sends_invalid_request_frame() {
    let response = router(build_state(10))
        .oneshot(get("/v1/kpi/stream?product_id=7&metric=dau"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: Invalid request"), "body: {text}");
}

#[tokio::test]
async fn stream_cap_answers_too_many_requests() {
    let response = router(build_state(0))
        .oneshot(get("/v1/kpi/stream?product_id=7"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

async fn seed_event(store: &dyn telemetra_store::EventStore, time: chrono::DateTime<chrono::Utc>) {
    store
        .insert_event(
            &telemetra_store::EventRow {
                time,
                client: telemetra_core::ClientId(1),
                session: telemetra_core::SessionId::from("S1"),
                product: telemetra_core::ProductId::from("7"),
                token: telemetra_core::TokenValue::from("tok-1"),
            },
            &telemetra_store::EventDetails::SessionEnd,
        )
        .await
        .unwrap();
}

/// Parse the `data:` payloads of every complete frame in the buffer,
/// skipping keep-alive comments and any trailing partial frame.
fn data_points(buf: &str) -> Vec<serde_json::Value> {
    let end = buf.rfind("\n\n").map_or(0, |i| i + 2);
    buf[..end]
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[tokio::test]
async fn snapshot_then_new_bucket_within_one_interval() {
    use chrono::TimeZone;

    let state = build_state(10);
    let store = Arc::clone(&state.store);
    let base = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    for hour in 0..3 {
        seed_event(store.as_ref(), base + chrono::TimeDelta::hours(hour)).await;
    }

    let response = router(state)
        .oneshot(get(
            "/v1/kpi/stream?product_id=7&metric=event_count&update_interval=1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut frames = response.into_body().into_data_stream();

    // Initial snapshot: exactly the three seeded buckets, ascending.
    let mut buf = String::new();
    while data_points(&buf).len() < 3 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("snapshot should arrive promptly")
            .expect("stream should stay open")
            .unwrap();
        buf.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    let points = data_points(&buf);
    assert_eq!(points.len(), 3, "snapshot frames: {points:?}");
    for (i, point) in points.iter().enumerate() {
        let bucket = chrono::DateTime::parse_from_rfc3339(point["bucket"].as_str().unwrap())
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(bucket, base + chrono::TimeDelta::hours(i as i64));
        assert!((point["value"].as_f64().unwrap() - 1.0).abs() < f64::EPSILON);
    }

    // A bucket inserted after connect is polled out within the interval.
    seed_event(store.as_ref(), base + chrono::TimeDelta::hours(3)).await;
    while data_points(&buf).len() < 4 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("new bucket should arrive within one update interval")
            .expect("stream should stay open")
            .unwrap();
        buf.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    let points = data_points(&buf);
    let bucket = chrono::DateTime::parse_from_rfc3339(points[3]["bucket"].as_str().unwrap())
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert_eq!(bucket, base + chrono::TimeDelta::hours(3));
}

#[tokio::test]
async fn live_deltas_are_framed_to_subscribers() {
    let state = build_state(10);
    let live = state.live.clone();

    let response = router(state)
        .oneshot(get("/v1/kpi/stream?product_id=7&update_interval=30"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The subscription exists before the response is returned, so a
    // publish now is never missed.
    live.publish(telemetra_core::MetricUpdate {
        product: telemetra_core::ProductId::from("7"),
        metric: telemetra_core::Metric::ActiveUsers,
        delta: 1,
        at: chrono::Utc::now(),
    });

    let mut frames = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("a delta frame should arrive well before the poll interval")
        .expect("stream should stay open")
        .unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.contains("\"delta\":1"), "frame: {text}");
}
