//! Live KPI streaming endpoint.
//!
//! `GET /v1/kpi/stream` serves a long-lived SSE response: an initial
//! snapshot of the requested metric's bucketed series, then a poll loop
//! that re-sends the most recent bucket when its value changes and sends
//! strictly-newer buckets once, with best-effort live delta frames merged
//! in between polls from the in-process [`LivePublisher`] fan-out.
//!
//! Each poll iteration runs one store query and drops it before the next
//! suspension point; no transaction is held while the connection idles.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use telemetra_core::{Metric, MetricUpdate, ProductId, SeriesPoint};
use telemetra_store::{BucketRange, EventStore};

use super::AppState;

/// Frames buffered between the stream task and the HTTP writer.
const FRAME_BUFFER: usize = 64;

/// `update_interval` bounds, in seconds.
const MIN_INTERVAL: u64 = 1;
const MAX_INTERVAL: u64 = 30;
const DEFAULT_INTERVAL: u64 = 5;

/// Tracks active SSE connections per product.
///
/// A `HashMap<String, Arc<AtomicUsize>>` behind a `tokio::sync::RwLock`:
/// the write lock is only taken to insert a product's counter, never held
/// for the duration of a stream.
pub struct ConnectionRegistry {
    connections: tokio::sync::RwLock<HashMap<String, Arc<AtomicUsize>>>,
    max_per_product: usize,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(max_per_product: usize) -> Self {
        Self {
            connections: tokio::sync::RwLock::new(HashMap::new()),
            max_per_product,
        }
    }

    /// Try to take a stream slot for a product. `None` when the product is
    /// at its cap.
    pub async fn try_acquire(&self, product: &ProductId) -> Option<ConnectionGuard> {
        {
            let conns = self.connections.read().await;
            if let Some(counter) = conns.get(product.as_str()) {
                return Self::bump(counter, self.max_per_product);
            }
        }
        let mut conns = self.connections.write().await;
        let counter = conns
            .entry(product.as_str().to_owned())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        Self::bump(counter, self.max_per_product)
    }

    fn bump(counter: &Arc<AtomicUsize>, max: usize) -> Option<ConnectionGuard> {
        if counter.load(Ordering::Relaxed) >= max {
            return None;
        }
        counter.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            counter: Arc::clone(counter),
        })
    }
}

/// Releases the stream slot on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Raw query parameters. Everything is optional at the extractor level so
/// a missing or malformed value yields the protocol-level
/// `data: Invalid request` frame instead of an axum rejection.
#[derive(Debug, Default, Deserialize)]
pub struct KpiQuery {
    pub product_id: Option<String>,
    pub metric: Option<String>,
    /// RFC 3339. Defaults to the metric's earliest bucket.
    pub start_time: Option<String>,
    /// RFC 3339. Defaults open-ended so future buckets keep streaming.
    pub end_time: Option<String>,
    /// Seconds between polls, clamped to `1..=30`.
    pub update_interval: Option<String>,
}

#[derive(Debug)]
struct StreamParams {
    product: ProductId,
    metric: Metric,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    interval: Duration,
}

impl StreamParams {
    /// Validate raw query parameters. Any missing required or malformed
    /// value is an error; the caller answers with the invalid-request
    /// frame.
    fn parse(query: KpiQuery) -> Result<Self, ()> {
        let product = match query.product_id.as_deref() {
            Some(p) if !p.is_empty() => ProductId::from(p),
            _ => return Err(()),
        };
        let metric = match query.metric.as_deref() {
            None => Metric::ActiveUsers,
            Some(raw) => Metric::parse(raw).ok_or(())?,
        };
        let start = query.start_time.as_deref().map(parse_time).transpose()?;
        let end = query.end_time.as_deref().map(parse_time).transpose()?;
        let seconds = match query.update_interval.as_deref() {
            None => DEFAULT_INTERVAL,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ())?
                .clamp(MIN_INTERVAL, MAX_INTERVAL),
        };
        Ok(Self {
            product,
            metric,
            start,
            end,
            interval: Duration::from_secs(seconds),
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, ()> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ())
}

type FrameStream = BoxStream<'static, Result<Event, Infallible>>;

/// `GET /v1/kpi/stream` -- subscribe to a product's KPI series.
///
/// Sends every matching bucket ascending, then keeps the series current:
/// polled re-reads catch aggregate updates, live delta frames bridge the
/// gap between polls for session-driven metrics.
pub async fn kpi_stream(
    State(state): State<AppState>,
    Query(query): Query<KpiQuery>,
) -> Result<Sse<KeepAliveStream<FrameStream>>, StatusCode> {
    let Ok(params) = StreamParams::parse(query) else {
        debug!("rejecting KPI stream with invalid parameters");
        return Ok(sse(invalid_request_stream()));
    };

    let Some(guard) = state.connections.try_acquire(&params.product).await else {
        warn!(product = %params.product, "SSE connection cap reached");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    };

    let (tx, rx) = mpsc::channel::<Event>(FRAME_BUFFER);
    let store = Arc::clone(&state.store);
    let live = state.live.subscribe();
    tokio::spawn(async move {
        // Guard lives for the whole stream; dropped when the task ends.
        let _guard = guard;
        run_stream(store.as_ref(), live, &params, &tx).await;
    });

    let frames = ReceiverStream::new(rx).map(Ok::<_, Infallible>).boxed();
    Ok(sse(frames))
}

fn sse(stream: FrameStream) -> Sse<KeepAliveStream<FrameStream>> {
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// One `data: Invalid request` frame, then end of body.
fn invalid_request_stream() -> FrameStream {
    futures::stream::once(async { Ok(Event::default().data("Invalid request")) }).boxed()
}

/// Serialize a frame payload. These payload types cannot fail to
/// serialize; a failure is logged and the frame skipped.
fn data_frame<T: serde::Serialize>(payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize SSE frame");
            None
        }
    }
}

/// Drive one connection: snapshot, then poll + live merge until the
/// client disconnects or the store fails.
async fn run_stream(
    store: &dyn EventStore,
    mut live: broadcast::Receiver<MetricUpdate>,
    params: &StreamParams,
    tx: &mpsc::Sender<Event>,
) {
    let Some(range) = resolve_range(store, params).await else {
        return;
    };

    // Initial snapshot, ascending by bucket.
    let mut last: Option<SeriesPoint> = match store
        .query_series(params.metric, &params.product, range)
        .await
    {
        Ok(points) => {
            for point in &points {
                if !send(tx, data_frame(point)).await {
                    return;
                }
            }
            points.into_iter().next_back()
        }
        Err(e) => {
            warn!(error = %e, metric = %params.metric, "initial snapshot query failed, closing stream");
            return;
        }
    };

    let mut live_open = true;
    loop {
        tokio::select! {
            () = tokio::time::sleep(params.interval) => {
                let from = last.as_ref().map_or(range.start, |p| p.bucket);
                let poll = BucketRange { start: from, end: range.end };
                let points = match store
                    .query_series(params.metric, &params.product, poll)
                    .await
                {
                    Ok(points) => points,
                    Err(e) => {
                        warn!(error = %e, metric = %params.metric, "poll query failed, closing stream");
                        return;
                    }
                };
                for point in points {
                    if !worth_sending(&point, last.as_ref()) {
                        continue;
                    }
                    if !send(tx, data_frame(&point)).await {
                        return;
                    }
                    last = Some(point);
                }
            }
            update = live.recv(), if live_open => {
                match update {
                    Ok(u) if u.product == params.product && u.metric == params.metric => {
                        if !send(tx, data_frame(&u)).await {
                            return;
                        }
                    }
                    // Delta for a different topic, or we fell behind the
                    // broadcast; the poll loop re-reads authoritative
                    // values either way.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    // Publisher gone; polling alone keeps the series
                    // current.
                    Err(broadcast::error::RecvError::Closed) => live_open = false,
                }
            }
        }
    }
}

/// Apply time-range defaults: start falls back to the metric's earliest
/// bucket, end stays open unless the client capped it. `None` closes the
/// stream (store failure).
async fn resolve_range(store: &dyn EventStore, params: &StreamParams) -> Option<BucketRange> {
    let start = match params.start {
        Some(start) => start,
        None => match store.bucket_bounds(params.metric, &params.product).await {
            Ok(bounds) => bounds.map_or(DateTime::<Utc>::MIN_UTC, |(min, _)| min),
            Err(e) => {
                warn!(error = %e, "bucket bounds query failed, closing stream");
                return None;
            }
        },
    };
    let end = params.end.unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(BucketRange { start, end })
}

/// A polled row is sent when it is strictly newer than the last-sent
/// bucket, or when it is the last-sent bucket with a changed value
/// (late-arriving updates to the still-open bucket).
fn worth_sending(point: &SeriesPoint, last: Option<&SeriesPoint>) -> bool {
    match last {
        None => true,
        Some(l) if point.bucket > l.bucket => true,
        Some(l) => point.bucket == l.bucket && (point.value - l.value).abs() > f64::EPSILON,
    }
}

/// `false` when the client is gone.
async fn send(tx: &mpsc::Sender<Event>, frame: Option<Event>) -> bool {
    match frame {
        Some(event) => tx.send(event).await.is_ok(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(hour: u32, value: f64) -> SeriesPoint {
        SeriesPoint {
            bucket: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
            value,
        }
    }

    #[test]
    fn params_require_product() {
        assert!(StreamParams::parse(KpiQuery::default()).is_err());
        let q = KpiQuery {
            product_id: Some(String::new()),
            ..KpiQuery::default()
        };
        assert!(StreamParams::parse(q).is_err());
    }

    #[test]
    fn params_default_metric_and_interval() {
        let q = KpiQuery {
            product_id: Some("7".into()),
            ..KpiQuery::default()
        };
        let params = StreamParams::parse(q).unwrap();
        assert_eq!(params.metric, Metric::ActiveUsers);
        assert_eq!(params.interval, Duration::from_secs(5));
        assert!(params.start.is_none());
        assert!(params.end.is_none());
    }

    #[test]
    fn params_clamp_interval() {
        for (raw, want) in [("0", 1), ("3", 3), ("120", 30)] {
            let q = KpiQuery {
                product_id: Some("7".into()),
                update_interval: Some(raw.into()),
                ..KpiQuery::default()
            };
            let params = StreamParams::parse(q).unwrap();
            assert_eq!(params.interval, Duration::from_secs(want));
        }
    }

    #[test]
    fn params_reject_bad_metric_and_time() {
        let q = KpiQuery {
            product_id: Some("7".into()),
            metric: Some("dau".into()),
            ..KpiQuery::default()
        };
        assert!(StreamParams::parse(q).is_err());

        let q = KpiQuery {
            product_id: Some("7".into()),
            start_time: Some("yesterday".into()),
            ..KpiQuery::default()
        };
        assert!(StreamParams::parse(q).is_err());
    }

    #[test]
    fn resend_policy() {
        let last = point(2, 10.0);
        // Unchanged last bucket: skip.
        assert!(!worth_sending(&point(2, 10.0), Some(&last)));
        // Last bucket moved: re-send.
        assert!(worth_sending(&point(2, 11.0), Some(&last)));
        // Strictly newer: send once.
        assert!(worth_sending(&point(3, 1.0), Some(&last)));
        // Older than last-sent: skip.
        assert!(!worth_sending(&point(1, 5.0), Some(&last)));
        // Nothing sent yet: everything goes.
        assert!(worth_sending(&point(0, 0.0), None));
    }

    #[tokio::test]
    async fn registry_caps_per_product() {
        let registry = ConnectionRegistry::new(2);
        let product = ProductId::from("7");
        let other = ProductId::from("8");

        let a = registry.try_acquire(&product).await;
        let b = registry.try_acquire(&product).await;
        assert!(a.is_some() && b.is_some());
        assert!(registry.try_acquire(&product).await.is_none());
        // Cap is per product.
        assert!(registry.try_acquire(&other).await.is_some());

        drop(a);
        assert!(registry.try_acquire(&product).await.is_some());
    }
}
