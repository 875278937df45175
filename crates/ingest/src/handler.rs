//! One [`EventHandler`] per event kind.
//!
//! Handlers turn a raw queue message into store writes and, for session
//! lifecycle events, a live KPI delta. They never acknowledge anything
//! themselves; the router maps their error taxonomy onto ack/nack.
//!
//! Redelivery safety: handlers tolerate partial progress from an earlier
//! attempt (session row already created, session already closed) and let
//! the envelope's `(time, client, session)` uniqueness make the final
//! insert idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use telemetra_core::{
    BusinessPayload, ClientId, CustomPayload, ErrorPayload, EventError, Metric, MetricUpdate,
    ProgressionPayload, QualityPayload, QueueKind, QueueRecord, ResourcePayload, Session,
    SessionEndPayload, SessionId, SessionStartPayload, Token, TokenValue,
};
use telemetra_store::{EventDetails, EventRow, EventStore, StoreError};

use crate::live::LivePublisher;

/// Shared collaborators handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn EventStore>,
    pub live: LivePublisher,
}

/// Processes messages of one event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Process one message body from one of this kind's queues.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError>;
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, EventError> {
    serde_json::from_slice(body).map_err(|e| EventError::Validation(format!("malformed payload: {e}")))
}

/// The token behind a queue. A missing token is `NotFound`: catalog and
/// token table can briefly disagree around retirement.
async fn resolve_token(ctx: &HandlerContext, value: &TokenValue) -> Result<Token, EventError> {
    ctx.store
        .resolve_token(value)
        .await
        .map_err(EventError::from)?
        .ok_or_else(|| EventError::NotFound(format!("token {value}")))
}

/// Require the session to exist, then write the envelope + specialized row.
async fn persist_event(
    ctx: &HandlerContext,
    token: &Token,
    session: &SessionId,
    client: ClientId,
    time: DateTime<Utc>,
    details: EventDetails,
) -> Result<(), EventError> {
    let found = ctx
        .store
        .find_session(&token.value, session, Some(client))
        .await
        .map_err(EventError::from)?;
    if found.is_none() {
        return Err(EventError::NotFound(format!("session {session}")));
    }

    let row = EventRow {
        time,
        client,
        session: session.clone(),
        product: token.product.clone(),
        token: token.value.clone(),
    };
    ctx.store.insert_event(&row, &details).await?;
    Ok(())
}

/// `start_session`: register the session, write the event pair, publish
/// a `+1` active-users delta.
pub struct StartSessionHandler;

#[async_trait]
impl EventHandler for StartSessionHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::StartSession
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let payload: SessionStartPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;

        // Clients register through the token-claim flow before reporting.
        let known = ctx
            .store
            .client_exists(&token.value, payload.client)
            .await
            .map_err(EventError::from)?;
        if !known {
            return Err(EventError::NotFound(format!("client {}", payload.client)));
        }

        let session = Session::start(
            payload.session.clone(),
            token.value.clone(),
            payload.client,
            payload.platform.clone(),
            payload.time,
        );
        match ctx.store.create_session(&session).await {
            // An existing row is a redelivery; the envelope insert below
            // decides whether the whole message is a duplicate.
            Ok(()) | Err(StoreError::Duplicate(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let product = payload.product.unwrap_or_else(|| token.product.clone());
        let row = EventRow {
            time: payload.time,
            client: payload.client,
            session: payload.session,
            product: product.clone(),
            token: token.value,
        };
        ctx.store
            .insert_event(&row, &EventDetails::SessionStart {
                platform: payload.platform,
            })
            .await?;

        ctx.live.publish(MetricUpdate {
            product,
            metric: Metric::ActiveUsers,
            delta: 1,
            at: payload.time,
        });
        Ok(())
    }
}

/// `end_session`: close the session, write the event pair, publish a `-1`
/// active-users delta.
pub struct EndSessionHandler;

#[async_trait]
impl EventHandler for EndSessionHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::EndSession
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let payload: SessionEndPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;

        let session = match ctx
            .store
            .close_session(&token.value, &payload.session, payload.client, payload.time)
            .await
        {
            Ok(session) => session,
            Err(StoreError::Constraint(msg)) => {
                // A redelivered end carries the end time the session
                // already has; the envelope insert settles idempotency.
                // Any other time on a closed session is a second,
                // conflicting end, and a Constraint on an open session
                // means the end time itself was bad.
                let existing = ctx
                    .store
                    .find_session(&token.value, &payload.session, payload.client)
                    .await
                    .map_err(EventError::from)?;
                match existing {
                    Some(s) if s.end_time == Some(payload.time) => s,
                    _ => return Err(EventError::Validation(msg)),
                }
            }
            Err(err) => return Err(err.into()),
        };

        let row = EventRow {
            time: payload.time,
            client: session.client,
            session: payload.session,
            product: token.product.clone(),
            token: token.value,
        };
        ctx.store.insert_event(&row, &EventDetails::SessionEnd).await?;

        ctx.live.publish(MetricUpdate {
            product: token.product,
            metric: Metric::ActiveUsers,
            delta: -1,
            at: payload.time,
        });
        Ok(())
    }
}

pub struct BusinessHandler;

#[async_trait]
impl EventHandler for BusinessHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Business
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: BusinessPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Business {
            cart_type: p.cart_type,
            item_type: p.item_type,
            item_id: p.item_id,
            amount: p.amount,
            currency: p.currency,
        })
        .await
    }
}

pub struct ErrorHandler;

#[async_trait]
impl EventHandler for ErrorHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Error
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: ErrorPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Error {
            message: p.message,
            severity: p.severity,
        })
        .await
    }
}

pub struct ProgressionHandler;

#[async_trait]
impl EventHandler for ProgressionHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Progression
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: ProgressionPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Progression {
            status: p.progression_status,
            progression01: p.progression01,
            progression02: p.progression02,
            progression03: p.progression03,
            value: p.value,
        })
        .await
    }
}

pub struct QualityHandler;

#[async_trait]
impl EventHandler for QualityHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Quality
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: QualityPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Quality {
            fps: p.fps,
            memory_usage: p.memory_usage,
        })
        .await
    }
}

pub struct ResourceHandler;

#[async_trait]
impl EventHandler for ResourceHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Resource
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: ResourcePayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Resource {
            flow_type: p.flow_type,
            item_type: p.item_type,
            item_id: p.item_id,
            amount: p.amount,
            resource_currency: p.resource_currency,
        })
        .await
    }
}

pub struct CustomHandler;

#[async_trait]
impl EventHandler for CustomHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Custom
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        queue: &QueueRecord,
        body: &[u8],
    ) -> Result<(), EventError> {
        let p: CustomPayload = parse(body)?;
        let token = resolve_token(ctx, &queue.token).await?;
        persist_event(ctx, &token, &p.session, p.client, p.time, EventDetails::Custom {
            field1: p.custom_field1,
            field2: p.custom_field2,
            field3: p.custom_field3,
            field4: p.custom_field4,
            field5: p.custom_field5,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use telemetra_core::{ProductId, TenantId, VhostId};
    use telemetra_store_memory::MemoryEventStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    fn queue(kind: QueueKind) -> QueueRecord {
        QueueRecord {
            full_name: format!("studio.studio_vhost.main.{}", kind.as_str()),
            logical_name: "main".into(),
            kind,
            token: TokenValue::from("tok-1"),
            vhost: VhostId::from("studio_vhost"),
        }
    }

    async fn ctx_with_client() -> (HandlerContext, ClientId) {
        let store = MemoryEventStore::new();
        store
            .insert_token(&Token {
                value: TokenValue::from("tok-1"),
                name: "main".into(),
                tenant: TenantId::from("studio"),
                product: ProductId::from("7"),
                vhost: VhostId::from("studio_vhost"),
                created_at: t(0),
            })
            .await
            .unwrap();
        let client = store
            .register_client(&TokenValue::from("tok-1"))
            .await
            .unwrap();
        let ctx = HandlerContext {
            store: Arc::new(store),
            live: LivePublisher::default(),
        };
        (ctx, client)
    }

    fn start_body(client: ClientId, session: &str, secs: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "session": session,
            "client": client.value(),
            "platform": "pc",
            "time": t(secs),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn start_then_end_session() {
        let (ctx, client) = ctx_with_client().await;
        let mut live = ctx.live.subscribe();

        StartSessionHandler
            .handle(&ctx, &queue(QueueKind::StartSession), &start_body(client, "S1", 0))
            .await
            .unwrap();
        assert_eq!(live.recv().await.unwrap().delta, 1);

        let end = serde_json::to_vec(&serde_json::json!({
            "session": "S1",
            "time": t(600),
        }))
        .unwrap();
        EndSessionHandler
            .handle(&ctx, &queue(QueueKind::EndSession), &end)
            .await
            .unwrap();
        assert_eq!(live.recv().await.unwrap().delta, -1);

        let session = ctx
            .store
            .find_session(&TokenValue::from("tok-1"), &SessionId::from("S1"), Some(client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.duration_secs, Some(600));
    }

    #[tokio::test]
    async fn redelivered_start_is_duplicate() {
        let (ctx, client) = ctx_with_client().await;
        let body = start_body(client, "S1", 0);
        let q = queue(QueueKind::StartSession);

        StartSessionHandler.handle(&ctx, &q, &body).await.unwrap();
        let err = StartSessionHandler.handle(&ctx, &q, &body).await.unwrap_err();
        assert!(matches!(err, EventError::Duplicate));
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let (ctx, _) = ctx_with_client().await;
        let err = StartSessionHandler
            .handle(
                &ctx,
                &queue(QueueKind::StartSession),
                &start_body(ClientId(999_999), "S1", 0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::NotFound(_)));
    }

    #[tokio::test]
    async fn end_before_start_is_not_found() {
        let (ctx, _) = ctx_with_client().await;
        let end = serde_json::to_vec(&serde_json::json!({
            "session": "ghost",
            "time": t(600),
        }))
        .unwrap();
        let err = EndSessionHandler
            .handle(&ctx, &queue(QueueKind::EndSession), &end)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::NotFound(_)));
    }

    #[tokio::test]
    async fn end_at_start_time_is_validation() {
        let (ctx, client) = ctx_with_client().await;
        StartSessionHandler
            .handle(&ctx, &queue(QueueKind::StartSession), &start_body(client, "S1", 0))
            .await
            .unwrap();

        let end = serde_json::to_vec(&serde_json::json!({
            "session": "S1",
            "time": t(0),
        }))
        .unwrap();
        let err = EndSessionHandler
            .handle(&ctx, &queue(QueueKind::EndSession), &end)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
    }

    #[tokio::test]
    async fn second_end_with_different_time_is_rejected() {
        let (ctx, client) = ctx_with_client().await;
        let mut live = ctx.live.subscribe();
        let q = queue(QueueKind::EndSession);

        StartSessionHandler
            .handle(&ctx, &queue(QueueKind::StartSession), &start_body(client, "S1", 0))
            .await
            .unwrap();
        let end = |secs: i64| {
            serde_json::to_vec(&serde_json::json!({
                "session": "S1",
                "time": t(secs),
            }))
            .unwrap()
        };
        EndSessionHandler.handle(&ctx, &q, &end(600)).await.unwrap();
        assert_eq!(live.recv().await.unwrap().delta, 1);
        assert_eq!(live.recv().await.unwrap().delta, -1);

        // Redelivery of the same end settles on the envelope row.
        let err = EndSessionHandler.handle(&ctx, &q, &end(600)).await.unwrap_err();
        assert!(matches!(err, EventError::Duplicate));

        // A different end time on a closed session is not a redelivery:
        // dropped without a write and without another delta.
        let err = EndSessionHandler.handle(&ctx, &q, &end(1200)).await.unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
        assert!(live.try_recv().is_err());

        let session = ctx
            .store
            .find_session(&TokenValue::from("tok-1"), &SessionId::from("S1"), Some(client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.end_time, Some(t(600)));
        assert_eq!(session.duration_secs, Some(600));
    }

    #[tokio::test]
    async fn business_requires_existing_session() {
        let (ctx, client) = ctx_with_client().await;
        let body = serde_json::to_vec(&serde_json::json!({
            "session": "S1",
            "client": client.value(),
            "time": t(10),
            "cartType": "shop",
            "itemType": "gem_pack",
            "itemId": "gems_500",
            "amount": 4.99,
            "currency": "USD",
        }))
        .unwrap();
        let q = queue(QueueKind::Business);

        let err = BusinessHandler.handle(&ctx, &q, &body).await.unwrap_err();
        assert!(matches!(err, EventError::NotFound(_)));

        StartSessionHandler
            .handle(&ctx, &queue(QueueKind::StartSession), &start_body(client, "S1", 0))
            .await
            .unwrap();
        BusinessHandler.handle(&ctx, &q, &body).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_body_is_validation() {
        let (ctx, _) = ctx_with_client().await;
        let err = QualityHandler
            .handle(&ctx, &queue(QueueKind::Quality), b"{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
        assert!(err.is_permanent());
    }
}
