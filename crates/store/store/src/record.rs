//! Row shapes written by the event handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use telemetra_core::{ClientId, ProductId, SessionId, Severity, TenantId, TokenValue};

/// A registered tenant with its broker credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub display_name: String,
    pub broker_username: String,
    pub broker_password: String,
}

/// The envelope columns shared by every telemetry event.
///
/// `(time, client, session)` is the uniqueness triple; the store rejects a
/// second insert of the same triple with `StoreError::Duplicate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub time: DateTime<Utc>,
    pub client: ClientId,
    pub session: SessionId,
    pub product: ProductId,
    pub token: TokenValue,
}

/// Kind-specific columns, written atomically with the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventDetails {
    SessionStart {
        platform: String,
    },
    SessionEnd,
    Business {
        cart_type: String,
        item_type: String,
        item_id: String,
        amount: f64,
        currency: String,
    },
    Error {
        message: String,
        severity: Severity,
    },
    Progression {
        status: String,
        progression01: String,
        progression02: Option<String>,
        progression03: Option<String>,
        value: Option<f64>,
    },
    Quality {
        fps: f64,
        memory_usage: f64,
    },
    Resource {
        flow_type: String,
        item_type: String,
        item_id: String,
        amount: f64,
        resource_currency: String,
    },
    Custom {
        field1: String,
        field2: Option<String>,
        field3: Option<String>,
        field4: Option<String>,
        field5: Option<String>,
    },
}

impl EventDetails {
    /// Short label used in logs and the specialized table name.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd => "session_end",
            Self::Business { .. } => "business",
            Self::Error { .. } => "error",
            Self::Progression { .. } => "progression",
            Self::Quality { .. } => "quality",
            Self::Resource { .. } => "resource",
            Self::Custom { .. } => "custom",
        }
    }
}
