//! Wire payloads for the eight telemetry event kinds.
//!
//! Field names follow the SDK wire format (camelCase where the SDK sends
//! camelCase), so `serde_json::from_slice` on a raw broker message body
//! yields the typed payload directly. Every payload references its parent
//! session; the session must exist before any non-start event is accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClientId, ProductId, SessionId};

/// Error event severity, matching the SDK's severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Debug,
    Warning,
    Error,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Debug => "Debug",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Info" => Some(Self::Info),
            "Debug" => Some(Self::Debug),
            "Warning" => Some(Self::Warning),
            "Error" => Some(Self::Error),
            "Critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// `start_session` — opens a new session for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub platform: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductId>,
}

/// `end_session` — closes a previously started session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndPayload {
    pub session: SessionId,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientId>,
}

/// `business` — an in-game purchase or transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    #[serde(rename = "cartType")]
    pub cart_type: String,
    #[serde(rename = "itemType")]
    pub item_type: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub amount: f64,
    pub currency: String,
}

/// `error` — a client-reported error or crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
}

/// `progression` — level/stage progression tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    #[serde(rename = "progressionStatus")]
    pub progression_status: String,
    pub progression01: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progression02: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progression03: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// `quality` — sampled performance measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    #[serde(rename = "FPS")]
    pub fps: f64,
    #[serde(rename = "memoryUsage")]
    pub memory_usage: f64,
}

/// `resource` — virtual-currency sources and sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    #[serde(rename = "flowType")]
    pub flow_type: String,
    #[serde(rename = "itemType")]
    pub item_type: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub amount: f64,
    #[serde(rename = "resourceCurrency")]
    pub resource_currency: String,
}

/// `custom` — game-defined events with up to five free-form fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPayload {
    pub session: SessionId,
    pub client: ClientId,
    pub time: DateTime<Utc>,
    pub custom_field1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_field2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_field3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_field4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_field5: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_start_wire_format() {
        let json = r#"{
            "session": "S1",
            "client": 17,
            "platform": "pc",
            "time": "2024-01-01T00:00:00Z"
        }"#;
        let p: SessionStartPayload = serde_json::from_str(json).unwrap();
        assert_eq!(p.session.as_str(), "S1");
        assert_eq!(p.client.value(), 17);
        assert_eq!(p.platform, "pc");
        assert!(p.product.is_none());
    }

    #[test]
    fn business_camel_case_fields() {
        let json = r#"{
            "session": "S1",
            "client": 1,
            "time": "2024-01-01T00:00:00Z",
            "cartType": "shop",
            "itemType": "gem_pack",
            "itemId": "gems_500",
            "amount": 4.99,
            "currency": "USD"
        }"#;
        let p: BusinessPayload = serde_json::from_str(json).unwrap();
        assert_eq!(p.cart_type, "shop");
        assert_eq!(p.item_id, "gems_500");
        assert!((p.amount - 4.99).abs() < f64::EPSILON);
    }

    #[test]
    fn quality_uppercase_fps() {
        let json = r#"{
            "session": "S1",
            "client": 1,
            "time": "2024-01-01T00:00:00Z",
            "FPS": 59.8,
            "memoryUsage": 812.0
        }"#;
        let p: QualityPayload = serde_json::from_str(json).unwrap();
        assert!((p.fps - 59.8).abs() < f64::EPSILON);
    }

    #[test]
    fn severity_variants() {
        let s: Severity = serde_json::from_str("\"Critical\"").unwrap();
        assert_eq!(s, Severity::Critical);
        assert!(serde_json::from_str::<Severity>("\"Fatal\"").is_err());
    }

    #[test]
    fn missing_required_field_is_error() {
        let json = r#"{"session": "S1", "time": "2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<SessionStartPayload>(json).is_err());
    }
}
