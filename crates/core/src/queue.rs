//! Queue kinds and the broker queue naming scheme.
//!
//! Every issued token owns one durable broker queue per event kind it
//! reports. The broker-visible name is derived deterministically as
//! `{tenant}.{vhost}.{logical_name}.{kind}`; the tenant prefix makes names
//! globally unique across tenants. Routing never re-parses that string --
//! catalog records carry the kind as a structured field.

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::{TenantId, VhostId};

/// The logical event category a broker queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    StartSession,
    EndSession,
    Business,
    Error,
    Progression,
    Quality,
    Resource,
    Custom,
}

impl QueueKind {
    /// All kinds, in the order queues are provisioned for a new token.
    pub const ALL: [QueueKind; 8] = [
        Self::StartSession,
        Self::EndSession,
        Self::Business,
        Self::Error,
        Self::Progression,
        Self::Quality,
        Self::Resource,
        Self::Custom,
    ];

    /// The wire segment used in broker queue names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::EndSession => "end_session",
            Self::Business => "business",
            Self::Error => "error",
            Self::Progression => "progression",
            Self::Quality => "quality",
            Self::Resource => "resource",
            Self::Custom => "custom",
        }
    }

    /// Parse a wire segment back into a kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_session" => Some(Self::StartSession),
            "end_session" => Some(Self::EndSession),
            "business" => Some(Self::Business),
            "error" => Some(Self::Error),
            "progression" => Some(Self::Progression),
            "quality" => Some(Self::Quality),
            "resource" => Some(Self::Resource),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the globally unique broker queue name for one logical queue.
///
/// Deterministic and side-effect free. Fails only on malformed input:
/// an empty logical name, or segments containing the `.` separator
/// (which would corrupt the name structure).
pub fn queue_name(
    tenant: &TenantId,
    vhost: &VhostId,
    logical_name: &str,
    kind: QueueKind,
) -> Result<String, EventError> {
    if logical_name.is_empty() {
        return Err(EventError::Validation(
            "queue logical name must not be empty".into(),
        ));
    }
    for (label, segment) in [
        ("tenant", tenant.as_str()),
        ("vhost", vhost.as_str()),
        ("logical name", logical_name),
    ] {
        if segment.contains('.') {
            return Err(EventError::Validation(format!(
                "queue {label} must not contain '.': {segment:?}"
            )));
        }
    }
    Ok(format!("{tenant}.{vhost}.{logical_name}.{kind}"))
}

/// A provisioned queue as recorded in the catalog.
///
/// `kind` is stored explicitly; consumers select queues by this field,
/// never by splitting `full_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Broker-visible name, unique across all tenants.
    pub full_name: String,
    /// The caller-chosen logical name, unique per (token, kind).
    pub logical_name: String,
    /// The event kind this queue carries.
    pub kind: QueueKind,
    /// The token this queue belongs to.
    pub token: crate::types::TokenValue,
    /// The vhost the queue lives in.
    pub vhost: VhostId,
}
