//! Live KPI stream types.
//!
//! Dashboards subscribe to a topic keyed by (product, metric). The
//! authoritative numbers come from the store's bucketed aggregate views;
//! the live updates published here are best-effort deltas that give
//! dashboards low-latency movement between aggregate refreshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ProductId;

/// A KPI exposed through the aggregate views and the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Distinct clients per bucket; live deltas track currently-open sessions.
    ActiveUsers,
    AvgFps,
    AvgMemoryUsage,
    AvgSessionDuration,
    RevenuePerCurrency,
    Arppu,
    CrashRate,
    EventCount,
}

impl Metric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveUsers => "active_users",
            Self::AvgFps => "avg_fps",
            Self::AvgMemoryUsage => "avg_memory_usage",
            Self::AvgSessionDuration => "avg_session_duration",
            Self::RevenuePerCurrency => "revenue_per_currency",
            Self::Arppu => "arppu",
            Self::CrashRate => "crash_rate",
            Self::EventCount => "event_count",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active_users" => Some(Self::ActiveUsers),
            "avg_fps" => Some(Self::AvgFps),
            "avg_memory_usage" => Some(Self::AvgMemoryUsage),
            "avg_session_duration" => Some(Self::AvgSessionDuration),
            "revenue_per_currency" => Some(Self::RevenuePerCurrency),
            "arppu" => Some(Self::Arppu),
            "crash_rate" => Some(Self::CrashRate),
            "event_count" => Some(Self::EventCount),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a bucketed aggregate series, as queried from the store and
/// as framed over SSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Start of the time bucket.
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

/// A best-effort incremental update published on an accepted
/// session-lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUpdate {
    pub product: ProductId,
    pub metric: Metric,
    /// Signed change (`+1` on session start, `-1` on session end).
    pub delta: i64,
    pub at: DateTime<Utc>,
}

impl MetricUpdate {
    /// The fan-out topic this update is published on.
    #[must_use]
    pub fn topic(&self) -> String {
        topic(&self.product, self.metric)
    }
}

/// Topic key for a (product, metric) pair: `{product}.{metric}`.
#[must_use]
pub fn topic(product: &ProductId, metric: Metric) -> String {
    format!("{product}.{metric}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_wire_roundtrip() {
        for m in [
            Metric::ActiveUsers,
            Metric::AvgFps,
            Metric::AvgMemoryUsage,
            Metric::AvgSessionDuration,
            Metric::RevenuePerCurrency,
            Metric::Arppu,
            Metric::CrashRate,
            Metric::EventCount,
        ] {
            assert_eq!(Metric::parse(m.as_str()), Some(m));
        }
        assert_eq!(Metric::parse("dau"), None);
    }

    #[test]
    fn topic_key() {
        let update = MetricUpdate {
            product: ProductId::from("7"),
            metric: Metric::ActiveUsers,
            delta: 1,
            at: Utc::now(),
        };
        assert_eq!(update.topic(), "7.active_users");
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&Metric::AvgSessionDuration).unwrap();
        assert_eq!(json, "\"avg_session_duration\"");
    }
}
