//! Session lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::{ClientId, SessionId, TokenValue};

/// One continuous play interval for a client.
///
/// Created by a `start_session` event, closed by exactly one later
/// `end_session` event. Uniqueness of the client-supplied id is scoped to
/// (token, client), so ids from different installs never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub token: TokenValue,
    pub client: ClientId,
    pub platform: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end; recomputed on every save where both
    /// ends are present.
    pub duration_secs: Option<i64>,
}

impl Session {
    /// Open a new session.
    #[must_use]
    pub fn start(
        id: SessionId,
        token: TokenValue,
        client: ClientId,
        platform: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            token,
            client,
            platform: platform.into(),
            start_time,
            end_time: None,
            duration_secs: None,
        }
    }

    /// Close the session at `end_time`.
    ///
    /// Enforces `start_time < end_time`; a close at or before the start is
    /// rejected without mutating the session. Closing an already-closed
    /// session is also rejected (one end event per session).
    pub fn close(&mut self, end_time: DateTime<Utc>) -> Result<(), EventError> {
        if self.end_time.is_some() {
            return Err(EventError::Validation(format!(
                "session {} already ended",
                self.id
            )));
        }
        if end_time <= self.start_time {
            return Err(EventError::Validation(format!(
                "session {} end time {} is not after start time {}",
                self.id, end_time, self.start_time
            )));
        }
        self.end_time = Some(end_time);
        self.recompute_duration();
        Ok(())
    }

    /// Recompute `duration_secs` from the two endpoints. No-op while the
    /// session is still open.
    pub fn recompute_duration(&mut self) {
        self.duration_secs = self
            .end_time
            .map(|end| (end - self.start_time).num_seconds());
    }

    /// Whether the session has not yet received its end event.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    fn open_session() -> Session {
        Session::start(
            SessionId::from("S1"),
            TokenValue::from("tok"),
            ClientId(1),
            "pc",
            t(0),
        )
    }

    #[test]
    fn close_computes_duration() {
        let mut s = open_session();
        s.close(t(600)).unwrap();
        assert_eq!(s.duration_secs, Some(600));
        assert!(!s.is_open());
    }

    #[test]
    fn close_before_start_rejected() {
        let mut s = open_session();
        let err = s.close(t(-10)).unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
        assert!(s.is_open());
        assert_eq!(s.duration_secs, None);
    }

    #[test]
    fn close_at_start_rejected() {
        let mut s = open_session();
        assert!(s.close(t(0)).is_err());
    }

    #[test]
    fn double_close_rejected() {
        let mut s = open_session();
        s.close(t(60)).unwrap();
        let err = s.close(t(120)).unwrap_err();
        assert!(matches!(err, EventError::Validation(_)));
        // First close stands.
        assert_eq!(s.duration_secs, Some(60));
    }

    #[test]
    fn recompute_is_noop_while_open() {
        let mut s = open_session();
        s.recompute_duration();
        assert_eq!(s.duration_secs, None);
    }
}
