use thiserror::Error;

use telemetra_core::EventError;

/// Errors from event store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation on `(time, client, session)` or another
    /// identity column. For event inserts this is the duplicate-delivery
    /// signal, not a failure.
    #[error("duplicate row: {0}")]
    Duplicate(String),

    /// A domain invariant was violated (e.g. session end not after start).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Random-id assignment exhausted its retry budget.
    #[error("id space exhausted after {attempts} attempts")]
    IdExhausted { attempts: u32 },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for EventError {
    /// Map store failures onto the processing taxonomy that drives the
    /// consumer's ack/nack decision.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EventError::NotFound(what),
            StoreError::Duplicate(_) => EventError::Duplicate,
            StoreError::Constraint(what) => EventError::Validation(what),
            StoreError::Connection(e) | StoreError::Backend(e) => EventError::Transient(e),
            StoreError::IdExhausted { attempts } => {
                EventError::Transient(format!("client id space exhausted ({attempts} attempts)"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_idempotent_ack() {
        let err: EventError = StoreError::Duplicate("game_event".into()).into();
        assert!(matches!(err, EventError::Duplicate));
        assert!(err.is_permanent());
    }

    #[test]
    fn backend_maps_to_transient() {
        let err: EventError = StoreError::Backend("pool closed".into()).into();
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_is_neither_permanent_nor_transient() {
        let err: EventError = StoreError::NotFound("session S1".into()).into();
        assert!(!err.is_permanent());
        assert!(!err.is_transient());
    }
}
