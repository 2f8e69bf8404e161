use ulid::Ulid;

use crate::model::{BookingStatus, ConflictEntry};

#[derive(Debug)]
pub enum EngineError {
    /// Overlapping claim on a resource. An expected outcome of normal
    /// operation, not a bug: carries the opposing bookings so callers can
    /// show who holds the interval.
    Conflict {
        resource_id: Ulid,
        conflicts: Vec<ConflictEntry>,
    },
    Validation(String),
    /// The state machine has no such edge. State is unchanged.
    InvalidTransition {
        booking_id: Ulid,
        from: BookingStatus,
        attempted: &'static str,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    /// Journal write or replay I/O failure. Retryable at a higher layer;
    /// never downgraded to an empty success.
    Journal(String),
    /// On-disk structure no longer matches the code. Fatal, not retryable.
    Corrupt(String),
}

impl EngineError {
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::Journal(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Conflict { .. } => "conflict",
            EngineError::Validation(_) => "validation",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Journal(_) => "journal",
            EngineError::Corrupt(_) => "corrupt",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict {
                resource_id,
                conflicts,
            } => {
                write!(
                    f,
                    "conflict on resource {resource_id}: {} opposing booking(s)",
                    conflicts.len()
                )
            }
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::InvalidTransition {
                booking_id,
                from,
                attempted,
            } => {
                write!(
                    f,
                    "booking {booking_id}: no transition '{attempted}' from {}",
                    from.as_str()
                )
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(what) => write!(f, "forbidden: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
            EngineError::Corrupt(e) => write!(f, "storage corrupt: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
