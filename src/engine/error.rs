use ulid::Ulid;

use crate::model::{Ms, Rank};

/// Constraint named in a [`StoreError::UniqueViolation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// Another row already features this event.
    EventId { existing: Ulid },
    /// Two rows would share a rank at commit.
    Rank(Rank),
}

/// Failures of the slot store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    UniqueViolation(Constraint),
    MissingRow(Ulid),
    Wal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UniqueViolation(Constraint::EventId { existing }) => {
                write!(f, "unique violation on event_id (held by slot {existing})")
            }
            StoreError::UniqueViolation(Constraint::Rank(rank)) => {
                write!(f, "unique violation on rank {rank}")
            }
            StoreError::MissingRow(id) => write!(f, "row vanished during transaction: {id}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(&'static str),
    InvalidWindow { starts_at: Ms, ends_at: Ms },
    CapacityExceeded { max_active: usize, overlapping: usize },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidWindow { starts_at, ends_at } => {
                write!(f, "invalid window: ends_at {ends_at} is before starts_at {starts_at}")
            }
            EngineError::CapacityExceeded {
                max_active,
                overlapping,
            } => write!(
                f,
                "capacity exceeded: {overlapping} active slots already overlap this window (max {max_active})"
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
