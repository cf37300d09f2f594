use uuid::Uuid;

use super::codec::DecodeError;

// ============================================================================
// Event Store Errors
// ============================================================================
//
// Nothing here is retried or downgraded by the store. Every variant is
// surfaced to the caller with enough detail to decide what to do next.
//
// ============================================================================

pub type Result<T> = std::result::Result<T, EventStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error(
        "Concurrency conflict on stream {stream_id}: expected version {expected_version}, \
         but current is {actual_version}"
    )]
    ConcurrencyConflict {
        stream_id: Uuid,
        expected_version: i64,
        actual_version: i64,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Expected version {0} is negative or leaves no room for the batch")]
    InvalidExpectedVersion(i64),

    #[error("Cannot append empty event list")]
    EmptyAppend,

    #[error("Operation cancelled")]
    Cancelled,
}

impl EventStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// The stream's actual version when this is a concurrency conflict
    pub fn actual_version(&self) -> Option<i64> {
        match self {
            Self::ConcurrencyConflict { actual_version, .. } => Some(*actual_version),
            _ => None,
        }
    }
}

/// Infrastructure failure in the backing store
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for EventStoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(e))
    }
}
