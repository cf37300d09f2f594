use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event_sourcing::core::{EventRecord, NewEvent, Result};

// ============================================================================
// Persistence Backend - the seam between the store and durable storage
// ============================================================================
//
// A backend owns the `(stream_id, version)` keyspace. `append` must perform
// the check-and-insert as a single atomic operation of the storage layer
// itself, so that independent processes sharing the same storage cannot
// both commit the same version.
//
// ============================================================================

#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Commit `events` at versions `expected_version + 1 ..` if and only if
    /// the stream's current version equals `expected_version`.
    ///
    /// Either every event is committed or none is. On a stale
    /// `expected_version` this returns `ConcurrencyConflict` carrying the
    /// actual version.
    async fn append(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>>;

    /// `max(version)` over the stream, 0 when nothing was ever committed
    async fn current_version(&self, stream_id: Uuid) -> Result<i64>;

    /// Events with `version > from_version`, ascending by version
    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>>;

    /// Events with `from <= created_at < to` across all streams, ordered by
    /// `(created_at, stream_id, version)` and starting strictly after `after`
    async fn read_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<AuditCursor>,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>>;
}

/// Position in the audit ordering `(created_at, stream_id, version)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuditCursor {
    pub created_at: DateTime<Utc>,
    pub stream_id: Uuid,
    pub version: i64,
}

impl AuditCursor {
    /// Cursor pointing just past `record`
    pub fn after(record: &EventRecord) -> Self {
        Self {
            created_at: record.created_at,
            stream_id: record.stream_id,
            version: record.version,
        }
    }
}

// ============================================================================
// Clock - commit timestamps for backends that don't have their own
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic range tests
#[derive(Clone, Debug)]
pub struct ManualClock {
    current: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: std::sync::Arc::new(std::sync::Mutex::new(start)),
        }
    }

    /// Move the clock forward by `delta`
    pub fn advance(&self, delta: chrono::Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
