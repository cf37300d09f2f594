use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::event_sourcing::core::{
    EventRecord, EventStoreError, NewEvent, PersistenceError, Result,
};
use super::backend::{AuditCursor, Clock, EventBackend, SystemClock};

// ============================================================================
// In-Memory Backend
// ============================================================================
//
// Process-local implementation of `EventBackend`. Every stream owns its own
// lock, and the version check plus the insert happen while holding it, so
// appends to one stream never wait on the check of another.
//
// The audit index is shared. An append holds it only to stamp `created_at`
// and insert its cursors, which keeps the index order identical to commit
// order. Lock order is always stream, then index. Readers clone under a
// short lock and never hold one across an await point.
//
// ============================================================================

type StreamLog = Arc<Mutex<Vec<EventRecord>>>;

pub struct InMemoryEventBackend {
    streams: RwLock<HashMap<Uuid, StreamLog>>,
    by_time: RwLock<BTreeMap<AuditCursor, EventRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            by_time: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Total number of committed events across all streams
    pub fn len(&self) -> Result<usize> {
        Ok(self.by_time.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn stream(&self, stream_id: &Uuid) -> Result<Option<StreamLog>> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams.get(stream_id).cloned())
    }

    fn stream_or_create(&self, stream_id: Uuid) -> Result<StreamLog> {
        if let Some(log) = self.stream(&stream_id)? {
            return Ok(log);
        }
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        Ok(streams.entry(stream_id).or_default().clone())
    }
}

impl Default for InMemoryEventBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> EventStoreError {
    PersistenceError::Unavailable("in-memory ledger lock poisoned".to_string()).into()
}

#[async_trait]
impl EventBackend for InMemoryEventBackend {
    async fn append(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>> {
        let last_version = expected_version
            .checked_add(events.len() as i64)
            .ok_or(EventStoreError::InvalidExpectedVersion(expected_version))?;

        let log = self.stream_or_create(stream_id)?;
        let mut stream = log.lock().map_err(|_| poisoned())?;

        let actual_version = stream.len() as i64;
        if actual_version != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected_version,
                actual_version,
            });
        }

        let mut index = self.by_time.write().map_err(|_| poisoned())?;
        let created_at = self.clock.now();
        let committed: Vec<EventRecord> = events
            .into_iter()
            .zip((expected_version..last_version).map(|v| v + 1))
            .map(|(event, version)| EventRecord {
                id: Uuid::now_v7(),
                stream_id,
                stream_type: event.stream_type,
                event_type: event.event_type,
                payload: event.payload,
                metadata: event.metadata,
                version,
                created_at,
            })
            .collect();

        for record in &committed {
            index.insert(AuditCursor::after(record), record.clone());
        }
        stream.extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn current_version(&self, stream_id: Uuid) -> Result<i64> {
        match self.stream(&stream_id)? {
            Some(log) => Ok(log.lock().map_err(|_| poisoned())?.len() as i64),
            None => Ok(0),
        }
    }

    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let Some(log) = self.stream(&stream_id)? else {
            return Ok(Vec::new());
        };
        let events = log.lock().map_err(|_| poisoned())?;

        // Versions are 1-based and gapless, so version `v` lives at index `v - 1`
        let start = usize::try_from(from_version.max(0))
            .unwrap_or(usize::MAX)
            .min(events.len());
        let take = limit_to_usize(limit);

        Ok(events[start..].iter().take(take).cloned().collect())
    }

    async fn read_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<AuditCursor>,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        if from >= to {
            return Ok(Vec::new());
        }

        let floor = AuditCursor {
            created_at: from,
            stream_id: Uuid::nil(),
            version: i64::MIN,
        };
        let lower = match after {
            Some(cursor) if cursor >= floor => Bound::Excluded(cursor),
            _ => Bound::Included(floor),
        };

        let index = self.by_time.read().map_err(|_| poisoned())?;
        Ok(index
            .range((lower, Bound::Unbounded))
            .take_while(|(cursor, _)| cursor.created_at < to)
            .take(limit_to_usize(limit))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

fn limit_to_usize(limit: Option<i64>) -> usize {
    match limit {
        Some(n) => usize::try_from(n.max(0)).unwrap_or(usize::MAX),
        None => usize::MAX,
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{Codec, JsonCodec};
    use crate::event_sourcing::store::backend::ManualClock;
    use chrono::TimeZone;

    fn event(event_type: &str, n: i64) -> NewEvent {
        NewEvent::new(
            "Invoice",
            event_type,
            JsonCodec.encode(&serde_json::json!({ "n": n })).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_append_assigns_next_versions() {
        let backend = InMemoryEventBackend::new();
        let stream_id = Uuid::new_v4();
        assert!(backend.is_empty().unwrap());

        let first = backend.append(stream_id, 0, vec![event("InvoiceSubmitted", 1)]).await.unwrap();
        assert_eq!(first[0].version, 1);

        let rest = backend
            .append(stream_id, 1, vec![event("InvoiceApproved", 2), event("InvoicePaid", 3)])
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(backend.current_version(stream_id).await.unwrap(), 3);
        assert_eq!(backend.len().unwrap(), 3);
        assert!(!backend.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_version_overflow_is_rejected() {
        let backend = InMemoryEventBackend::new();
        let stream_id = Uuid::new_v4();

        let err = backend
            .append(stream_id, i64::MAX, vec![event("E", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidExpectedVersion(i64::MAX)));
        assert!(backend.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_held_stream_lock_does_not_block_other_streams() {
        let backend = InMemoryEventBackend::new();
        let busy = Uuid::new_v4();
        backend.append(busy, 0, vec![event("E", 0)]).await.unwrap();

        let log = backend.stream(&busy).unwrap().unwrap();
        let _held = log.lock().unwrap();

        let other = Uuid::new_v4();
        let committed = backend.append(other, 0, vec![event("E", 1)]).await.unwrap();
        assert_eq!(committed[0].version, 1);
        assert_eq!(backend.current_version(other).await.unwrap(), 1);
        assert_eq!(backend.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_and_future_expected_versions_conflict() {
        let backend = InMemoryEventBackend::new();
        let stream_id = Uuid::new_v4();
        backend.append(stream_id, 0, vec![event("InvoiceSubmitted", 1)]).await.unwrap();

        for expected in [0, 5] {
            let err = backend
                .append(stream_id, expected, vec![event("InvoiceApproved", 2)])
                .await
                .unwrap_err();
            assert_eq!(err.actual_version(), Some(1));
        }
        assert_eq!(backend.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_stream_bounds() {
        let backend = InMemoryEventBackend::new();
        let stream_id = Uuid::new_v4();
        for v in 0..5 {
            backend.append(stream_id, v, vec![event("E", v)]).await.unwrap();
        }

        let tail = backend.read_stream(stream_id, 3, None).await.unwrap();
        assert_eq!(tail.iter().map(|r| r.version).collect::<Vec<_>>(), vec![4, 5]);

        let page = backend.read_stream(stream_id, 1, Some(2)).await.unwrap();
        assert_eq!(page.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2, 3]);

        assert!(backend.read_stream(stream_id, 99, None).await.unwrap().is_empty());
        assert_eq!(backend.read_stream(stream_id, -4, None).await.unwrap().len(), 5);
        assert!(backend.read_stream(Uuid::new_v4(), 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_uses_clock_and_half_open_interval() {
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let backend = InMemoryEventBackend::with_clock(Arc::new(clock.clone()));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        backend.append(a, 0, vec![event("E", 0)]).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        backend.append(b, 0, vec![event("E", 1)]).await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        backend.append(a, 1, vec![event("E", 2)]).await.unwrap();

        let minute = chrono::Duration::minutes(1);
        let window = backend
            .read_by_date_range(start, start + minute + minute, None, None)
            .await
            .unwrap();
        assert_eq!(
            window.iter().map(|r| (r.stream_id, r.version)).collect::<Vec<_>>(),
            vec![(a, 1), (b, 1)]
        );

        assert!(backend.read_by_date_range(start, start, None, None).await.unwrap().is_empty());
    }
}
