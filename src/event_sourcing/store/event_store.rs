use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event_sourcing::core::{
    Codec, EventMetadata, EventRecord, EventStoreError, JsonCodec, NewEvent, Result,
};
use crate::metrics::StoreMetrics;
use super::backend::{AuditCursor, EventBackend};

// ============================================================================
// Event Store - append engine, stream reader, audit range reader
// ============================================================================
//
// Type Parameters:
// - `B`: the persistence backend that owns the `(stream_id, version)` keyspace
// - `C`: the codec used to encode structured payloads and metadata
//
// Responsibilities:
// 1. Append events with optimistic concurrency (expected version)
// 2. Read a stream's events in version order
// 3. Read events across all streams by commit time, for auditing
//
// The store never retries and never resolves a conflict on its own.
//
// ============================================================================

pub struct EventStore<B: EventBackend, C: Codec = JsonCodec> {
    backend: Arc<B>,
    codec: C,
    metrics: Option<Arc<StoreMetrics>>,
}

impl<B: EventBackend, C: Codec + Clone> Clone for EventStore<B, C> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            codec: self.codec.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<B: EventBackend> EventStore<B, JsonCodec> {
    pub fn new(backend: B) -> Self {
        Self::with_codec(backend, JsonCodec)
    }
}

impl<B: EventBackend, C: Codec> EventStore<B, C> {
    pub fn with_codec(backend: B, codec: C) -> Self {
        Self {
            backend: Arc::new(backend),
            codec,
            metrics: None,
        }
    }

    /// Record operation counts and latencies into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    // ------------------------------------------------------------------------
    // Append engine
    // ------------------------------------------------------------------------

    /// Encode `payload` (and `metadata`) and append it as the next event of
    /// `stream_id`. Returns the committed version, `expected_version + 1`.
    pub async fn append<P: Serialize + ?Sized>(
        &self,
        stream_id: Uuid,
        stream_type: &str,
        event_type: &str,
        payload: &P,
        expected_version: i64,
        metadata: Option<&EventMetadata>,
    ) -> Result<i64> {
        let mut event = NewEvent::encode(&self.codec, stream_type, event_type, payload)?;
        if let Some(metadata) = metadata {
            event = event.with_encoded_metadata(&self.codec, metadata)?;
        }

        let record = self.append_event(stream_id, expected_version, event).await?;
        Ok(record.version)
    }

    /// `append`, abandoned with `Cancelled` once `cancel` fires.
    /// `Cancelled` does not mean the event was not written: a commit that
    /// already happened stays committed and is visible to readers.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_cancellable<P: Serialize + ?Sized>(
        &self,
        stream_id: Uuid,
        stream_type: &str,
        event_type: &str,
        payload: &P,
        expected_version: i64,
        metadata: Option<&EventMetadata>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        cancellable(
            cancel,
            self.append(stream_id, stream_type, event_type, payload, expected_version, metadata),
        )
        .await
    }

    /// Append an already encoded event and return the committed record
    pub async fn append_event(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        event: NewEvent,
    ) -> Result<EventRecord> {
        let mut committed = self
            .commit(stream_id, expected_version, vec![event])
            .await?;
        committed
            .pop()
            .ok_or(EventStoreError::EmptyAppend)
    }

    /// Append several events to one stream atomically.
    /// Returns the new version after appending.
    pub async fn append_events(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<i64> {
        let committed = self.commit(stream_id, expected_version, events).await?;
        Ok(committed.last().map(|r| r.version).unwrap_or(expected_version))
    }

    /// `append_events`, abandoned with `Cancelled` once `cancel` fires.
    /// The batch is then either fully committed or not written at all.
    pub async fn append_events_cancellable(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        cancellable(cancel, self.append_events(stream_id, expected_version, events)).await
    }

    async fn commit(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>> {
        let Some(first) = events.first() else {
            return Err(EventStoreError::EmptyAppend);
        };
        // Versions of the whole batch must fit in an i64
        if expected_version < 0 || expected_version.checked_add(events.len() as i64).is_none() {
            return Err(EventStoreError::InvalidExpectedVersion(expected_version));
        }
        let stream_type = first.stream_type.clone();
        let event_count = events.len();

        let started = Instant::now();
        let result = self.backend.append(stream_id, expected_version, events).await;
        self.observe("append", started);

        match &result {
            Ok(committed) => {
                let new_version = committed.last().map(|r| r.version).unwrap_or(expected_version);
                if let Some(metrics) = &self.metrics {
                    metrics.record_append(&stream_type, event_count);
                }
                tracing::info!(
                    stream_id = %stream_id,
                    stream_type = %stream_type,
                    new_version = new_version,
                    event_count = event_count,
                    "✅ Appended events to event store"
                );
            }
            Err(EventStoreError::ConcurrencyConflict { actual_version, .. }) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_conflict(&stream_type);
                }
                tracing::warn!(
                    stream_id = %stream_id,
                    stream_type = %stream_type,
                    expected_version = expected_version,
                    actual_version = *actual_version,
                    "Concurrency conflict, append rejected"
                );
            }
            Err(e) => self.failed("append", stream_id, e),
        }

        result
    }

    // ------------------------------------------------------------------------
    // Stream reader
    // ------------------------------------------------------------------------

    /// All events of a stream in version order. Unknown streams are empty.
    pub async fn read_stream(&self, stream_id: Uuid) -> Result<Vec<EventRecord>> {
        self.read_stream_from(stream_id, 0).await
    }

    /// Events of a stream with `version > from_version`
    pub async fn read_stream_from(
        &self,
        stream_id: Uuid,
        from_version: i64,
    ) -> Result<Vec<EventRecord>> {
        self.read_stream_slice(stream_id, from_version, None).await
    }

    /// At most `limit` events of a stream with `version > from_version`
    pub async fn read_stream_page(
        &self,
        stream_id: Uuid,
        from_version: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        self.read_stream_slice(stream_id, from_version, Some(limit)).await
    }

    pub async fn read_stream_cancellable(
        &self,
        stream_id: Uuid,
        from_version: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<EventRecord>> {
        cancellable(cancel, self.read_stream_from(stream_id, from_version)).await
    }

    async fn read_stream_slice(
        &self,
        stream_id: Uuid,
        from_version: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let started = Instant::now();
        let result = self
            .backend
            .read_stream(stream_id, from_version.max(0), limit)
            .await;
        self.observe("read_stream", started);

        match &result {
            Ok(events) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_read("read_stream", events.len());
                }
                tracing::debug!(
                    "Loaded {} events for stream {} after version {}",
                    events.len(),
                    stream_id,
                    from_version
                );
            }
            Err(e) => self.failed("read_stream", stream_id, e),
        }

        result
    }

    /// Current version of a stream, 0 if nothing was ever appended
    pub async fn current_version(&self, stream_id: Uuid) -> Result<i64> {
        let started = Instant::now();
        let result = self.backend.current_version(stream_id).await;
        self.observe("current_version", started);

        if let Err(e) = &result {
            self.failed("current_version", stream_id, e);
        }
        result
    }

    /// Check if a stream has any events
    pub async fn stream_exists(&self, stream_id: Uuid) -> Result<bool> {
        let version = self.current_version(stream_id).await?;
        Ok(version > 0)
    }

    // ------------------------------------------------------------------------
    // Audit range reader
    // ------------------------------------------------------------------------

    /// Every event with `from <= created_at < to`, across all streams,
    /// ordered by commit time
    pub async fn read_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        self.read_range(from, to, None, None).await
    }

    /// One page of `read_by_date_range`, resuming strictly after `after`.
    /// Pass `AuditCursor::after(last_record)` to fetch the next page.
    pub async fn read_by_date_range_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<AuditCursor>,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        self.read_range(from, to, after, Some(limit)).await
    }

    pub async fn read_by_date_range_cancellable(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<EventRecord>> {
        cancellable(cancel, self.read_by_date_range(from, to)).await
    }

    async fn read_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<AuditCursor>,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        if from >= to {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let result = self.backend.read_by_date_range(from, to, after, limit).await;
        self.observe("read_by_date_range", started);

        match &result {
            Ok(events) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_read("read_by_date_range", events.len());
                }
                tracing::debug!(
                    from = %from,
                    to = %to,
                    count = events.len(),
                    "Loaded audit range"
                );
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_error("read_by_date_range");
                }
                tracing::error!(from = %from, to = %to, error = %e, "Audit range read failed");
            }
        }

        result
    }

    // ------------------------------------------------------------------------
    // Instrumentation helpers
    // ------------------------------------------------------------------------

    fn observe(&self, operation: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_duration(operation, started.elapsed().as_secs_f64());
        }
    }

    fn failed(&self, operation: &str, stream_id: Uuid, error: &EventStoreError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(operation);
        }
        tracing::error!(
            operation = operation,
            stream_id = %stream_id,
            error = %error,
            "Event store operation failed"
        );
    }
}

/// Run `operation` unless `cancel` fires first. A result that is already
/// available wins over a simultaneous cancellation.
async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(EventStoreError::Cancelled);
    }

    tokio::select! {
        biased;
        result = operation => result,
        _ = cancel.cancelled() => Err(EventStoreError::Cancelled),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::DecodeError;
    use crate::event_sourcing::store::memory::InMemoryEventBackend;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct InvoiceSubmitted {
        invoice_number: String,
    }

    fn store() -> EventStore<InMemoryEventBackend> {
        EventStore::new(InMemoryEventBackend::new())
    }

    #[derive(Clone, Copy)]
    enum Stall {
        BeforeCommit,
        AfterCommit,
    }

    /// In-memory backend whose appends hang for a long time, either before
    /// or after the events are committed. `reached` fires when the stall starts.
    struct StallingBackend {
        inner: InMemoryEventBackend,
        stall: Stall,
        reached: Arc<Notify>,
    }

    impl StallingBackend {
        fn new(stall: Stall) -> Self {
            Self {
                inner: InMemoryEventBackend::new(),
                stall,
                reached: Arc::new(Notify::new()),
            }
        }

        async fn hang(&self) {
            self.reached.notify_one();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    #[async_trait]
    impl EventBackend for StallingBackend {
        async fn append(
            &self,
            stream_id: Uuid,
            expected_version: i64,
            events: Vec<NewEvent>,
        ) -> Result<Vec<EventRecord>> {
            if let Stall::BeforeCommit = self.stall {
                self.hang().await;
            }
            let committed = self.inner.append(stream_id, expected_version, events).await?;
            if let Stall::AfterCommit = self.stall {
                self.hang().await;
            }
            Ok(committed)
        }

        async fn current_version(&self, stream_id: Uuid) -> Result<i64> {
            self.inner.current_version(stream_id).await
        }

        async fn read_stream(
            &self,
            stream_id: Uuid,
            from_version: i64,
            limit: Option<i64>,
        ) -> Result<Vec<EventRecord>> {
            self.inner.read_stream(stream_id, from_version, limit).await
        }

        async fn read_by_date_range(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            after: Option<AuditCursor>,
            limit: Option<i64>,
        ) -> Result<Vec<EventRecord>> {
            self.inner.read_by_date_range(from, to, after, limit).await
        }
    }

    /// Cancel `token` as soon as the backend reports that it stalled
    fn cancel_on_stall(backend: &StallingBackend, token: &CancellationToken) {
        let reached = backend.reached.clone();
        let token = token.clone();
        tokio::spawn(async move {
            reached.notified().await;
            token.cancel();
        });
    }

    fn submitted(n: u32) -> InvoiceSubmitted {
        InvoiceSubmitted { invoice_number: format!("INV-{}", n) }
    }

    #[tokio::test]
    async fn test_invoice_scenario() {
        let store = store();
        let stream_id = Uuid::new_v4();

        let v1 = store
            .append(stream_id, "Invoice", "InvoiceSubmitted", &submitted(1), 0, None)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let err = store
            .append(stream_id, "Invoice", "InvoiceSubmitted", &submitted(1), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { actual_version: 1, expected_version: 0, .. }
        ));

        let v2 = store
            .append(stream_id, "Invoice", "InvoiceApproved", &serde_json::json!({}), 1, None)
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let events = store.read_stream(stream_id).await.unwrap();
        assert_eq!(events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(events[0].event_type, "InvoiceSubmitted");
        assert_eq!(events[1].event_type, "InvoiceApproved");
    }

    #[tokio::test]
    async fn test_negative_expected_version_is_rejected() {
        let store = store();
        let err = store
            .append(Uuid::new_v4(), "Plan", "PlanCreated", &serde_json::json!({}), -1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidExpectedVersion(-1)));
    }

    #[tokio::test]
    async fn test_expected_version_overflow_is_rejected() {
        let store = store();
        let stream_id = Uuid::new_v4();

        let err = store
            .append(stream_id, "Plan", "PlanCreated", &serde_json::json!({}), i64::MAX, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidExpectedVersion(i64::MAX)));

        let batch = (0..2)
            .map(|n| NewEvent::encode(store.codec(), "Plan", "PlanAmended", &n).unwrap())
            .collect();
        let err = store.append_events(stream_id, i64::MAX - 1, batch).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidExpectedVersion(v) if v == i64::MAX - 1));

        assert!(store.backend().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let store = store();
        let err = store.append_events(Uuid::new_v4(), 0, vec![]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::EmptyAppend));
    }

    #[tokio::test]
    async fn test_metadata_is_encoded_and_returned() {
        let store = store();
        let stream_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let metadata = EventMetadata::new().with_correlation(correlation_id);

        store
            .append(stream_id, "Claim", "ClaimLodged", &serde_json::json!({"amount": 10}), 0, Some(&metadata))
            .await
            .unwrap();

        let events = store.read_stream(stream_id).await.unwrap();
        let decoded: Option<EventMetadata> = events[0].decode_metadata(store.codec()).unwrap();
        assert_eq!(decoded, Some(metadata));
    }

    #[tokio::test]
    async fn test_corrupt_payload_surfaces_decode_error() {
        let store = store();
        let stream_id = Uuid::new_v4();
        let event = NewEvent::new(
            "Invoice",
            "InvoiceImported",
            crate::event_sourcing::core::EncodedValue::from_raw("<xml/>"),
        );
        store.append_event(stream_id, 0, event).await.unwrap();

        let events = store.read_stream(stream_id).await.unwrap();
        let err = events[0]
            .decode_payload::<InvoiceSubmitted, _>(store.codec())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_stream_exists_and_current_version() {
        let store = store();
        let stream_id = Uuid::new_v4();
        assert!(!store.stream_exists(stream_id).await.unwrap());
        assert_eq!(store.current_version(stream_id).await.unwrap(), 0);

        let batch = (0..3)
            .map(|n| NewEvent::encode(store.codec(), "Plan", "PlanAmended", &n).unwrap())
            .collect();
        let version = store.append_events(stream_id, 0, batch).await.unwrap();

        assert_eq!(version, 3);
        assert!(store.stream_exists(stream_id).await.unwrap());
        assert_eq!(store.current_version(stream_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_page_with_non_positive_limit_is_empty() {
        let store = store();
        let stream_id = Uuid::new_v4();
        store
            .append(stream_id, "Plan", "PlanCreated", &serde_json::json!({}), 0, None)
            .await
            .unwrap();

        assert!(store.read_stream_page(stream_id, 0, 0).await.unwrap().is_empty());
        assert_eq!(store.read_stream_page(stream_id, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_append() {
        let store = store();
        let stream_id = Uuid::new_v4();
        let token = CancellationToken::new();
        token.cancel();

        let event = NewEvent::encode(store.codec(), "Invoice", "InvoiceSubmitted", &submitted(2)).unwrap();
        let err = store
            .append_events_cancellable(stream_id, 0, vec![event], &token)
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Cancelled));
        assert_eq!(store.current_version(stream_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_token_lets_operations_through() {
        let store = store();
        let stream_id = Uuid::new_v4();
        let token = CancellationToken::new();

        let event = NewEvent::encode(store.codec(), "Invoice", "InvoiceSubmitted", &submitted(3)).unwrap();
        let version = store
            .append_events_cancellable(stream_id, 0, vec![event], &token)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let events = store.read_stream_cancellable(stream_id, 0, &token).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_after_commit_keeps_event_visible() {
        let backend = StallingBackend::new(Stall::AfterCommit);
        let token = CancellationToken::new();
        cancel_on_stall(&backend, &token);
        let store = EventStore::new(backend);
        let stream_id = Uuid::new_v4();

        let err = store
            .append_cancellable(stream_id, "Invoice", "InvoiceSubmitted", &submitted(5), 0, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled));

        let events = store.read_stream(stream_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, 1);
        let payload: InvoiceSubmitted = events[0].decode_payload(store.codec()).unwrap();
        assert_eq!(payload, submitted(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_commit_writes_nothing() {
        let backend = StallingBackend::new(Stall::BeforeCommit);
        let token = CancellationToken::new();
        cancel_on_stall(&backend, &token);
        let store = EventStore::new(backend);
        let stream_id = Uuid::new_v4();

        let err = store
            .append_cancellable(stream_id, "Invoice", "InvoiceSubmitted", &submitted(6), 0, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled));

        assert!(store.read_stream(stream_id).await.unwrap().is_empty());
        assert_eq!(store.current_version(stream_id).await.unwrap(), 0);
        assert!(store.backend().inner.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_cancellable_range_read() {
        let store = store();
        let stream_id = Uuid::new_v4();
        let from = Utc::now() - chrono::Duration::seconds(5);
        store
            .append(stream_id, "Invoice", "InvoiceSubmitted", &submitted(7), 0, None)
            .await
            .unwrap();
        let to = Utc::now() + chrono::Duration::seconds(5);

        let live = CancellationToken::new();
        let events = store.read_by_date_range_cancellable(from, to, &live).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_id, stream_id);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = store
            .read_by_date_range_cancellable(from, to, &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let metrics = Arc::new(StoreMetrics::new().unwrap());
        let store = store().with_metrics(metrics.clone());
        let stream_id = Uuid::new_v4();

        store
            .append(stream_id, "Invoice", "InvoiceSubmitted", &submitted(4), 0, None)
            .await
            .unwrap();
        let _ = store
            .append(stream_id, "Invoice", "InvoiceSubmitted", &submitted(4), 0, None)
            .await;

        let gathered = metrics.registry().gather();
        let appends = gathered.iter().find(|m| m.name() == "event_store_appends_total").unwrap();
        assert_eq!(appends.metric[0].counter.value, Some(1.0));
        let conflicts = gathered.iter().find(|m| m.name() == "event_store_conflicts_total").unwrap();
        assert_eq!(conflicts.metric[0].counter.value, Some(1.0));
    }
}
