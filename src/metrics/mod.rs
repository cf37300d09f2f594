use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides metrics for:
// - Appends and the events they committed, per stream type
// - Concurrency conflicts, per stream type
// - Infrastructure failures, per operation
// - Operation latency and read volume
//
// The registry is owned here; embedding services gather it into whatever
// endpoint they already expose.
// ============================================================================

pub struct StoreMetrics {
    registry: Registry,

    // Write path
    pub appends_total: IntCounterVec,
    pub events_appended_total: IntCounterVec,
    pub conflicts_total: IntCounterVec,

    // Read path
    pub events_read_total: IntCounterVec,

    // Shared
    pub errors_total: IntCounterVec,
    pub operation_duration: HistogramVec,
}

impl StoreMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register the store metrics into an existing registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let appends_total = IntCounterVec::new(
            Opts::new("event_store_appends_total", "Total successful append calls"),
            &["stream_type"],
        )?;
        registry.register(Box::new(appends_total.clone()))?;

        let events_appended_total = IntCounterVec::new(
            Opts::new("event_store_events_appended_total", "Total events committed"),
            &["stream_type"],
        )?;
        registry.register(Box::new(events_appended_total.clone()))?;

        let conflicts_total = IntCounterVec::new(
            Opts::new(
                "event_store_conflicts_total",
                "Appends rejected because the expected version was stale",
            ),
            &["stream_type"],
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let events_read_total = IntCounterVec::new(
            Opts::new("event_store_events_read_total", "Total events returned by reads"),
            &["operation"],
        )?;
        registry.register(Box::new(events_read_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("event_store_errors_total", "Operations that failed for non-conflict reasons"),
            &["operation"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "event_store_operation_duration_seconds",
                "Event store operation duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            registry,
            appends_total,
            events_appended_total,
            conflicts_total,
            events_read_total,
            errors_total,
            operation_duration,
        })
    }

    /// Get the Prometheus registry for exposing metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, stream_type: &str, event_count: usize) {
        self.appends_total.with_label_values(&[stream_type]).inc();
        self.events_appended_total
            .with_label_values(&[stream_type])
            .inc_by(event_count as u64);
    }

    pub fn record_conflict(&self, stream_type: &str) {
        self.conflicts_total.with_label_values(&[stream_type]).inc();
    }

    pub fn record_read(&self, operation: &str, event_count: usize) {
        self.events_read_total
            .with_label_values(&[operation])
            .inc_by(event_count as u64);
    }

    pub fn record_error(&self, operation: &str) {
        self.errors_total.with_label_values(&[operation]).inc();
    }

    pub fn observe_duration(&self, operation: &str, duration_secs: f64) {
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}
