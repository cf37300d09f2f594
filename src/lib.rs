//! Append-only event log with per-stream optimistic concurrency control.
//!
//! Aggregates record each state transition with [`EventStore::append`],
//! passing the version they believe is current. Exactly one of several
//! racing writers wins a given version; the rest get
//! [`EventStoreError::ConcurrencyConflict`] with the actual version.
//! Streams are read back with [`EventStore::read_stream`], and the audit
//! trail across all streams with [`EventStore::read_by_date_range`].

pub mod config;
pub mod db;
pub mod event_sourcing;
pub mod metrics;
pub mod utils;

pub use config::{ConfigError, StoreConfig};
pub use event_sourcing::core::{
    Codec, DecodeError, EncodedValue, EventMetadata, EventRecord, EventStoreError, JsonCodec,
    NewEvent, PersistenceError,
};
pub use event_sourcing::store::{
    AuditCursor, Clock, EventBackend, EventStore, InMemoryEventBackend, ManualClock,
    PgEventBackend, SystemClock,
};
pub use metrics::StoreMetrics;
