// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// `EventStore` is the public face: append engine, stream reader and audit
// range reader. Durable storage sits behind the `EventBackend` trait, with
// a Postgres implementation and an in-process one.
//
// ============================================================================

pub mod backend;
pub mod event_store;
pub mod memory;
pub mod postgres;

pub use backend::{AuditCursor, Clock, EventBackend, ManualClock, SystemClock};
pub use event_store::EventStore;
pub use memory::InMemoryEventBackend;
pub use postgres::PgEventBackend;
