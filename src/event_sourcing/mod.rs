// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Append-only event log with per-stream optimistic concurrency.
// Aggregates and their business rules live with the callers.
//
// ============================================================================

pub mod core;
pub mod store;

// Re-export core infrastructure
pub use self::core::*;
pub use self::store::*;
