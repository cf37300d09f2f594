// ============================================================================
// Event Sourcing Core - Records, Codec, Errors
// ============================================================================
//
// Nothing in here knows about a particular aggregate kind. Payloads are
// opaque `EncodedValue`s produced by a pluggable `Codec`.
//
// ============================================================================

pub mod codec;
pub mod error;
pub mod event;

// Re-export core types for convenience
pub use codec::{Codec, DecodeError, EncodedValue, JsonCodec};
pub use error::{EventStoreError, PersistenceError, Result};
pub use event::{EventMetadata, EventRecord, NewEvent};
