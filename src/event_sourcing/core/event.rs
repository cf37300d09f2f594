use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::codec::{Codec, DecodeError, EncodedValue};

// ============================================================================
// Event Record - one committed fact about one aggregate instance
// ============================================================================
//
// Records are created exactly once by a successful append and never
// mutated afterwards. `version` and `created_at` are always assigned by
// the store; callers only ever supply the version they expect to follow.
//
// ============================================================================

/// A committed event as returned by the stream and audit readers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    // Identity
    pub id: Uuid,
    pub stream_id: Uuid,

    // Labels
    pub stream_type: String,
    pub event_type: String,

    // Opaque bodies
    pub payload: EncodedValue,
    pub metadata: Option<EncodedValue>,

    // Position
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Decode the payload into a concrete type
    pub fn decode_payload<T, C>(&self, codec: &C) -> Result<T, DecodeError>
    where
        T: for<'de> Deserialize<'de>,
        C: Codec,
    {
        codec.decode(&self.payload)
    }

    /// Decode the metadata, if any was recorded
    pub fn decode_metadata<T, C>(&self, codec: &C) -> Result<Option<T>, DecodeError>
    where
        T: for<'de> Deserialize<'de>,
        C: Codec,
    {
        self.metadata.as_ref().map(|m| codec.decode(m)).transpose()
    }
}

// ============================================================================
// New Event - candidate supplied to the append engine
// ============================================================================

/// An event that has not been committed yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    pub stream_type: String,
    pub event_type: String,
    pub payload: EncodedValue,
    pub metadata: Option<EncodedValue>,
}

impl NewEvent {
    pub fn new(
        stream_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: EncodedValue,
    ) -> Self {
        Self {
            stream_type: stream_type.into(),
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }

    /// Encode `payload` with `codec` and build the candidate
    pub fn encode<T: Serialize + ?Sized, C: Codec>(
        codec: &C,
        stream_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, DecodeError> {
        Ok(Self::new(stream_type, event_type, codec.encode(payload)?))
    }

    pub fn with_metadata(mut self, metadata: EncodedValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Encode and attach any serializable metadata value
    pub fn with_encoded_metadata<T: Serialize + ?Sized, C: Codec>(
        self,
        codec: &C,
        metadata: &T,
    ) -> Result<Self, DecodeError> {
        Ok(self.with_metadata(codec.encode(metadata)?))
    }
}

// ============================================================================
// Event Metadata - causation & correlation side-channel
// ============================================================================

/// Standard metadata shape recorded alongside domain events
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    // Causation & Correlation (for distributed tracing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    // Who triggered this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
