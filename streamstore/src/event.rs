//! Event records and their metadata map.
//!
//! Every stored event carries three reserved metadata keys naming its owning
//! aggregate. The `(type, id, version)` triple is unique within a stream and
//! is what turns a concurrent double-write into a
//! [`ConcurrencyConflict`](crate::EventStoreError::ConcurrencyConflict).

use crate::errors::EventStoreError;
use crate::types::SequenceNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved metadata key holding the owning aggregate's type.
pub const AGGREGATE_TYPE_KEY: &str = "_aggregate_type";
/// Reserved metadata key holding the owning aggregate's identifier.
pub const AGGREGATE_ID_KEY: &str = "_aggregate_id";
/// Reserved metadata key holding the owning aggregate's version.
pub const AGGREGATE_VERSION_KEY: &str = "_aggregate_version";
/// Reserved metadata key the reader fills with the owning stream name.
pub const STREAM_KEY: &str = "_stream";

/// Identity of the aggregate that owns an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateRef {
    /// Aggregate type, e.g. `"order"`.
    pub aggregate_type: String,
    /// Aggregate identifier within its type.
    pub aggregate_id: String,
    /// Version of the aggregate this event produced.
    pub version: u64,
}

/// Free-form metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(Map<String, Value>);

impl EventMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Decode metadata from a stored JSON value. The value must be an object.
    pub fn try_from_value(value: Value) -> Result<Self, EventStoreError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EventStoreError::InvalidMetadata {
                detail: format!("expected a JSON object, found {other}"),
            }),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.insert(key, value);
        self
    }

    /// Builder-style insert of the three reserved aggregate keys.
    pub fn with_aggregate(
        self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: u64,
    ) -> Self {
        self.with(AGGREGATE_TYPE_KEY, aggregate_type.into())
            .with(AGGREGATE_ID_KEY, aggregate_id.into())
            .with(AGGREGATE_VERSION_KEY, version)
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Owning stream name, present on events materialized by a cursor.
    pub fn stream(&self) -> Option<&str> {
        self.get(STREAM_KEY).and_then(Value::as_str)
    }

    /// Extract the owning aggregate from the reserved keys.
    ///
    /// Type and id must be non-empty strings and the version a non-negative
    /// integer.
    pub fn aggregate(&self) -> Result<AggregateRef, EventStoreError> {
        let aggregate_type = self.required_str(AGGREGATE_TYPE_KEY)?;
        let aggregate_id = self.required_str(AGGREGATE_ID_KEY)?;
        let version = self
            .get(AGGREGATE_VERSION_KEY)
            .ok_or_else(|| missing(AGGREGATE_VERSION_KEY))?
            .as_u64()
            .ok_or_else(|| EventStoreError::InvalidMetadata {
                detail: format!("{AGGREGATE_VERSION_KEY} must be a non-negative integer"),
            })?;

        Ok(AggregateRef {
            aggregate_type,
            aggregate_id,
            version,
        })
    }

    fn required_str(&self, key: &str) -> Result<String, EventStoreError> {
        match self.get(key) {
            Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
            Some(_) => Err(EventStoreError::InvalidMetadata {
                detail: format!("{key} must be a non-empty string"),
            }),
            None => Err(missing(key)),
        }
    }
}

fn missing(key: &str) -> EventStoreError {
    EventStoreError::InvalidMetadata {
        detail: format!("missing reserved key {key}"),
    }
}

impl From<Map<String, Value>> for EventMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<EventMetadata> for Value {
    fn from(metadata: EventMetadata) -> Self {
        Self::Object(metadata.0)
    }
}

/// An immutable domain event as written to or read from a stream log.
///
/// `P` is the payload type: whatever the caller serializes on the write path,
/// and whatever the type resolver produces on the read path.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<P> {
    event_id: Uuid,
    event_type: String,
    payload: P,
    metadata: EventMetadata,
    created_at: DateTime<Utc>,
    sequence: Option<SequenceNumber>,
}

impl<P> EventRecord<P> {
    /// A new event with a fresh identifier, the current time and empty
    /// metadata. The sequence number is assigned by storage.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::new(),
            created_at: Utc::now(),
            sequence: None,
        }
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the reserved aggregate keys.
    #[must_use]
    pub fn with_aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: u64,
    ) -> Self {
        self.metadata = self
            .metadata
            .with_aggregate(aggregate_type, aggregate_id, version);
        self
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.metadata.insert(key, value);
        self
    }

    /// Override the event identifier.
    #[must_use]
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Override the creation timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach the storage-assigned sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Globally unique event identifier.
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Stored type name, the key into the type resolver.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Take the payload.
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Borrow the metadata.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sequence number, `None` until the event has been stored.
    pub fn sequence(&self) -> Option<SequenceNumber> {
        self.sequence
    }

    /// Owning stream, present once a cursor has materialized the event.
    pub fn stream(&self) -> Option<&str> {
        self.metadata.stream()
    }

    /// Owning aggregate from the reserved metadata keys.
    pub fn aggregate(&self) -> Result<AggregateRef, EventStoreError> {
        self.metadata.aggregate()
    }
}
