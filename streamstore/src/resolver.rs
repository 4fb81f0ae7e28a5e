//! Event type resolution: mapping stored type names to payload decoders.
//!
//! The storage layer never knows concrete payload types. Readers hand it an
//! [`EventTypeResolver`], which turns a stored `(event type, JSON payload)`
//! pair into the caller's payload type. [`TypeRegistry`] is the stock
//! implementation: an explicit table of decode functions keyed by name.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Failure to turn a stored payload into a typed value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// No decoder is registered under the stored type name.
    #[error("unknown event type: {event_type}")]
    UnknownEventType {
        /// The stored type name.
        event_type: String,
    },

    /// A decoder exists but rejected the payload.
    #[error("failed to decode event of type '{event_type}': {detail}")]
    Malformed {
        /// The stored type name.
        event_type: String,
        /// Decoder message.
        detail: String,
    },
}

/// Capability the cursor depends on to materialize payloads.
///
/// Unknown type names must be reported, never skipped.
pub trait EventTypeResolver: Send + Sync {
    /// The decoded payload type.
    type Payload;

    /// Decode a stored payload.
    fn decode(&self, event_type: &str, payload: Value) -> Result<Self::Payload, DecodeError>;
}

type DecodeFn<P> = Arc<dyn Fn(Value) -> Result<P, serde_json::Error> + Send + Sync>;

/// Table of decode functions keyed by event type name.
///
/// # Examples
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct OrderPlaced { total: u64 }
///
/// enum OrderEvent { Placed(OrderPlaced) }
/// impl From<OrderPlaced> for OrderEvent { /* ... */ }
///
/// let registry = TypeRegistry::<OrderEvent>::new().register::<OrderPlaced>("OrderPlaced");
/// ```
pub struct TypeRegistry<P> {
    decoders: HashMap<String, DecodeFn<P>>,
}

impl<P: 'static> TypeRegistry<P> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `T` under `event_type`; decoded values are converted into `P`.
    ///
    /// Registering a name twice replaces the earlier decoder.
    #[must_use]
    pub fn register<T>(self, event_type: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Into<P> + 'static,
    {
        self.register_with(event_type, |payload| {
            serde_json::from_value::<T>(payload).map(Into::into)
        })
    }

    /// Register a custom decode function under `event_type`.
    #[must_use]
    pub fn register_with<F>(mut self, event_type: impl Into<String>, decode: F) -> Self
    where
        F: Fn(Value) -> Result<P, serde_json::Error> + Send + Sync + 'static,
    {
        let _ = self.decoders.insert(event_type.into(), Arc::new(decode));
        self
    }

    /// True if a decoder exists for `event_type`.
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered type names, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.decoders.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<P: 'static> Default for TypeRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for TypeRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<P> std::fmt::Debug for TypeRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("event_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<P> EventTypeResolver for TypeRegistry<P> {
    type Payload = P;

    fn decode(&self, event_type: &str, payload: Value) -> Result<P, DecodeError> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType {
                event_type: event_type.to_string(),
            })?;

        decode(payload).map_err(|error| DecodeError::Malformed {
            event_type: event_type.to_string(),
            detail: error.to_string(),
        })
    }
}
