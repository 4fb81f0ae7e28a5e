//! Domain newtypes shared by every backend.

use crate::validation::no_control_characters;
use nutype::nutype;

/// Logical stream name as registered in the stream catalog.
///
/// Names starting with `$` are reserved for internal streams and are hidden
/// from stream listings.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 150, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamName(String);

impl StreamName {
    /// Returns true for internal (`$`-prefixed) stream names.
    pub fn is_internal(&self) -> bool {
        self.as_ref().starts_with('$')
    }
}

/// Unique projection name in the projection registry.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 150, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProjectionName(String);

/// Storage-assigned position of an event inside one stream's log.
///
/// Sequence numbers start at 1 and are only comparable within a stream.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
    Into
))]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The first sequence number a stream log assigns.
    pub fn first() -> Self {
        Self::new(1)
    }

    /// Value as a signed integer for the backend, saturating at `i64::MAX`.
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.into_inner()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_is_trimmed() {
        let name = StreamName::try_new("  orders  ").expect("valid stream name");
        assert_eq!(name.as_ref(), "orders");
    }

    #[test]
    fn stream_name_rejects_empty_and_oversized_values() {
        assert!(StreamName::try_new("   ").is_err());
        assert!(StreamName::try_new("x".repeat(151)).is_err());
        assert!(StreamName::try_new("x".repeat(150)).is_ok());
    }

    #[test]
    fn dollar_prefixed_streams_are_internal() {
        let internal = StreamName::try_new("$projections").expect("valid stream name");
        let public = StreamName::try_new("orders").expect("valid stream name");

        assert!(internal.is_internal());
        assert!(!public.is_internal());
    }

    #[test]
    fn sequence_number_saturates_when_converted_to_i64() {
        assert_eq!(SequenceNumber::new(7).as_i64(), 7);
        assert_eq!(SequenceNumber::new(u64::MAX).as_i64(), i64::MAX);
    }

    #[test]
    fn sequence_numbers_serialize_as_plain_integers() {
        let json = serde_json::to_string(&SequenceNumber::new(5)).expect("serializable");
        assert_eq!(json, "5");
    }
}
