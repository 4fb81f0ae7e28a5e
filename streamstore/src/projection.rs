//! Projection checkpoint vocabulary.
//!
//! A projection's checkpoint is the `(position, state, status)` triple kept
//! in the projection registry. The position records, per consumed stream, the
//! last sequence number the projection has applied; it only ever moves
//! forward.

use crate::errors::EventStoreError;
use crate::types::{SequenceNumber, StreamName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Lifecycle status of a projection runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    /// Not processing. New and freshly persisted projections are idle.
    #[default]
    Idle,
    /// A runner is applying events.
    Running,
    /// A runner was asked to stop after its current batch.
    Stopping,
    /// The checkpoint is being cleared.
    Resetting,
    /// The projection is being removed.
    Deleting,
    /// The projection and everything it emitted are being removed.
    DeletingInclEmittedEvents,
}

impl ProjectionStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Idle,
        Self::Running,
        Self::Stopping,
        Self::Resetting,
        Self::Deleting,
        Self::DeletingInclEmittedEvents,
    ];

    /// The stored text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Resetting => "resetting",
            Self::Deleting => "deleting",
            Self::DeletingInclEmittedEvents => "deleting_incl_emitted_events",
        }
    }
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionStatus {
    type Err = EventStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| EventStoreError::UnknownProjectionStatus {
                status: value.to_string(),
            })
    }
}

/// Per-stream progress of a projection.
///
/// Serialized as a flat JSON object `{"stream": sequence, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectionPosition(BTreeMap<StreamName, SequenceNumber>);

/// First stream whose position would move backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRegression {
    /// The stream in question.
    pub stream: StreamName,
    /// Sequence currently on record.
    pub recorded: SequenceNumber,
    /// Lower sequence the write attempted.
    pub attempted: SequenceNumber,
}

impl ProjectionPosition {
    /// An empty position.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style set of one stream's sequence.
    #[must_use]
    pub fn with(mut self, stream: StreamName, sequence: SequenceNumber) -> Self {
        let _ = self.0.insert(stream, sequence);
        self
    }

    /// Set one stream's sequence, returning the previous value.
    pub fn set(&mut self, stream: StreamName, sequence: SequenceNumber) -> Option<SequenceNumber> {
        self.0.insert(stream, sequence)
    }

    /// Recorded sequence for `stream`.
    pub fn get(&self, stream: &StreamName) -> Option<SequenceNumber> {
        self.0.get(stream).copied()
    }

    /// True when no stream has been consumed yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of streams tracked.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Entries in stream-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamName, SequenceNumber)> {
        self.0.iter().map(|(stream, sequence)| (stream, *sequence))
    }

    /// Check that writing `self` over `recorded` moves no stream backwards.
    pub fn check_advances_from(&self, recorded: &Self) -> Result<(), PositionRegression> {
        for (stream, attempted) in self.iter() {
            if let Some(previous) = recorded.get(stream) {
                if attempted < previous {
                    return Err(PositionRegression {
                        stream: stream.clone(),
                        recorded: previous,
                        attempted,
                    });
                }
            }
        }
        Ok(())
    }

    /// `recorded` updated with every entry of `self`. Streams only present
    /// in `recorded` keep their value.
    pub fn merged_over(&self, recorded: &Self) -> Self {
        let mut merged = recorded.clone();
        for (stream, sequence) in self.iter() {
            let _ = merged.set(stream.clone(), sequence);
        }
        merged
    }
}

impl FromIterator<(StreamName, SequenceNumber)> for ProjectionPosition {
    fn from_iter<I: IntoIterator<Item = (StreamName, SequenceNumber)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream(name: &str) -> StreamName {
        StreamName::try_new(name).expect("valid stream name")
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in ProjectionStatus::ALL {
            assert_eq!(status.as_str().parse::<ProjectionStatus>(), Ok(status));
        }
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert_eq!(
            "paused".parse::<ProjectionStatus>(),
            Err(EventStoreError::UnknownProjectionStatus {
                status: "paused".to_string()
            })
        );
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&ProjectionStatus::DeletingInclEmittedEvents)
            .expect("serializable");
        assert_eq!(json, "\"deleting_incl_emitted_events\"");
    }

    #[test]
    fn position_serializes_as_flat_object() {
        let position = ProjectionPosition::new().with(stream("s"), SequenceNumber::new(5));

        let json = serde_json::to_value(&position).expect("serializable");

        assert_eq!(json, serde_json::json!({"s": 5}));
    }

    #[test]
    fn lower_sequence_is_a_regression() {
        let recorded = ProjectionPosition::new().with(stream("orders"), SequenceNumber::new(7));
        let attempted = ProjectionPosition::new().with(stream("orders"), SequenceNumber::new(3));

        let regression = attempted
            .check_advances_from(&recorded)
            .expect_err("position moves backwards");

        assert_eq!(regression.stream, stream("orders"));
        assert_eq!(regression.recorded, SequenceNumber::new(7));
        assert_eq!(regression.attempted, SequenceNumber::new(3));
    }

    #[test]
    fn merge_keeps_streams_missing_from_the_update() {
        let recorded = ProjectionPosition::new()
            .with(stream("a"), SequenceNumber::new(4))
            .with(stream("b"), SequenceNumber::new(9));
        let update = ProjectionPosition::new().with(stream("a"), SequenceNumber::new(6));

        let merged = update.merged_over(&recorded);

        assert_eq!(merged.get(&stream("a")), Some(SequenceNumber::new(6)));
        assert_eq!(merged.get(&stream("b")), Some(SequenceNumber::new(9)));
    }

    proptest! {
        #[test]
        fn merged_position_never_regresses(
            recorded in prop::collection::btree_map("[a-c]", 1u64..100, 0..3),
            bumps in prop::collection::btree_map("[a-c]", 0u64..100, 0..3),
        ) {
            let recorded: ProjectionPosition = recorded
                .iter()
                .map(|(name, seq)| (stream(name), SequenceNumber::new(*seq)))
                .collect();
            let update: ProjectionPosition = bumps
                .iter()
                .map(|(name, bump)| {
                    let base = recorded.get(&stream(name)).map_or(0, u64::from);
                    (stream(name), SequenceNumber::new(base + bump))
                })
                .collect();

            prop_assert!(update.check_advances_from(&recorded).is_ok());
            let merged = update.merged_over(&recorded);
            prop_assert!(merged.check_advances_from(&recorded).is_ok());
            prop_assert!(merged.len() >= recorded.len());
        }
    }
}
