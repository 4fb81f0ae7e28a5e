//! Transactional append with optimistic concurrency.
//!
//! A batch is validated up front, then inserted row by row inside one
//! transaction. The unique `(aggregate_type, aggregate_id, aggregate_version)`
//! constraint on the stream log decides races between writers; the loser's
//! whole batch is rolled back and reported as `ConcurrencyConflict`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Row, query};
use streamstore::{
    AggregateRef, EventRecord, EventStoreError, Operation, SequenceNumber, StreamName,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::catalog::require_stream_table;
use crate::schema::{AGGREGATE_CONSTRAINT_SUFFIX, EVENT_ID_CONSTRAINT_SUFFIX};
use crate::{
    PostgresEventStore, is_undefined_table, is_unique_violation, map_sqlx_error,
    violated_constraint,
};

/// Longest event type name the log accepts.
const MAX_EVENT_TYPE_LEN: usize = 100;

/// An event checked and encoded for insertion.
struct PreparedEvent {
    event_id: Uuid,
    event_type: String,
    payload: Value,
    metadata: Value,
    created_at: DateTime<Utc>,
    aggregate: AggregateRef,
    version: i64,
}

impl PostgresEventStore {
    /// Append `events` to `stream` in order, as one atomic batch.
    ///
    /// Returns the sequence numbers assigned to the events, in input order.
    /// Fails with `StreamNotFound` before anything is written if the stream
    /// is not registered, and with `ConcurrencyConflict` if any event reuses
    /// an aggregate version already in the log. In every failure case no
    /// event of the batch is stored.
    #[instrument(
        name = "postgres.append_to",
        skip(self, events),
        fields(stream = %stream, event_count = events.len())
    )]
    pub async fn append_to<P>(
        &self,
        stream: &StreamName,
        events: &[EventRecord<P>],
    ) -> Result<Vec<SequenceNumber>, EventStoreError>
    where
        P: Serialize + Sync,
    {
        let operation = Operation::AppendEvents;
        self.bounded(operation, async {
            let table = require_stream_table(&self.pool, stream, operation).await?;

            if events.is_empty() {
                return Ok(Vec::new());
            }

            let prepared = events
                .iter()
                .map(prepare)
                .collect::<Result<Vec<_>, _>>()?;

            let sql = format!(
                r#"INSERT INTO "{table}"
                   (event_id, event_name, payload, metadata, created_at,
                    aggregate_type, aggregate_id, aggregate_version)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                   RETURNING no"#
            );

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

            let mut sequences = Vec::with_capacity(prepared.len());
            for event in &prepared {
                let row = query(&sql)
                    .bind(event.event_id)
                    .bind(&event.event_type)
                    .bind(Json(&event.payload))
                    .bind(Json(&event.metadata))
                    .bind(event.created_at)
                    .bind(&event.aggregate.aggregate_type)
                    .bind(&event.aggregate.aggregate_id)
                    .bind(event.version)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|error| map_append_error(error, stream, event))?;

                let no: i64 = row
                    .try_get("no")
                    .map_err(|error| map_sqlx_error(error, operation))?;
                let no = u64::try_from(no).map_err(|_| EventStoreError::DeserializationFailed {
                    source_name: stream.to_string(),
                    detail: format!("negative sequence number {no}"),
                })?;
                sequences.push(SequenceNumber::new(no));
            }

            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

            info!(
                first = ?sequences.first().copied(),
                last = ?sequences.last().copied(),
                "[postgres.append_to] events appended"
            );
            Ok(sequences)
        })
        .await
    }
}

fn prepare<P: Serialize>(event: &EventRecord<P>) -> Result<PreparedEvent, EventStoreError> {
    let event_type = event.event_type();
    if event_type.is_empty() || event_type.chars().count() > MAX_EVENT_TYPE_LEN {
        return Err(EventStoreError::InvalidEvent {
            event_id: event.event_id(),
            detail: format!("event type must be 1 to {MAX_EVENT_TYPE_LEN} characters"),
        });
    }

    let aggregate = event.aggregate()?;
    let version =
        i64::try_from(aggregate.version).map_err(|_| EventStoreError::InvalidMetadata {
            detail: format!(
                "aggregate version {} exceeds the storable range",
                aggregate.version
            ),
        })?;
    let payload = serde_json::to_value(event.payload()).map_err(|error| {
        EventStoreError::SerializationFailed {
            detail: error.to_string(),
        }
    })?;

    Ok(PreparedEvent {
        event_id: event.event_id(),
        event_type: event_type.to_string(),
        payload,
        metadata: Value::from(event.metadata().clone()),
        created_at: event.created_at(),
        aggregate,
        version,
    })
}

fn map_append_error(
    error: sqlx::Error,
    stream: &StreamName,
    event: &PreparedEvent,
) -> EventStoreError {
    if is_unique_violation(&error) {
        let constraint = violated_constraint(&error).unwrap_or_default();
        if constraint.ends_with(EVENT_ID_CONSTRAINT_SUFFIX) {
            warn!(
                event_id = %event.event_id,
                "[postgres.append_to] duplicate event id"
            );
            return EventStoreError::DuplicateEventId {
                stream: stream.clone(),
                event_id: event.event_id,
            };
        }
        if constraint.ends_with(AGGREGATE_CONSTRAINT_SUFFIX) {
            warn!(
                aggregate_type = %event.aggregate.aggregate_type,
                aggregate_id = %event.aggregate.aggregate_id,
                version = event.aggregate.version,
                "[postgres.version_conflict] optimistic concurrency check failed"
            );
            return EventStoreError::ConcurrencyConflict {
                aggregate_type: event.aggregate.aggregate_type.clone(),
                aggregate_id: event.aggregate.aggregate_id.clone(),
                version: event.aggregate.version,
            };
        }
    }

    if is_undefined_table(&error) {
        return EventStoreError::StreamNotFound {
            stream: stream.clone(),
        };
    }

    map_sqlx_error(error, Operation::AppendEvents)
}
