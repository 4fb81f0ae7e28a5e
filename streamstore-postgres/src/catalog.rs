//! Stream catalog: the source of truth for which streams exist.
//!
//! Creating and deleting a stream touches both the catalog row and the
//! physical log table inside one transaction, so a stream is never observable
//! half created or half deleted.

use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Row, query};
use streamstore::{EventMetadata, EventStoreError, Operation, StreamName};
use tracing::{debug, info, instrument, warn};

use crate::schema::{create_stream_table_statements, drop_stream_table_statement, stream_table_name};
use crate::{PostgresEventStore, is_unique_violation, map_sqlx_error};

impl PostgresEventStore {
    /// Create an empty stream with empty catalog metadata.
    pub async fn create_stream(&self, stream: &StreamName) -> Result<(), EventStoreError> {
        self.create_stream_with_metadata(stream, &EventMetadata::new())
            .await
    }

    /// Create an empty stream and register it in the catalog.
    ///
    /// Fails with `StreamAlreadyExists` if the name is taken.
    #[instrument(name = "postgres.create_stream", skip(self, metadata), fields(stream = %stream))]
    pub async fn create_stream_with_metadata(
        &self,
        stream: &StreamName,
        metadata: &EventMetadata,
    ) -> Result<(), EventStoreError> {
        let operation = Operation::CreateStream;
        self.bounded(operation, async {
            let table = stream_table_name(stream);

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

            let inserted = query(
                "INSERT INTO event_streams (real_stream_name, stream_name, metadata)
                 VALUES ($1, $2, $3)",
            )
            .bind(stream.as_ref())
            .bind(&table)
            .bind(Json(metadata))
            .execute(&mut *tx)
            .await;

            if let Err(error) = inserted {
                if is_unique_violation(&error) {
                    warn!("[postgres.create_stream] stream already exists");
                    return Err(EventStoreError::StreamAlreadyExists {
                        stream: stream.clone(),
                    });
                }
                return Err(map_sqlx_error(error, operation));
            }

            for statement in create_stream_table_statements(&table) {
                let _ = query(&statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, operation))?;
            }

            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

            info!(table = %table, "[postgres.create_stream] stream created");
            Ok(())
        })
        .await
    }

    /// Remove a stream's catalog row and drop its log.
    ///
    /// Fails with `StreamNotFound` (and drops nothing) if the stream is not
    /// registered.
    #[instrument(name = "postgres.delete_stream", skip(self), fields(stream = %stream))]
    pub async fn delete_stream(&self, stream: &StreamName) -> Result<(), EventStoreError> {
        let operation = Operation::DeleteStream;
        self.bounded(operation, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

            let row = query(
                "DELETE FROM event_streams WHERE real_stream_name = $1 RETURNING stream_name",
            )
            .bind(stream.as_ref())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

            let Some(row) = row else {
                return Err(EventStoreError::StreamNotFound {
                    stream: stream.clone(),
                });
            };
            let table: String = row
                .try_get("stream_name")
                .map_err(|error| map_sqlx_error(error, operation))?;

            let _ = query(&drop_stream_table_statement(&table))
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;

            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

            info!(table = %table, "[postgres.delete_stream] stream deleted");
            Ok(())
        })
        .await
    }

    /// True if the catalog holds a row for `stream`.
    #[instrument(name = "postgres.has_stream", skip(self), fields(stream = %stream))]
    pub async fn has_stream(&self, stream: &StreamName) -> Result<bool, EventStoreError> {
        let operation = Operation::HasStream;
        self.bounded(operation, async {
            let table = resolve_stream_table(&self.pool, stream, operation).await?;
            Ok(table.is_some())
        })
        .await
    }

    /// Names of all registered streams in creation order, excluding internal
    /// (`$`-prefixed) streams.
    #[instrument(name = "postgres.list_stream_names", skip(self))]
    pub async fn list_stream_names(&self) -> Result<Vec<StreamName>, EventStoreError> {
        let operation = Operation::ListStreams;
        self.bounded(operation, async {
            let rows = query(
                "SELECT real_stream_name FROM event_streams
                 WHERE real_stream_name NOT LIKE '$%'
                 ORDER BY no ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

            let mut names = Vec::with_capacity(rows.len());
            for row in rows {
                let name: String = row
                    .try_get("real_stream_name")
                    .map_err(|error| map_sqlx_error(error, operation))?;
                names.push(StreamName::try_new(name)?);
            }

            debug!(count = names.len(), "[postgres.list_stream_names] listed streams");
            Ok(names)
        })
        .await
    }

    /// Catalog metadata stored for `stream`.
    #[instrument(name = "postgres.fetch_stream_metadata", skip(self), fields(stream = %stream))]
    pub async fn fetch_stream_metadata(
        &self,
        stream: &StreamName,
    ) -> Result<EventMetadata, EventStoreError> {
        let operation = Operation::FetchStreamMetadata;
        self.bounded(operation, async {
            let row = query("SELECT metadata FROM event_streams WHERE real_stream_name = $1")
                .bind(stream.as_ref())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?
                .ok_or_else(|| EventStoreError::StreamNotFound {
                    stream: stream.clone(),
                })?;

            let metadata: Json<Value> = row
                .try_get("metadata")
                .map_err(|error| map_sqlx_error(error, operation))?;
            EventMetadata::try_from_value(metadata.0).map_err(|error| {
                EventStoreError::DeserializationFailed {
                    source_name: stream.to_string(),
                    detail: error.to_string(),
                }
            })
        })
        .await
    }

    /// Replace the catalog metadata stored for `stream`.
    #[instrument(
        name = "postgres.update_stream_metadata",
        skip(self, metadata),
        fields(stream = %stream)
    )]
    pub async fn update_stream_metadata(
        &self,
        stream: &StreamName,
        metadata: &EventMetadata,
    ) -> Result<(), EventStoreError> {
        let operation = Operation::UpdateStreamMetadata;
        self.bounded(operation, async {
            let result =
                query("UPDATE event_streams SET metadata = $2 WHERE real_stream_name = $1")
                    .bind(stream.as_ref())
                    .bind(Json(metadata))
                    .execute(&self.pool)
                    .await
                    .map_err(|error| map_sqlx_error(error, operation))?;

            if result.rows_affected() == 0 {
                return Err(EventStoreError::StreamNotFound {
                    stream: stream.clone(),
                });
            }
            Ok(())
        })
        .await
    }
}

/// Physical table registered for `stream`, if any.
pub(crate) async fn resolve_stream_table<'e, E>(
    executor: E,
    stream: &StreamName,
    operation: Operation,
) -> Result<Option<String>, EventStoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let row = query("SELECT stream_name FROM event_streams WHERE real_stream_name = $1")
        .bind(stream.as_ref())
        .fetch_optional(executor)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;

    row.map(|row| row.try_get::<String, _>("stream_name"))
        .transpose()
        .map_err(|error| map_sqlx_error(error, operation))
}

/// Like [`resolve_stream_table`], failing with `StreamNotFound` when absent.
pub(crate) async fn require_stream_table<'e, E>(
    executor: E,
    stream: &StreamName,
    operation: Operation,
) -> Result<String, EventStoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    resolve_stream_table(executor, stream, operation)
        .await?
        .ok_or_else(|| EventStoreError::StreamNotFound {
            stream: stream.clone(),
        })
}
