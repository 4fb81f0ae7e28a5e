//! Single-stream and merged reads, served through lazy cursors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, postgres::PgRow, query};
use streamstore::{
    EventCursor, EventStoreError, EventTypeResolver, MetadataMatcher, Operation, PageSource,
    RawEventRow, SequenceNumber, StreamName,
};
use tracing::{debug, info, instrument};

use crate::catalog::require_stream_table;
use crate::query_builder::{BuiltQuery, QueryTarget, render_merge_query, render_stream_query};
use crate::{PostgresEventStore, map_sqlx_error, with_deadline};

/// One stream's contribution to a read: where to start and what to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLoad {
    /// Stream to read.
    pub stream: StreamName,
    /// First sequence number to include.
    pub from: SequenceNumber,
    /// Filter applied to the stream's events.
    pub matcher: MetadataMatcher,
}

impl StreamLoad {
    /// Read all of `stream` from its first event.
    pub fn new(stream: StreamName) -> Self {
        Self {
            stream,
            from: SequenceNumber::first(),
            matcher: MetadataMatcher::new(),
        }
    }

    /// Start at `from`.
    #[must_use]
    pub fn from_sequence(mut self, from: SequenceNumber) -> Self {
        self.from = from;
        self
    }

    /// Keep only events accepted by `matcher`.
    #[must_use]
    pub fn matching(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = matcher;
        self
    }
}

/// Page source executing one built query against the pool.
#[derive(Debug, Clone)]
pub struct PgPageSource {
    pool: Pool<Postgres>,
    query: BuiltQuery,
    timeout: Duration,
}

impl PgPageSource {
    /// Source for `query`; each page fetch is bounded by `timeout`.
    pub fn new(pool: Pool<Postgres>, query: BuiltQuery, timeout: Duration) -> Self {
        Self {
            pool,
            query,
            timeout,
        }
    }

    /// The query this source pages over.
    pub fn query(&self) -> &BuiltQuery {
        &self.query
    }
}

#[async_trait]
impl PageSource for PgPageSource {
    async fn fetch_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawEventRow>, EventStoreError> {
        let operation = Operation::ReadPage;
        with_deadline(self.timeout, operation, async {
            let sql = self.query.paged_sql(limit, offset);
            let rows = self
                .query
                .bind_all(query(&sql))
                .fetch_all(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;

            rows.into_iter()
                .map(|row| raw_row(&row).map_err(|error| map_sqlx_error(error, operation)))
                .collect()
        })
        .await
    }
}

fn raw_row(row: &PgRow) -> Result<RawEventRow, sqlx::Error> {
    let payload: Json<Value> = row.try_get("payload")?;
    let metadata: Json<Value> = row.try_get("metadata")?;
    Ok(RawEventRow {
        sequence: row.try_get("no")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_name")?,
        payload: payload.0,
        metadata: metadata.0,
        created_at: row.try_get("created_at")?,
        stream: row.try_get("stream")?,
    })
}

impl PostgresEventStore {
    /// Build the read query for one stream.
    ///
    /// Fails with `StreamNotFound` if the stream is not registered and with
    /// `InvalidMatcher` if a match cannot be rendered.
    #[instrument(name = "postgres.build_query", skip(self, matcher), fields(stream = %stream))]
    pub async fn build_query(
        &self,
        stream: &StreamName,
        from: SequenceNumber,
        matcher: &MetadataMatcher,
    ) -> Result<BuiltQuery, EventStoreError> {
        let operation = Operation::BuildQuery;
        self.bounded(operation, async {
            let table = require_stream_table(&self.pool, stream, operation).await?;
            render_stream_query(QueryTarget {
                stream,
                table: &table,
                from,
                matcher,
            })
        })
        .await
    }

    /// Lazily read one stream in sequence order.
    ///
    /// `limit` caps the total number of events; 0 means unbounded. Stream
    /// existence and matcher validity are checked here, rows are fetched as
    /// the cursor advances.
    #[instrument(name = "postgres.load", skip(self, matcher, resolver), fields(stream = %stream))]
    pub async fn load<R>(
        &self,
        stream: &StreamName,
        from: SequenceNumber,
        limit: usize,
        matcher: &MetadataMatcher,
        resolver: Arc<R>,
    ) -> Result<EventCursor<R::Payload>, EventStoreError>
    where
        R: EventTypeResolver + 'static,
    {
        let query = self.build_query(stream, from, matcher).await?;
        debug!(limit, "[postgres.load] cursor opened");
        Ok(self.cursor(query, limit, resolver))
    }

    /// Lazily read several streams as one sequence ordered by creation time.
    ///
    /// Paging and `limit` apply to the union as a whole. The read is not a
    /// snapshot: events appended to any involved stream while the cursor is
    /// open may or may not appear.
    #[instrument(
        name = "postgres.merge_and_load",
        skip(self, specs, resolver),
        fields(streams = specs.len())
    )]
    pub async fn merge_and_load<R>(
        &self,
        limit: usize,
        specs: &[StreamLoad],
        resolver: Arc<R>,
    ) -> Result<EventCursor<R::Payload>, EventStoreError>
    where
        R: EventTypeResolver + 'static,
    {
        if specs.is_empty() {
            return Err(EventStoreError::EmptyMerge);
        }

        let operation = Operation::BuildQuery;
        let query = self
            .bounded(operation, async {
                let mut tables = Vec::with_capacity(specs.len());
                for spec in specs {
                    tables.push(require_stream_table(&self.pool, &spec.stream, operation).await?);
                }

                let targets: Vec<QueryTarget<'_>> = specs
                    .iter()
                    .zip(&tables)
                    .map(|(spec, table)| QueryTarget {
                        stream: &spec.stream,
                        table,
                        from: spec.from,
                        matcher: &spec.matcher,
                    })
                    .collect();
                render_merge_query(&targets)
            })
            .await?;

        info!(limit, "[postgres.merge_and_load] merged cursor opened");
        Ok(self.cursor(query, limit, resolver))
    }

    fn cursor<R>(
        &self,
        query: BuiltQuery,
        limit: usize,
        resolver: Arc<R>,
    ) -> EventCursor<R::Payload>
    where
        R: EventTypeResolver + 'static,
    {
        let source = PgPageSource::new(self.pool.clone(), query, self.config.operation_timeout);
        EventCursor::new(Box::new(source), resolver, limit, self.config.page_size)
    }
}
