//! Lazy, paginated, forward-only reader over one logical query.
//!
//! A cursor pulls rows from a [`PageSource`] one bounded page at a time,
//! materializes them into [`EventRecord`]s through an [`EventTypeResolver`],
//! and hands them out one position at a time.
//!
//! Paging rules:
//! - every fetch asks for `min(page_size, remaining)` rows at the running
//!   offset;
//! - a page shorter than requested marks the cursor done, so no further
//!   fetch is attempted;
//! - a page exactly as long as requested leaves the cursor open, so the next
//!   exhaustion triggers one more fetch (which may come back empty).
//!
//! Only the current page is buffered. Once a fetch or decode fails the error
//! is latched and returned by every later call without touching the source
//! again.

use crate::errors::EventStoreError;
use crate::event::{EventMetadata, EventRecord, STREAM_KEY};
use crate::resolver::{DecodeError, EventTypeResolver};
use crate::types::SequenceNumber;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use nutype::nutype;
use serde_json::Value;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Rows per fetch when nothing else is configured.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Number of rows a cursor requests per fetch. Always at least 1.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct PageSize(NonZeroUsize);

impl Default for PageSize {
    fn default() -> Self {
        const DEFAULT: NonZeroUsize = match NonZeroUsize::new(DEFAULT_PAGE_SIZE) {
            Some(v) => v,
            None => unreachable!(),
        };
        Self::new(DEFAULT)
    }
}

impl PageSize {
    /// Page size as a plain count.
    pub fn get(self) -> usize {
        self.into_inner().get()
    }
}

/// One undecoded row as returned by a backend query.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEventRow {
    /// Per-stream sequence number.
    pub sequence: i64,
    /// Event identifier.
    pub event_id: Uuid,
    /// Stored type name.
    pub event_type: String,
    /// Stored payload.
    pub payload: Value,
    /// Stored metadata object.
    pub metadata: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Originating stream name, projected as a constant by the query.
    pub stream: String,
}

/// Executes one fixed query with a row limit and offset.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch at most `limit` rows starting at row `offset`.
    async fn fetch_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawEventRow>, EventStoreError>;
}

/// Stateful, single-pass reader over a query's result set.
pub struct EventCursor<P> {
    source: Box<dyn PageSource>,
    resolver: Arc<dyn EventTypeResolver<Payload = P>>,
    page_size: usize,
    limit: Option<usize>,
    remaining: Option<usize>,
    offset: usize,
    page: VecDeque<EventRecord<P>>,
    current: Option<EventRecord<P>>,
    started: bool,
    done: bool,
    exhausted: bool,
    error: Option<EventStoreError>,
    fetches: usize,
}

impl<P> EventCursor<P> {
    /// Create a cursor. A `limit` of 0 means unbounded.
    pub fn new(
        source: Box<dyn PageSource>,
        resolver: Arc<dyn EventTypeResolver<Payload = P>>,
        limit: usize,
        page_size: PageSize,
    ) -> Self {
        let limit = (limit > 0).then_some(limit);
        Self {
            source,
            resolver,
            page_size: page_size.get(),
            limit,
            remaining: limit,
            offset: 0,
            page: VecDeque::new(),
            current: None,
            started: false,
            done: false,
            exhausted: false,
            error: None,
            fetches: 0,
        }
    }

    /// Move to the next event.
    ///
    /// Returns `Ok(false)` once no further event is available; buffered
    /// state is released at that point.
    pub async fn advance(&mut self) -> Result<bool, EventStoreError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if self.exhausted {
            return Ok(false);
        }
        self.started = true;

        if self.page.is_empty() && !self.done {
            if let Err(error) = self.fetch_next_page().await {
                self.release();
                self.error = Some(error.clone());
                return Err(error);
            }
        }

        match self.page.pop_front() {
            Some(event) => {
                self.current = Some(event);
                Ok(true)
            }
            None => {
                self.release();
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    /// The event at the current position.
    ///
    /// Performs the first `advance` implicitly when called on a fresh cursor.
    /// Returns `Ok(None)` once the cursor is exhausted.
    pub async fn current(&mut self) -> Result<Option<&EventRecord<P>>, EventStoreError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.started {
            let _ = self.advance().await?;
        }
        Ok(self.current.as_ref())
    }

    /// Reset to "before first". The next `advance` re-runs the query from
    /// the first row; a latched error is cleared.
    pub fn rewind(&mut self) {
        self.release();
        self.remaining = self.limit;
        self.offset = 0;
        self.started = false;
        self.done = false;
        self.exhausted = false;
        self.error = None;
    }

    /// True if advancing from the start yields no event.
    ///
    /// On a fresh cursor this performs the first `advance`, so the first
    /// event becomes current.
    pub async fn is_empty(&mut self) -> Result<bool, EventStoreError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.started {
            let _ = self.advance().await?;
        }
        Ok(self.current.is_none())
    }

    /// Exhaust the cursor into a list, starting with the current event if
    /// one is positioned.
    pub async fn drain_to_list(mut self) -> Result<Vec<EventRecord<P>>, EventStoreError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.started {
            let _ = self.advance().await?;
        }

        let mut events = Vec::new();
        while let Some(current) = self.current.take() {
            events.push(current);
            events.extend(self.page.drain(..));
            if !self.advance().await? {
                break;
            }
        }
        Ok(events)
    }

    /// Turn the cursor into a stream of owned events.
    ///
    /// The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<EventRecord<P>, EventStoreError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut cursor = state?;
            match cursor.advance().await {
                Ok(true) => cursor.current.take().map(|event| (Ok(event), Some(cursor))),
                Ok(false) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    /// The latched error, if any.
    pub fn error(&self) -> Option<&EventStoreError> {
        self.error.as_ref()
    }

    /// Number of page fetches issued so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    fn release(&mut self) {
        self.current = None;
        self.page = VecDeque::new();
    }

    async fn fetch_next_page(&mut self) -> Result<(), EventStoreError> {
        let limit = self
            .remaining
            .map_or(self.page_size, |remaining| remaining.min(self.page_size));
        if limit == 0 {
            self.done = true;
            return Ok(());
        }

        self.fetches += 1;
        let rows = self.source.fetch_page(limit, self.offset).await?;
        let fetched = rows.len();

        if fetched < limit {
            self.done = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(fetched);
        }
        self.offset += fetched;

        debug!(
            fetched,
            requested = limit,
            offset = self.offset,
            done = self.done,
            "[cursor.fetch_page] fetched page"
        );

        for row in rows {
            let event = self.materialize(row)?;
            self.page.push_back(event);
        }
        Ok(())
    }

    fn materialize(&self, row: RawEventRow) -> Result<EventRecord<P>, EventStoreError> {
        let RawEventRow {
            sequence,
            event_id,
            event_type,
            payload,
            metadata,
            created_at,
            stream,
        } = row;

        let payload = self
            .resolver
            .decode(&event_type, payload)
            .map_err(|error| match error {
                DecodeError::UnknownEventType { event_type } => {
                    EventStoreError::UnknownEventType { event_type }
                }
                DecodeError::Malformed { detail, .. } => EventStoreError::DeserializationFailed {
                    source_name: stream.clone(),
                    detail,
                },
            })?;

        let mut metadata = EventMetadata::try_from_value(metadata).map_err(|error| {
            EventStoreError::DeserializationFailed {
                source_name: stream.clone(),
                detail: error.to_string(),
            }
        })?;
        let sequence = u64::try_from(sequence).map_err(|_| {
            EventStoreError::DeserializationFailed {
                source_name: stream.clone(),
                detail: format!("negative sequence number {sequence}"),
            }
        })?;
        let _ = metadata.insert(STREAM_KEY, stream);

        Ok(EventRecord::new(event_type, payload)
            .with_event_id(event_id)
            .with_metadata(metadata)
            .with_created_at(created_at)
            .with_sequence(SequenceNumber::new(sequence)))
    }
}

impl<P> std::fmt::Debug for EventCursor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCursor")
            .field("page_size", &self.page_size)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("buffered", &self.page.len())
            .field("done", &self.done)
            .field("exhausted", &self.exhausted)
            .field("error", &self.error)
            .field("fetches", &self.fetches)
            .finish_non_exhaustive()
    }
}
