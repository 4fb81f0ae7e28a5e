//! Error taxonomy surfaced at the storage boundary.

use crate::types::{ProjectionName, ProjectionNameError, StreamName, StreamNameError};
use uuid::Uuid;

/// Identifies the storage operation that failed.
///
/// Used by `EventStoreError::StoreFailure` and `EventStoreError::Cancelled`
/// to name which operation encountered the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Health check round trip.
    Ping,
    /// Creating the catalog and registry tables.
    Install,
    /// Creating a stream's catalog row and physical log.
    CreateStream,
    /// Removing a stream's catalog row and physical log.
    DeleteStream,
    /// Checking the catalog for a stream.
    HasStream,
    /// Listing catalog stream names.
    ListStreams,
    /// Reading a stream's catalog metadata.
    FetchStreamMetadata,
    /// Replacing a stream's catalog metadata.
    UpdateStreamMetadata,
    /// Appending a batch of events.
    AppendEvents,
    /// Resolving a stream while building a query.
    BuildQuery,
    /// Fetching one page of a cursor.
    ReadPage,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Registering a projection.
    CreateProjection,
    /// Checking the registry for a projection.
    ProjectionExists,
    /// Reading a projection's status.
    FetchProjectionStatus,
    /// Writing a projection's status.
    UpdateProjectionStatus,
    /// Reading a projection's checkpoint.
    LoadProjection,
    /// Clearing a projection's checkpoint.
    ResetProjection,
    /// Writing a projection's checkpoint.
    PersistProjection,
    /// Removing a projection.
    DeleteProjection,
    /// Reading a projection's lock expiry.
    FetchProjectionLock,
    /// Writing a projection's lock expiry.
    UpdateProjectionLock,
    /// Listing projection names.
    FetchProjectionNames,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::Install => "install",
            Self::CreateStream => "create_stream",
            Self::DeleteStream => "delete_stream",
            Self::HasStream => "has_stream",
            Self::ListStreams => "list_streams",
            Self::FetchStreamMetadata => "fetch_stream_metadata",
            Self::UpdateStreamMetadata => "update_stream_metadata",
            Self::AppendEvents => "append_events",
            Self::BuildQuery => "build_query",
            Self::ReadPage => "read_page",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::CreateProjection => "create_projection",
            Self::ProjectionExists => "projection_exists",
            Self::FetchProjectionStatus => "fetch_projection_status",
            Self::UpdateProjectionStatus => "update_projection_status",
            Self::LoadProjection => "load_projection",
            Self::ResetProjection => "reset_projection",
            Self::PersistProjection => "persist_projection",
            Self::DeleteProjection => "delete_projection",
            Self::FetchProjectionLock => "fetch_projection_lock",
            Self::UpdateProjectionLock => "update_projection_lock",
            Self::FetchProjectionNames => "fetch_projection_names",
        };
        f.write_str(name)
    }
}

/// Coarse classification of [`EventStoreError`] for callers that only need
/// to decide between retrying, recomputing, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A stream or projection is absent.
    NotFound,
    /// A uniqueness or monotonicity rule rejected the write.
    Conflict,
    /// The input was malformed.
    Validation,
    /// The backend or the connection to it failed.
    TransientIo,
    /// The caller aborted the operation or its deadline passed.
    Cancelled,
}

/// Error type returned by every storage operation.
///
/// The type is `Clone` so a cursor can latch a failure and hand the same
/// error back on every later call.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EventStoreError {
    /// The stream has no catalog entry.
    #[error("stream {stream} not found")]
    StreamNotFound { stream: StreamName },

    /// The stream name is already registered in the catalog.
    #[error("stream {stream} already exists")]
    StreamAlreadyExists { stream: StreamName },

    /// The projection has no registry row.
    #[error("projection {name} not found")]
    ProjectionNotFound { name: ProjectionName },

    /// The projection name is already registered.
    #[error("projection {name} already exists")]
    ProjectionAlreadyExists { name: ProjectionName },

    /// Another writer already stored this aggregate version.
    ///
    /// Callers should reload the aggregate, recompute the version and retry
    /// the whole batch.
    #[error(
        "concurrency conflict: {aggregate_type} {aggregate_id} already has version {version}"
    )]
    ConcurrencyConflict {
        aggregate_type: String,
        aggregate_id: String,
        version: u64,
    },

    /// The event identifier is already present in the stream.
    #[error("event {event_id} is already stored in stream {stream}")]
    DuplicateEventId { stream: StreamName, event_id: Uuid },

    /// A checkpoint write would move a stream's position backwards.
    #[error(
        "checkpoint for projection {name} would move stream {stream} back from {recorded} to {attempted}"
    )]
    CheckpointRegression {
        name: ProjectionName,
        stream: StreamName,
        recorded: u64,
        attempted: u64,
    },

    /// A metadata matcher cannot be rendered.
    #[error("invalid matcher on field {field}: {detail}")]
    InvalidMatcher { field: String, detail: String },

    /// Event metadata lacks or mistypes a reserved key.
    #[error("invalid event metadata: {detail}")]
    InvalidMetadata { detail: String },

    /// An event cannot be stored as given.
    #[error("invalid event {event_id}: {detail}")]
    InvalidEvent { event_id: Uuid, detail: String },

    /// A stream or projection name failed validation.
    #[error("invalid name: {detail}")]
    InvalidName { detail: String },

    /// A stored status string is not a known projection status.
    #[error("unknown projection status {status}")]
    UnknownProjectionStatus { status: String },

    /// The type resolver has no decoder for a stored event type.
    #[error("unknown event type {event_type}")]
    UnknownEventType { event_type: String },

    /// A payload, state or metadata value could not be encoded.
    #[error("failed to serialize value: {detail}")]
    SerializationFailed { detail: String },

    /// A stored payload, state or metadata value could not be decoded.
    #[error("failed to deserialize value from {source_name}: {detail}")]
    DeserializationFailed { source_name: String, detail: String },

    /// A merge read was requested without any stream.
    #[error("merge read requires at least one stream")]
    EmptyMerge,

    /// Infrastructure failure surfaced by the backing store.
    #[error("{operation} operation failed: {detail}")]
    StoreFailure { operation: Operation, detail: String },

    /// The operation was aborted before it completed.
    #[error("{operation} operation was cancelled")]
    Cancelled { operation: Operation },
}

impl EventStoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StreamNotFound { .. } | Self::ProjectionNotFound { .. } => ErrorKind::NotFound,
            Self::StreamAlreadyExists { .. }
            | Self::ProjectionAlreadyExists { .. }
            | Self::ConcurrencyConflict { .. }
            | Self::DuplicateEventId { .. }
            | Self::CheckpointRegression { .. } => ErrorKind::Conflict,
            Self::InvalidMatcher { .. }
            | Self::InvalidMetadata { .. }
            | Self::InvalidEvent { .. }
            | Self::InvalidName { .. }
            | Self::UnknownProjectionStatus { .. }
            | Self::UnknownEventType { .. }
            | Self::SerializationFailed { .. }
            | Self::DeserializationFailed { .. }
            | Self::EmptyMerge => ErrorKind::Validation,
            Self::StoreFailure { .. } => ErrorKind::TransientIo,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Shorthand for matching [`EventStoreError::ConcurrencyConflict`].
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StreamNameError> for EventStoreError {
    fn from(error: StreamNameError) -> Self {
        Self::InvalidName {
            detail: error.to_string(),
        }
    }
}

impl From<ProjectionNameError> for EventStoreError {
    fn from(error: ProjectionNameError) -> Self {
        Self::InvalidName {
            detail: error.to_string(),
        }
    }
}
