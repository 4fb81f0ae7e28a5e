#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    unreachable_code,
    unused_assignments,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_variables
)]

//! Backend-independent vocabulary for the StreamStore event log.
//!
//! This crate holds everything a storage backend and its callers share:
//! - Domain types: `StreamName`, `ProjectionName`, `SequenceNumber`
//! - Events: `EventRecord`, `EventMetadata` and the reserved aggregate keys
//! - Filtering: `MetadataMatcher`, `MetadataMatch`, `MessageProperty`
//! - Decoding: the `EventTypeResolver` capability and its `TypeRegistry`
//! - Reading: `EventCursor` over an abstract `PageSource`
//! - Checkpoints: `ProjectionStatus`, `ProjectionPosition`
//! - Errors: `EventStoreError`, `ErrorKind`, `Operation`
//!
//! Backends such as `streamstore-postgres` implement `PageSource` and return
//! `EventCursor`s from their read operations.

mod cursor;
mod errors;
mod event;
mod matcher;
mod projection;
mod resolver;
mod types;
mod validation;

pub use cursor::{DEFAULT_PAGE_SIZE, EventCursor, PageSize, PageSource, RawEventRow};
pub use errors::{ErrorKind, EventStoreError, Operation};
pub use event::{
    AGGREGATE_ID_KEY, AGGREGATE_TYPE_KEY, AGGREGATE_VERSION_KEY, AggregateRef, EventMetadata,
    EventRecord, STREAM_KEY,
};
pub use matcher::{
    FieldDomain, MatchOperator, MatchValue, MessageProperty, MetadataMatch, MetadataMatcher,
    parse_set_literal,
};
pub use projection::{PositionRegression, ProjectionPosition, ProjectionStatus};
pub use resolver::{DecodeError, EventTypeResolver, TypeRegistry};
pub use types::{
    ProjectionName, ProjectionNameError, SequenceNumber, StreamName, StreamNameError,
};
