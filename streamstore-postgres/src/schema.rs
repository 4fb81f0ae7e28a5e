//! Table layout: catalog, projection registry and per-stream logs.

use sha2::{Digest, Sha224};
use streamstore::StreamName;

/// Catalog of logical streams.
pub const STREAMS_TABLE: &str = "event_streams";
/// Registry of projection checkpoints.
pub const PROJECTIONS_TABLE: &str = "projections";

/// Advisory lock key serializing concurrent `install` calls.
pub(crate) const INSTALL_LOCK_KEY: i64 = 0x7374_7265_616d;

/// Suffix of the unique `(aggregate_type, aggregate_id, aggregate_version)`
/// constraint on every stream log.
pub(crate) const AGGREGATE_CONSTRAINT_SUFFIX: &str = "_agg";
/// Suffix of the unique `event_id` constraint on every stream log.
pub(crate) const EVENT_ID_CONSTRAINT_SUFFIX: &str = "_eid";

/// Physical table identifier for a stream: `_` followed by the lowercase hex
/// SHA-224 digest of the name.
///
/// The result is always 57 ASCII characters, so the table name and its
/// constraint names stay inside PostgreSQL's 63-byte identifier limit.
pub fn stream_table_name(stream: &StreamName) -> String {
    let digest = Sha224::digest(stream.as_ref().as_bytes());
    format!("_{}", hex::encode(digest))
}

pub(crate) fn install_statements() -> [&'static str; 2] {
    [
        r"
        CREATE TABLE IF NOT EXISTS event_streams (
            no BIGSERIAL PRIMARY KEY,
            real_stream_name VARCHAR(150) NOT NULL UNIQUE,
            stream_name VARCHAR(63) NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb
        )",
        r"
        CREATE TABLE IF NOT EXISTS projections (
            no BIGSERIAL PRIMARY KEY,
            name VARCHAR(150) NOT NULL UNIQUE,
            position JSONB NOT NULL DEFAULT '{}'::jsonb,
            state JSONB NOT NULL,
            status VARCHAR(28) NOT NULL,
            locked_until TIMESTAMPTZ NULL
        )",
    ]
}

/// Statements creating one stream log. `table` must come from
/// [`stream_table_name`].
pub(crate) fn create_stream_table_statements(table: &str) -> [String; 2] {
    [
        format!(
            r#"
            CREATE TABLE "{table}" (
                no BIGSERIAL PRIMARY KEY,
                event_id UUID NOT NULL,
                event_name VARCHAR(100) NOT NULL,
                payload JSONB NOT NULL,
                metadata JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                aggregate_version BIGINT NOT NULL,
                CONSTRAINT "{table}{EVENT_ID_CONSTRAINT_SUFFIX}" UNIQUE (event_id),
                CONSTRAINT "{table}{AGGREGATE_CONSTRAINT_SUFFIX}"
                    UNIQUE (aggregate_type, aggregate_id, aggregate_version)
            )"#
        ),
        format!(
            r#"CREATE INDEX "{table}_ix" ON "{table}" (aggregate_type, aggregate_id, no)"#
        ),
    ]
}

pub(crate) fn drop_stream_table_statement(table: &str) -> String {
    format!(r#"DROP TABLE IF EXISTS "{table}""#)
}
