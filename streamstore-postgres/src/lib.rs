//! PostgreSQL persistence strategy for the StreamStore event log.
//!
//! Every logical stream lives in its own physical table, named by a hash of
//! the stream name and registered in the `event_streams` catalog. Projection
//! checkpoints live in the `projections` registry. All operations are methods
//! on [`PostgresEventStore`], a cheap-to-clone handle around a connection
//! pool.
//!
//! Dropping an operation's future aborts it; every operation is additionally
//! bounded by [`PostgresConfig::operation_timeout`] and fails with
//! [`EventStoreError::Cancelled`] once it expires.

mod append;
mod catalog;
mod projection_store;
mod query_builder;
mod reader;
mod schema;

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions, query};
use streamstore::{EventStoreError, Operation, PageSize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use projection_store::ProjectionCheckpoint;
pub use query_builder::{BuiltQuery, QueryParam};
pub use reader::{PgPageSource, StreamLoad};
pub use schema::{PROJECTIONS_TABLE, STREAMS_TABLE, stream_table_name};

/// SQLSTATE raised for a violated unique constraint.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE raised when a statement is cancelled server-side.
const QUERY_CANCELED: &str = "57014";
/// SQLSTATE raised when a relation does not exist.
const UNDEFINED_TABLE: &str = "42P01";

/// Failure to set up a [`PostgresEventStore`].
#[derive(Debug, Error)]
pub enum PostgresEventStoreError {
    /// The connection pool could not be established.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying type.
///
/// # Examples
///
/// ```ignore
/// use streamstore_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration for [`PostgresEventStore`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Upper bound on any single store operation or cursor page fetch
    /// (default: 30 seconds)
    pub operation_timeout: Duration,
    /// Rows fetched per cursor page (default: 1000)
    pub page_size: PageSize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            operation_timeout: Duration::from_secs(30),
            page_size: PageSize::default(),
        }
    }
}

/// Cloneable handle to the event log, backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Pool<Postgres>,
    config: PostgresConfig,
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresEventStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresEventStore with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresEventStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresEventStoreError::ConnectionFailed)?;
        Ok(Self { pool, config })
    }

    /// Create a PostgresEventStore from an existing connection pool.
    ///
    /// Pool settings in the default configuration are ignored; timeouts and
    /// page size still apply.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            config: PostgresConfig::default(),
        }
    }

    /// Replace the operation timeout and page size of this handle.
    #[must_use]
    pub fn with_limits(mut self, operation_timeout: Duration, page_size: PageSize) -> Self {
        self.config.operation_timeout = operation_timeout;
        self.config.page_size = page_size;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// The active configuration.
    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Round-trip a trivial query.
    #[instrument(name = "postgres.ping", skip(self))]
    pub async fn ping(&self) -> Result<(), EventStoreError> {
        self.bounded(Operation::Ping, async {
            let _ = query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Ping))?;
            Ok(())
        })
        .await
    }

    /// Create the stream catalog and projection registry if absent.
    ///
    /// Safe to call concurrently and repeatedly: the work runs under a
    /// transaction-scoped advisory lock and every statement is idempotent.
    #[instrument(name = "postgres.install", skip(self))]
    pub async fn install(&self) -> Result<(), EventStoreError> {
        self.bounded(Operation::Install, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

            let _ = query("SELECT pg_advisory_xact_lock($1)")
                .bind(schema::INSTALL_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Install))?;

            for statement in schema::install_statements() {
                let _ = query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::Install))?;
            }

            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

            info!("[postgres.install] catalog and projection registry ready");
            Ok(())
        })
        .await
    }

    /// Run `future` under the configured operation timeout.
    pub(crate) async fn bounded<T, F>(
        &self,
        operation: Operation,
        future: F,
    ) -> Result<T, EventStoreError>
    where
        F: Future<Output = Result<T, EventStoreError>>,
    {
        with_deadline(self.config.operation_timeout, operation, future).await
    }
}

/// Run `future`, failing with `Cancelled` if it outlives `timeout`.
pub(crate) async fn with_deadline<T, F>(
    timeout: Duration,
    operation: Operation,
    future: F,
) -> Result<T, EventStoreError>
where
    F: Future<Output = Result<T, EventStoreError>>,
{
    tokio::time::timeout(timeout, future).await.unwrap_or_else(|_| {
        warn!(
            operation = %operation,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "[postgres.timeout] operation exceeded its deadline"
        );
        Err(EventStoreError::Cancelled { operation })
    })
}

/// SQLSTATE of a database error, if any.
pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    sqlstate(error).as_deref() == Some(UNIQUE_VIOLATION)
}

pub(crate) fn is_undefined_table(error: &sqlx::Error) -> bool {
    sqlstate(error).as_deref() == Some(UNDEFINED_TABLE)
}

/// Name of the constraint a database error refers to.
pub(crate) fn violated_constraint(error: &sqlx::Error) -> Option<&str> {
    match error {
        sqlx::Error::Database(db_error) => db_error.constraint(),
        _ => None,
    }
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> EventStoreError {
    if sqlstate(&error).as_deref() == Some(QUERY_CANCELED) {
        warn!(
            error = %error,
            operation = %operation,
            "[postgres.cancelled] statement was cancelled by the server"
        );
        return EventStoreError::Cancelled { operation };
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    EventStoreError::StoreFailure {
        operation,
        detail: error.to_string(),
    }
}
