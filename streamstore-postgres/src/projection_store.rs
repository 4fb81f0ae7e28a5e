//! Projection registry: checkpoint position, materialized state, status and
//! lock expiry per projection.
//!
//! Every write that targets a row by name checks the affected-row count and
//! reports `ProjectionNotFound` instead of silently doing nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Row, query};
use streamstore::{
    EventStoreError, Operation, ProjectionName, ProjectionPosition, ProjectionStatus,
};
use tracing::{debug, info, instrument, warn};

use crate::{PostgresEventStore, is_unique_violation, map_sqlx_error};

/// A projection's stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionCheckpoint<S> {
    /// Last consumed sequence per stream.
    pub position: ProjectionPosition,
    /// Materialized state.
    pub state: S,
    /// Lifecycle status.
    pub status: ProjectionStatus,
}

impl PostgresEventStore {
    /// Register a projection with an empty position.
    ///
    /// Fails with `ProjectionAlreadyExists` if the name is taken.
    #[instrument(
        name = "postgres.create_projection",
        skip(self, initial_state),
        fields(projection = %name)
    )]
    pub async fn create_projection<S>(
        &self,
        name: &ProjectionName,
        initial_state: &S,
        status: ProjectionStatus,
    ) -> Result<(), EventStoreError>
    where
        S: Serialize + Sync,
    {
        let operation = Operation::CreateProjection;
        let state = encode(initial_state)?;
        self.bounded(operation, async {
            let inserted = query(
                "INSERT INTO projections (name, position, state, status)
                 VALUES ($1, '{}'::jsonb, $2, $3)",
            )
            .bind(name.as_ref())
            .bind(Json(&state))
            .bind(status.as_str())
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    info!(status = %status, "[postgres.create_projection] projection registered");
                    Ok(())
                }
                Err(error) if is_unique_violation(&error) => {
                    warn!("[postgres.create_projection] projection already exists");
                    Err(EventStoreError::ProjectionAlreadyExists { name: name.clone() })
                }
                Err(error) => Err(map_sqlx_error(error, operation)),
            }
        })
        .await
    }

    /// True if a projection is registered under `name`.
    #[instrument(name = "postgres.projection_exists", skip(self), fields(projection = %name))]
    pub async fn projection_exists(&self, name: &ProjectionName) -> Result<bool, EventStoreError> {
        let operation = Operation::ProjectionExists;
        self.bounded(operation, async {
            let row = query("SELECT 1 FROM projections WHERE name = $1")
                .bind(name.as_ref())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;
            Ok(row.is_some())
        })
        .await
    }

    /// Current status of a projection.
    #[instrument(name = "postgres.fetch_projection_status", skip(self), fields(projection = %name))]
    pub async fn fetch_projection_status(
        &self,
        name: &ProjectionName,
    ) -> Result<ProjectionStatus, EventStoreError> {
        let operation = Operation::FetchProjectionStatus;
        self.bounded(operation, async {
            let row = self
                .fetch_projection_row(name, "status", operation)
                .await?;
            read_status(&row, operation)
        })
        .await
    }

    /// Overwrite a projection's status.
    #[instrument(
        name = "postgres.update_projection_status",
        skip(self),
        fields(projection = %name, status = %status)
    )]
    pub async fn update_projection_status(
        &self,
        name: &ProjectionName,
        status: ProjectionStatus,
    ) -> Result<(), EventStoreError> {
        let operation = Operation::UpdateProjectionStatus;
        self.bounded(operation, async {
            let result = query("UPDATE projections SET status = $2 WHERE name = $1")
                .bind(name.as_ref())
                .bind(status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;
            require_affected(result.rows_affected(), name)
        })
        .await
    }

    /// Read a projection's checkpoint.
    #[instrument(name = "postgres.load_projection", skip(self), fields(projection = %name))]
    pub async fn load_projection<S>(
        &self,
        name: &ProjectionName,
    ) -> Result<ProjectionCheckpoint<S>, EventStoreError>
    where
        S: DeserializeOwned,
    {
        let operation = Operation::LoadProjection;
        self.bounded(operation, async {
            let row = self
                .fetch_projection_row(name, "position, state, status", operation)
                .await?;

            let position = read_position(&row, name, operation)?;
            let state: Json<Value> = row
                .try_get("state")
                .map_err(|error| map_sqlx_error(error, operation))?;
            let state = serde_json::from_value(state.0).map_err(|error| {
                EventStoreError::DeserializationFailed {
                    source_name: name.to_string(),
                    detail: error.to_string(),
                }
            })?;
            let status = read_status(&row, operation)?;

            debug!(streams = position.len(), "[postgres.load_projection] checkpoint loaded");
            Ok(ProjectionCheckpoint {
                position,
                state,
                status,
            })
        })
        .await
    }

    /// Clear a projection's position, replace its state and mark it idle.
    #[instrument(
        name = "postgres.reset_projection",
        skip(self, cleared_state),
        fields(projection = %name)
    )]
    pub async fn reset_projection<S>(
        &self,
        name: &ProjectionName,
        cleared_state: &S,
    ) -> Result<(), EventStoreError>
    where
        S: Serialize + Sync,
    {
        let operation = Operation::ResetProjection;
        let state = encode(cleared_state)?;
        self.bounded(operation, async {
            let result = query(
                "UPDATE projections SET status = $2, position = '{}'::jsonb, state = $3
                 WHERE name = $1",
            )
            .bind(name.as_ref())
            .bind(ProjectionStatus::Idle.as_str())
            .bind(Json(&state))
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

            require_affected(result.rows_affected(), name)?;
            info!("[postgres.reset_projection] checkpoint cleared");
            Ok(())
        })
        .await
    }

    /// Store a new checkpoint and mark the projection idle.
    ///
    /// `position` is merged over the recorded position: streams it names are
    /// overwritten, others keep their value. A position lower than the
    /// recorded one for any stream fails with `CheckpointRegression` and
    /// nothing is written.
    #[instrument(
        name = "postgres.persist_projection",
        skip(self, state, position),
        fields(projection = %name)
    )]
    pub async fn persist_projection<S>(
        &self,
        name: &ProjectionName,
        state: &S,
        position: &ProjectionPosition,
    ) -> Result<(), EventStoreError>
    where
        S: Serialize + Sync,
    {
        let operation = Operation::PersistProjection;
        let state = encode(state)?;
        self.bounded(operation, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

            let row = query("SELECT position FROM projections WHERE name = $1 FOR UPDATE")
                .bind(name.as_ref())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?
                .ok_or_else(|| EventStoreError::ProjectionNotFound { name: name.clone() })?;
            let recorded = read_position(&row, name, operation)?;

            if let Err(regression) = position.check_advances_from(&recorded) {
                warn!(
                    stream = %regression.stream,
                    recorded = %regression.recorded,
                    attempted = %regression.attempted,
                    "[postgres.persist_projection] checkpoint would move backwards"
                );
                return Err(EventStoreError::CheckpointRegression {
                    name: name.clone(),
                    stream: regression.stream,
                    recorded: regression.recorded.into_inner(),
                    attempted: regression.attempted.into_inner(),
                });
            }
            let merged = position.merged_over(&recorded);

            let result = query(
                "UPDATE projections SET status = $2, position = $3, state = $4 WHERE name = $1",
            )
            .bind(name.as_ref())
            .bind(ProjectionStatus::Idle.as_str())
            .bind(Json(&merged))
            .bind(Json(&state))
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;
            require_affected(result.rows_affected(), name)?;

            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

            debug!(streams = merged.len(), "[postgres.persist_projection] checkpoint stored");
            Ok(())
        })
        .await
    }

    /// Remove a projection.
    #[instrument(name = "postgres.delete_projection", skip(self), fields(projection = %name))]
    pub async fn delete_projection(&self, name: &ProjectionName) -> Result<(), EventStoreError> {
        let operation = Operation::DeleteProjection;
        self.bounded(operation, async {
            let result = query("DELETE FROM projections WHERE name = $1")
                .bind(name.as_ref())
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;

            require_affected(result.rows_affected(), name)?;
            info!("[postgres.delete_projection] projection deleted");
            Ok(())
        })
        .await
    }

    /// Stored lock expiry of a projection, if one is set.
    #[instrument(name = "postgres.fetch_projection_lock", skip(self), fields(projection = %name))]
    pub async fn fetch_projection_lock(
        &self,
        name: &ProjectionName,
    ) -> Result<Option<DateTime<Utc>>, EventStoreError> {
        let operation = Operation::FetchProjectionLock;
        self.bounded(operation, async {
            let row = self
                .fetch_projection_row(name, "locked_until", operation)
                .await?;
            row.try_get("locked_until")
                .map_err(|error| map_sqlx_error(error, operation))
        })
        .await
    }

    /// Set or clear a projection's lock expiry.
    ///
    /// The value is stored verbatim; no lease policy is applied.
    #[instrument(name = "postgres.update_projection_lock", skip(self), fields(projection = %name))]
    pub async fn update_projection_lock(
        &self,
        name: &ProjectionName,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<(), EventStoreError> {
        let operation = Operation::UpdateProjectionLock;
        self.bounded(operation, async {
            let result = query("UPDATE projections SET locked_until = $2 WHERE name = $1")
                .bind(name.as_ref())
                .bind(locked_until)
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;
            require_affected(result.rows_affected(), name)
        })
        .await
    }

    /// Names of all registered projections in creation order.
    #[instrument(name = "postgres.fetch_projection_names", skip(self))]
    pub async fn fetch_projection_names(&self) -> Result<Vec<ProjectionName>, EventStoreError> {
        let operation = Operation::FetchProjectionNames;
        self.bounded(operation, async {
            let rows = query("SELECT name FROM projections ORDER BY no ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;

            let mut names = Vec::with_capacity(rows.len());
            for row in rows {
                let name: String = row
                    .try_get("name")
                    .map_err(|error| map_sqlx_error(error, operation))?;
                names.push(ProjectionName::try_new(name)?);
            }
            Ok(names)
        })
        .await
    }

    async fn fetch_projection_row(
        &self,
        name: &ProjectionName,
        columns: &str,
        operation: Operation,
    ) -> Result<PgRow, EventStoreError> {
        let sql = format!("SELECT {columns} FROM projections WHERE name = $1");
        query(&sql)
            .bind(name.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?
            .ok_or_else(|| EventStoreError::ProjectionNotFound { name: name.clone() })
    }
}

fn encode<S: Serialize>(value: &S) -> Result<Value, EventStoreError> {
    serde_json::to_value(value).map_err(|error| EventStoreError::SerializationFailed {
        detail: error.to_string(),
    })
}

fn require_affected(rows: u64, name: &ProjectionName) -> Result<(), EventStoreError> {
    if rows == 0 {
        return Err(EventStoreError::ProjectionNotFound { name: name.clone() });
    }
    Ok(())
}

fn read_status(row: &PgRow, operation: Operation) -> Result<ProjectionStatus, EventStoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|error| map_sqlx_error(error, operation))?;
    status.parse()
}

fn read_position(
    row: &PgRow,
    name: &ProjectionName,
    operation: Operation,
) -> Result<ProjectionPosition, EventStoreError> {
    let position: Json<Value> = row
        .try_get("position")
        .map_err(|error| map_sqlx_error(error, operation))?;
    serde_json::from_value(position.0).map_err(|error| EventStoreError::DeserializationFailed {
        source_name: name.to_string(),
        detail: error.to_string(),
    })
}
