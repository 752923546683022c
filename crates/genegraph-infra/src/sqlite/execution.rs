//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `genegraph-core`. The spec and the
//! status snapshot are stored as JSON text; `phase` is duplicated into its own
//! column so listings can filter without decoding the snapshot.

use chrono::{DateTime, SecondsFormat, Utc};
use genegraph_core::repository::ExecutionRepository;
use genegraph_types::error::RepositoryError;
use genegraph_types::execution::{Execution, ExecutionStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    name: String,
    uid: String,
    spec: String,
    status: String,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            uid: row.try_get("uid")?,
            spec: row.try_get("spec")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let uid = Uuid::parse_str(&self.uid)
            .map_err(|e| RepositoryError::Query(format!("invalid execution uid: {e}")))?;
        let spec = serde_json::from_str(&self.spec)
            .map_err(|e| RepositoryError::Query(format!("invalid spec JSON for '{}': {e}", self.name)))?;
        let status = serde_json::from_str(&self.status)
            .map_err(|e| RepositoryError::Query(format!("invalid status JSON for '{}': {e}", self.name)))?;

        Ok(Execution {
            name: self.name,
            uid,
            created_at: parse_datetime(&self.created_at)?,
            spec,
            status,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so `ORDER BY created_at` is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn status_json(status: &ExecutionStatus) -> Result<String, RepositoryError> {
    serde_json::to_string(status).map_err(|e| RepositoryError::Query(e.to_string()))
}

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let spec_json =
            serde_json::to_string(&execution.spec).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let status_json = status_json(&execution.status)?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            "INSERT INTO executions (name, uid, spec, status, phase, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.name)
        .bind(execution.uid.to_string())
        .bind(&spec_json)
        .bind(&status_json)
        .bind(execution.status.phase.to_string())
        .bind(format_datetime(&execution.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("execution '{}' already exists", execution.name)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let row = ExecutionRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(row.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_status(&self, name: &str, status: &ExecutionStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE executions SET status = ?, phase = ?, updated_at = ? WHERE name = ?")
            .bind(status_json(status)?)
            .bind(status.phase.to_string())
            .bind(format_datetime(&Utc::now()))
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions ORDER BY created_at ASC, name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let row = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(row.into_execution()?);
        }
        Ok(executions)
    }

    async fn delete(&self, name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM executions WHERE name = ?")
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
