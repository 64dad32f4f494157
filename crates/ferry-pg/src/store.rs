//! PgTaskStore - tasks テーブルへの永続化

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::schema::{CREATE_TASKS, INSERT_TASK, SELECT_TASKS};
use ferry_core::domain::{StoreError, StoredTask, TaskId, TaskRecord};
use ferry_core::ports::TaskStore;

/// Postgres-backed [`TaskStore`].
///
/// The record's incoming `id` is ignored; the database assigns one.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool. Fails if no connection can be made within five seconds.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(classify)?;
        info!(max_connections, "connected to postgres");
        Ok(Self::new(pool))
    }

    /// Create the `tasks` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TASKS)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        debug!("tasks table ready");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn store(&self, record: &TaskRecord) -> Result<TaskId, StoreError> {
        let retry_count = i32::try_from(record.retry_count).map_err(|_| {
            StoreError::Rejected(format!("retry_count {} out of range", record.retry_count))
        })?;

        let row = sqlx::query(INSERT_TASK)
            .bind(&record.name)
            .bind(record.quantity)
            .bind(retry_count)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        let id: i64 = row.try_get("id").map_err(classify)?;
        Ok(TaskId::new(id))
    }

    async fn list(&self) -> Result<Vec<StoredTask>, StoreError> {
        let rows = sqlx::query(SELECT_TASKS)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(stored_task).collect()
    }
}

fn stored_task(row: &PgRow) -> Result<StoredTask, StoreError> {
    let retry_count: i32 = row.try_get("retry_count").map_err(classify)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(classify)?;
    Ok(StoredTask {
        id: TaskId::new(row.try_get("id").map_err(classify)?),
        name: row.try_get("name").map_err(classify)?,
        quantity: row.try_get("quantity").map_err(classify)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StoreError::Rejected(format!("negative retry_count {retry_count}")))?,
        created_at,
    })
}

/// Map a sqlx error onto the domain.
///
/// - サーバが拒否したもの、行やカラムの不整合 → `Rejected`
/// - 接続・プール・I/O → `Unavailable`
///
/// Both are retried by the pipeline; the split only matters for logs.
pub fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::Rejected(db.to_string()),
        err @ (sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }) => StoreError::Rejected(err.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(sqlx::Error::PoolTimedOut, false)]
    #[case(sqlx::Error::PoolClosed, false)]
    #[case(sqlx::Error::WorkerCrashed, false)]
    #[case(sqlx::Error::RowNotFound, true)]
    #[case(sqlx::Error::ColumnNotFound("quantity".to_string()), true)]
    fn test_classify(#[case] err: sqlx::Error, #[case] rejected: bool) {
        let classified = classify(err);
        if rejected {
            assert!(matches!(classified, StoreError::Rejected(_)));
        } else {
            assert!(matches!(classified, StoreError::Unavailable(_)));
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        assert!(CREATE_TASKS.contains("CREATE TABLE IF NOT EXISTS tasks"));
    }

    #[test]
    fn test_insert_returns_generated_id() {
        assert!(INSERT_TASK.trim_end().ends_with("RETURNING id"));
        assert!(!INSERT_TASK.contains("(id,"));
    }
}
