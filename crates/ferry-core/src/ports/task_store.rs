//! TaskStore port - 永続化ゲートウェイ
//!
//! 実装:
//! - `impls::InMemoryTaskStore`（開発・テスト用）
//! - `ferry-pg::PgTaskStore`（本番用）

use async_trait::async_trait;

use crate::domain::{StoredTask, StoreError, TaskId, TaskRecord};

/// TaskStore durably stores task records.
///
/// # 設計原則
/// - `store` assigns a fresh id on every call; the record's own `id` is ignored.
/// - Redelivered copies may create duplicate rows (same business fields,
///   different ids and retry counts). Deduplication is not this port's job.
/// - Implementations must tolerate concurrent `store` calls when the consumer
///   runs with prefetch > 1.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn store(&self, record: &TaskRecord) -> Result<TaskId, StoreError>;

    /// All stored tasks, oldest first.
    async fn list(&self) -> Result<Vec<StoredTask>, StoreError>;
}
