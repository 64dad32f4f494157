//! InMemoryTaskStore - テスト用の永続化先
//!
//! Supports fault injection so pipeline tests can script failures:
//! queued one-shot errors, a permanent error, and artificial latency.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{StoreError, StoredTask, TaskId, TaskRecord};
use crate::ports::TaskStore;

#[derive(Default)]
struct StoreState {
    rows: Vec<StoredTask>,
    /// Every record passed to `store`, successful or not.
    attempts: Vec<TaskRecord>,
    scripted_failures: VecDeque<StoreError>,
    permanent_failure: Option<StoreError>,
    next_id: i64,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    latency: Option<Duration>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `store` call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `store` call fails with `error` (queued, one per call).
    pub fn fail_next(&self, error: StoreError) {
        self.lock().scripted_failures.push_back(error);
    }

    /// Every `store` call fails with `error` until [`Self::heal`] is called.
    pub fn fail_always(&self, error: StoreError) {
        self.lock().permanent_failure = Some(error);
    }

    pub fn heal(&self) {
        let mut state = self.lock();
        state.permanent_failure = None;
        state.scripted_failures.clear();
    }

    pub fn rows(&self) -> Vec<StoredTask> {
        self.lock().rows.clone()
    }

    pub fn attempts(&self) -> Vec<TaskRecord> {
        self.lock().attempts.clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn store(&self, record: &TaskRecord) -> Result<TaskId, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.attempts.push(record.clone());

        if let Some(err) = state.permanent_failure.clone() {
            return Err(err);
        }
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }

        state.next_id += 1;
        let id = TaskId::new(state.next_id);
        state.rows.push(StoredTask {
            id,
            name: record.name.clone(),
            quantity: record.quantity,
            retry_count: record.retry_count,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    /// Fails while a permanent failure is set; one-shot failures only hit `store`.
    async fn list(&self) -> Result<Vec<StoredTask>, StoreError> {
        let state = self.lock();
        match &state.permanent_failure {
            Some(err) => Err(err.clone()),
            None => Ok(state.rows.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_assigns_increasing_ids() {
        let store = InMemoryTaskStore::new();
        let a = store.store(&TaskRecord::new("a", 1)).await.unwrap();
        let b = store.store(&TaskRecord::new("b", 2)).await.unwrap();
        assert!(b > a);

        let rows = store.list().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "a");
        assert_eq!(rows[1].id, b);
    }

    #[tokio::test]
    async fn test_scripted_failures_are_one_shot() {
        let store = InMemoryTaskStore::new();
        store.fail_next(StoreError::Unavailable("down".to_string()));

        let record = TaskRecord::new("bob", 40);
        assert!(store.store(&record).await.is_err());
        assert!(store.store(&record).await.is_ok());
        assert_eq!(store.attempts().len(), 2);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_until_healed() {
        let store = InMemoryTaskStore::new();
        store.fail_always(StoreError::Rejected("constraint".to_string()));

        let record = TaskRecord::new("carol", 50);
        assert!(store.store(&record).await.is_err());
        assert!(store.store(&record).await.is_err());

        store.heal();
        assert!(store.store(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_incoming_id_is_ignored() {
        let store = InMemoryTaskStore::new();
        let mut record = TaskRecord::new("dave", 1);
        record.id = Some(TaskId::new(99));

        let id = store.store(&record).await.unwrap();
        assert_eq!(id, TaskId::new(1));
    }
}
