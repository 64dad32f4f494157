//! Submitter - 新規タスクの投入
//!
//! Validates a [`NewTask`], turns it into a fresh [`TaskRecord`]
//! (no id, zero retries) and publishes it onto the queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{NewTask, SubmitError, TaskRecord, codec};
use crate::ports::Publisher;

pub struct Submitter {
    publisher: Arc<dyn Publisher>,
    publish_timeout: Duration,
}

impl Submitter {
    pub fn new(publisher: Arc<dyn Publisher>, publish_timeout: Duration) -> Self {
        Self {
            publisher,
            publish_timeout,
        }
    }

    /// Publish a new task. Returns the record exactly as it was queued.
    pub async fn submit(&self, task: NewTask) -> Result<TaskRecord, SubmitError> {
        if task.name.trim().is_empty() {
            return Err(SubmitError::BlankName);
        }

        let record = TaskRecord::new(task.name, task.quantity);
        let payload = codec::encode(&record)?;
        debug!(bytes = payload.len(), "publishing new task");
        self.publisher
            .publish_within(&payload, self.publish_timeout)
            .await?;

        info!(name = %record.name, quantity = record.quantity, "task submitted");
        Ok(record)
    }
}
