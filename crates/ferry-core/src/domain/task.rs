//! Task record: the unit of work that travels through the queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier assigned by the task store on a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A task as it is carried in a queue message.
///
/// Design:
/// - `retry_count` travels inside the message body, so the consumer stays
///   stateless. Every republished copy carries the incremented value.
/// - `name` and `quantity` are opaque to the pipeline.
/// - `id` is only meaningful once the store has assigned one; on the wire a
///   missing field and `0` both mean "not assigned yet".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(
        default,
        deserialize_with = "zero_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<TaskId>,

    pub name: String,

    /// Numeric payload. Older producers call this field `age`.
    #[serde(alias = "age")]
    pub quantity: i64,

    #[serde(default, alias = "retryCount")]
    pub retry_count: u32,
}

impl TaskRecord {
    /// A fresh record as produced by a submission (no id, zero retries).
    pub fn new(name: impl Into<String>, quantity: i64) -> Self {
        Self {
            id: None,
            name: name.into(),
            quantity,
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Count one failed persistence attempt. Returns the new retry count.
    pub fn record_failure(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<TaskId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.filter(|id| *id != 0).map(TaskId::new))
}

/// Request body accepted by the submission surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,

    #[serde(alias = "age")]
    pub quantity: i64,
}

/// A task after it has been durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTask {
    pub id: TaskId,
    pub name: String,
    pub quantity: i64,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}
