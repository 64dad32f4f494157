//! Decision model: what to do with a task after a failed store attempt.
//!
//! This module defines the Decision type (requeue or dead-letter), the Decider
//! trait (how to pick one), and the policy for payloads that cannot be decoded.

use super::errors::StoreError;
use super::task::TaskRecord;

/// Retry ceiling used when nothing else is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The next action for a task whose store attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Publish the record again with its incremented retry count.
    Requeue,

    /// Give up: negative ack without requeue.
    DeadLetter,
}

/// Trait for deciding the next action after a failed store attempt.
///
/// Deciders are pure functions: given the record (whose `retry_count` already
/// includes the failure just observed) and the error, they return the next
/// action without side effects. Acting on the decision is the pipeline's job.
pub trait Decider: Send + Sync {
    fn decide(&self, record: &TaskRecord, error: &StoreError) -> Decision;
}

/// Retry budget for one task lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of republishes per lineage.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Has a record with this retry count used up its budget?
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Default decider: count-based, every store error is treated as transient.
///
/// - Requeue while `retry_count <= max_retries`
/// - Dead-letter once `retry_count > max_retries`
///
/// No backoff: a requeued copy goes to the back of the queue immediately.
#[derive(Debug, Clone, Default)]
pub struct RetryDecider {
    policy: RetryPolicy,
}

impl RetryDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(RetryPolicy::new(max_retries))
    }
}

impl Decider for RetryDecider {
    fn decide(&self, record: &TaskRecord, _error: &StoreError) -> Decision {
        if self.policy.is_exhausted(record.retry_count) {
            Decision::DeadLetter
        } else {
            Decision::Requeue
        }
    }
}

/// What to do with a payload that cannot be decoded into a task.
///
/// Retrying such a payload cannot succeed, so it never consumes retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Positive ack: the message is dropped as if it were handled.
    #[default]
    Acknowledge,

    /// Negative ack without requeue, so a broker-side dead-letter exchange
    /// can pick it up.
    DeadLetter,
}
