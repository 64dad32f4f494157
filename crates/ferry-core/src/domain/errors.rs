//! Errors - 各ステージのエラー型
//!
//! Every stage of a delivery pass returns its own error type so the pipeline
//! can branch on values instead of on log lines.

use std::time::Duration;

use thiserror::Error;

/// Payload could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed task payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode task: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The task store refused or failed a write.
///
/// The pipeline treats every variant as retryable; the retry budget carried in
/// the message bounds how often that happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connectivity or pool problems.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the row (constraint violation and the like).
    #[error("task store rejected the task: {0}")]
    Rejected(String),

    #[error("task store call timed out after {0:?}")]
    Timeout(Duration),
}

/// A broker operation (consume, ack, nack, publish) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("nack failed: {0}")]
    Nack(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("broker channel closed")]
    Closed,
}

/// A delivery pass could not reach a clean terminal state.
///
/// These never reach a caller synchronously; the run loop logs them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to encode retry copy (retry_count={retry_count}): {source}")]
    EncodeRetry {
        retry_count: u32,
        #[source]
        source: CodecError,
    },

    #[error("failed to republish task (retry_count={retry_count}): {source}")]
    Republish {
        retry_count: u32,
        #[source]
        source: BrokerError,
    },

    #[error("failed to acknowledge delivery: {0}")]
    Acknowledge(#[source] BrokerError),
}

/// A submission was refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task name must not be blank")]
    BlankName,

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
