//! Domain model (task records, wire codec, retry decisions, outcomes, errors).
//!
//! Nothing in here performs I/O; ports and app build on top of these types.

pub mod task;
pub mod codec;
pub mod decision;
pub mod outcome;
pub mod errors;

pub use self::task::{NewTask, StoredTask, TaskId, TaskRecord};
pub use self::decision::{
    DEFAULT_MAX_RETRIES, Decider, Decision, MalformedPolicy, RetryDecider, RetryPolicy,
};
pub use self::outcome::{Acknowledgement, Disposition};
pub use self::errors::{BrokerError, CodecError, PipelineError, StoreError, SubmitError};
