//! Message codec: TaskRecord <-> queue payload bytes.
//!
//! Payloads are JSON objects published with a plain-text content type, so any
//! producer that speaks JSON can feed the queue.

use super::errors::CodecError;
use super::task::TaskRecord;

/// Content type attached to every published task message.
pub const CONTENT_TYPE: &str = "text/plain";

pub fn encode(record: &TaskRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

/// Decode a payload. Any shape mismatch is a [`CodecError::Decode`]; retrying
/// such a payload can never succeed.
pub fn decode(payload: &[u8]) -> Result<TaskRecord, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}
