//! Outcome model: how a single delivery pass ended.

use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// The acknowledgment sent to the broker for the original delivery.
///
/// `Nack` never requeues: redelivery happens by republishing a new copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Acknowledgement {
    Ack,
    Nack,
}

/// The result of one delivery pass.
///
/// State transitions per lineage:
/// - RECEIVED -> stored -> ACK (terminal)
/// - RECEIVED -> store failed -> requeued -> ACK (new RECEIVED spawned)
/// - RECEIVED -> store failed -> dead-lettered -> NACK (terminal)
/// - RECEIVED -> decode failed -> ACK or NACK per MalformedPolicy (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    Stored { id: TaskId },
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    Malformed { dead_lettered: bool },
}

impl Disposition {
    pub fn acknowledgement(&self) -> Acknowledgement {
        match self {
            Disposition::Stored { .. } | Disposition::Requeued { .. } => Acknowledgement::Ack,
            Disposition::DeadLettered { .. } => Acknowledgement::Nack,
            Disposition::Malformed { dead_lettered } => {
                if *dead_lettered {
                    Acknowledgement::Nack
                } else {
                    Acknowledgement::Ack
                }
            }
        }
    }

    /// Does the lineage end here?
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Requeued { .. })
    }
}
