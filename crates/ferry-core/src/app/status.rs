//! Status - パイプラインの処理件数

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::{Disposition, PipelineError};

/// Snapshot of what a pipeline has done since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub received: u64,
    pub stored: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
    /// Passes that ended in a [`PipelineError`].
    pub errors: u64,
}

/// Lock-free counters shared between the run loop and its handle.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    received: AtomicU64,
    stored: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
    errors: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, result: &Result<Disposition, PipelineError>) {
        let counter = match result {
            Ok(Disposition::Stored { .. }) => &self.stored,
            Ok(Disposition::Requeued { .. }) => &self.requeued,
            Ok(Disposition::DeadLettered { .. }) => &self.dead_lettered,
            Ok(Disposition::Malformed { .. }) => &self.malformed,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
