use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Running totals for an upload run.
///
/// Only the producer bumps `enumerated`, and only workers bump the others.  The counters are
/// independent, so a reader may briefly see `completed + failed + abandoned` lag behind the
/// number of tasks that have actually finished.  Once every worker has stopped they add up to
/// `enumerated`.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    enumerated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    bytes_uploaded: AtomicU64,
    listing_finished: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CountersSnapshot {
    pub enumerated: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub bytes_uploaded: u64,
    pub listing_finished: bool,
}

impl PipelineCounters {
    /// Returns the new total
    pub fn task_enumerated(&self) -> u64 {
        self.enumerated.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn task_completed(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` queued or in-flight tasks were given up on because the run was cancelled
    pub fn tasks_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    /// The producer walked the whole source folder
    pub fn listing_finished(&self) {
        self.listing_finished.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            enumerated: self.enumerated.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            listing_finished: self.listing_finished.load(Ordering::Relaxed),
        }
    }
}
