//! Test helper that implements [`bulkload::UploadProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify behavior or progress reporting
//! functionality.
use bulkload::{BulkLoadError, CancelReason, UploadProgressCallback};
use more_asserts::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not all of these are used in tests but we want to capture all fields for all events
pub(crate) enum UploadProgressEvent {
    TaskEnumerated {
        source_path: PathBuf,
        key: String,
    },

    EnumerationFinished {
        total: u64,
    },

    UploadStarted {
        source_path: PathBuf,
        key: String,
    },

    UploadCompleted {
        source_path: PathBuf,
        key: String,
        bytes: u64,
    },

    UploadFailed {
        source_path: PathBuf,
        key: String,
        error: String,
    },

    UploadAborted {
        source_path: PathBuf,
        key: String,
    },

    Cancelled {
        reason: CancelReason,
    },
}

#[derive(Clone)]
pub(crate) struct TestUploadProgressCallback {
    events: Arc<Mutex<Vec<UploadProgressEvent>>>,
}

impl TestUploadProgressCallback {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Review all updates after a job has run, validating that they are consistent with each
    /// other whether or not the run was cancelled.
    pub fn sanity_check_updates(&self) {
        let enumerated = self.keys(UploadProgressEventDiscriminants::TaskEnumerated);
        let started = self.keys(UploadProgressEventDiscriminants::UploadStarted);
        let completed = self.keys(UploadProgressEventDiscriminants::UploadCompleted);
        let failed = self.keys(UploadProgressEventDiscriminants::UploadFailed);
        let aborted = self.keys(UploadProgressEventDiscriminants::UploadAborted);

        // Every key is queued exactly once
        let unique = enumerated.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), enumerated.len());

        // Nothing is started that wasn't queued, and every start has exactly one outcome
        for key in &started {
            assert!(unique.contains(key), "{key} started but never enumerated");
        }
        let finished = completed.len() + failed.len();
        assert_le!(finished, started.len());
        assert_le!(started.len(), finished + aborted.len());

        // A finished enumeration reports the number of tasks it queued
        if let Some(total) = self.enumeration_finished() {
            assert_eq!(total, enumerated.len() as u64);
        }

        // Any failure cancels the run, and cancellation is reported only once
        let cancellations = self.filter_events(UploadProgressEventDiscriminants::Cancelled);
        assert_le!(cancellations.len(), 1);
        if !failed.is_empty() {
            assert_eq!(1, cancellations.len());
        }
    }

    /// Destination keys of every event of one type, in the order they were reported
    pub fn keys(&self, typ: UploadProgressEventDiscriminants) -> Vec<String> {
        self.filter_events(typ)
            .into_iter()
            .filter_map(|event| match event {
                UploadProgressEvent::TaskEnumerated { key, .. }
                | UploadProgressEvent::UploadStarted { key, .. }
                | UploadProgressEvent::UploadCompleted { key, .. }
                | UploadProgressEvent::UploadFailed { key, .. }
                | UploadProgressEvent::UploadAborted { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Total bytes reported by the upload completed events
    pub fn bytes_completed(&self) -> u64 {
        self.filter_events(UploadProgressEventDiscriminants::UploadCompleted)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::UploadCompleted { bytes, .. } => bytes,
                _ => unreachable!(),
            })
            .sum()
    }

    /// The total from the enumeration finished event, if there was one
    pub fn enumeration_finished(&self) -> Option<u64> {
        let events = self.filter_events(UploadProgressEventDiscriminants::EnumerationFinished);
        assert_le!(events.len(), 1);

        events.into_iter().next().map(|event| match event {
            UploadProgressEvent::EnumerationFinished { total } => total,
            _ => unreachable!(),
        })
    }

    /// The reason given by the cancelled event, if there was one
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.filter_events(UploadProgressEventDiscriminants::Cancelled)
            .into_iter()
            .next()
            .map(|event| match event {
                UploadProgressEvent::Cancelled { reason } => reason,
                _ => unreachable!(),
            })
    }

    /// Iterate over all events of a certain type
    pub fn filter_events(&self, typ: UploadProgressEventDiscriminants) -> Vec<UploadProgressEvent> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter(|event| {
                let event_typ: UploadProgressEventDiscriminants = (*event).into();
                event_typ == typ
            })
            .cloned()
            .collect()
    }

    fn report(&self, event: UploadProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl UploadProgressCallback for TestUploadProgressCallback {
    fn task_enumerated(&self, source_path: &Path, destination_key: &str) {
        self.report(UploadProgressEvent::TaskEnumerated {
            source_path: source_path.to_path_buf(),
            key: destination_key.to_string(),
        });
    }

    fn enumeration_finished(&self, total: u64) {
        self.report(UploadProgressEvent::EnumerationFinished { total });
    }

    fn upload_started(&self, source_path: &Path, destination_key: &str) {
        self.report(UploadProgressEvent::UploadStarted {
            source_path: source_path.to_path_buf(),
            key: destination_key.to_string(),
        });
    }

    fn upload_completed(&self, source_path: &Path, destination_key: &str, bytes: u64) {
        self.report(UploadProgressEvent::UploadCompleted {
            source_path: source_path.to_path_buf(),
            key: destination_key.to_string(),
            bytes,
        });
    }

    fn upload_failed(&self, source_path: &Path, destination_key: &str, error: &BulkLoadError) {
        self.report(UploadProgressEvent::UploadFailed {
            source_path: source_path.to_path_buf(),
            key: destination_key.to_string(),
            error: error.to_string(),
        });
    }

    fn upload_aborted(&self, source_path: &Path, destination_key: &str) {
        self.report(UploadProgressEvent::UploadAborted {
            source_path: source_path.to_path_buf(),
            key: destination_key.to_string(),
        });
    }

    fn cancelled(&self, reason: &CancelReason) {
        self.report(UploadProgressEvent::Cancelled {
            reason: reason.clone(),
        });
    }
}
