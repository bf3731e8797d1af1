//! End-to-end upload runs against in-memory storage.
//!
//! These exercise the whole pipeline (folder scan, queue, workers, client pool, log sink and
//! cancellation) without any network access.  The S3 storage implementation itself is covered
//! by the unit tests in `objstore`.
use crate::progress::{TestUploadProgressCallback, UploadProgressEventDiscriminants};
use crate::Result;
use assert_matches::assert_matches;
use bulkload::{
    BulkLoadError, CancelReason, Config, ErrorKind, PipelineState, UploadJobBuilder,
    UploadSummary,
};
use bulkload_testing::fixtures::SourceTree;
use bulkload_testing::logging::test_with_logging;
use bulkload_testing::memory::{MemoryStorage, MemoryStorageOptions};
use more_asserts::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Collects the lines written by the run's log sink
#[derive(Clone, Default)]
struct LogLines {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogLines {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl bulkload::LogCollector for LogLines {
    fn write(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

/// Build a job for `config` that uploads into `storage`, then run it to the end
async fn run_job(
    config: Config,
    storage: &MemoryStorage,
    progress: &TestUploadProgressCallback,
    log: &LogLines,
) -> Result<UploadSummary> {
    let job = UploadJobBuilder::new(config)
        .with_storage(Box::new(storage.clone()))
        .with_log_collector(Arc::new(log.clone()))
        .build()
        .await?;

    let summary = job
        .run(futures::future::pending(), progress.clone())
        .await?;
    progress.sanity_check_updates();

    Ok(summary)
}

/// The pool and the storage clients agree that every client was handed back, and no client was
/// ever used for two uploads at once
fn assert_pool_accounting(summary: &UploadSummary, storage: &MemoryStorage, config: &Config) {
    let concurrency = config.client_pool_size.min(config.max_concurrent_uploads);

    assert_eq!(0, summary.pool.leased);
    assert_eq!(summary.pool.acquires, summary.pool.releases);
    assert_le!(summary.pool.created, config.client_pool_size);
    assert_le!(summary.pool.peak_leased, concurrency);

    assert_eq!(summary.pool.created, storage.clients_created());
    assert_eq!(0, storage.concurrent_client_use());
    assert_le!(storage.peak_in_flight(), concurrency);
}

#[test]
fn uploads_tree_with_parent_folder_keys() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_files(
            &[
                "A/file1.wav",
                "A/B/file2.wav",
                "C/file3.wav",
                "C/FILE4.WAV",
                "A/notes.txt",
            ],
            1024,
        )?;
        let storage = MemoryStorage::new("audiofiles");
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        let config = tree.config();
        let summary = run_job(config.clone(), &storage, &progress, &log).await?;

        assert_eq!(
            vec!["A/file1.wav", "B/file2.wav", "C/FILE4.WAV", "C/file3.wav"],
            storage.keys()
        );
        assert_eq!(
            std::fs::read(tree.path().join("A/B/file2.wav"))?,
            storage.object("B/file2.wav").unwrap()
        );

        assert_eq!(4, summary.enumerated);
        assert!(summary.listing_complete);
        assert_eq!(4, summary.completed);
        assert_eq!(0, summary.failed);
        assert_eq!(0, summary.abandoned);
        assert_eq!(4 * 1024, summary.bytes_uploaded);
        assert_eq!(None, summary.cancel_reason);
        assert_eq!(PipelineState::Completed, summary.final_state);
        assert_eq!(0, summary.exit_code());
        assert_pool_accounting(&summary, &storage, &config);

        assert_eq!(Some(4), progress.enumeration_finished());
        assert_eq!(4 * 1024, progress.bytes_completed());
        assert_eq!(None, progress.cancel_reason());

        assert!(log.contains("Enumerated total 4 files"));
        assert!(log.contains("Enumerated 4 files: 4 completed, 0 failed, 0 abandoned"));
        assert_eq!(0, summary.log.dropped);
        assert_eq!(log.lines().len() as u64, summary.log.written);

        Ok(())
    })
}

#[test]
fn uploads_every_file_in_a_large_tree() -> Result<()> {
    test_with_logging(async move {
        const FILES: usize = 500;

        let tree = SourceTree::with_many_files(FILES, 10)?;
        let storage = MemoryStorage::with_options(
            "audiofiles",
            MemoryStorageOptions {
                latency: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        let config = Config {
            max_concurrent_uploads: 8,
            client_pool_size: 4,
            // Small enough that the producer has to wait on the workers
            max_queue_size: 16,
            progress_interval: 100,
            ..tree.config()
        };
        let summary = run_job(config.clone(), &storage, &progress, &log).await?;

        assert_eq!(FILES as u64, summary.enumerated);
        assert_eq!(FILES as u64, summary.completed);
        assert_eq!(FILES, storage.keys().len());
        assert_eq!(FILES as u64, storage.uploads_started());
        assert_eq!(0, summary.exit_code());
        assert_pool_accounting(&summary, &storage, &config);

        for count in [100, 200, 300, 400, 500] {
            assert!(log.contains(&format!("Enumerated {count} files")));
        }

        Ok(())
    })
}

#[test]
fn failed_upload_cancels_the_run() -> Result<()> {
    test_with_logging(async move {
        const FILES: usize = 50;

        let tree = SourceTree::with_many_files(FILES, 5)?;
        let storage = MemoryStorage::with_options(
            "audiofiles",
            MemoryStorageOptions {
                latency: Duration::from_millis(20),
                fail_nth_upload: Some(3),
                ..Default::default()
            },
        );
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        let config = Config {
            max_concurrent_uploads: 4,
            client_pool_size: 4,
            ..tree.config()
        };
        let summary = run_job(config.clone(), &storage, &progress, &log).await?;

        assert_eq!(1, summary.failed);
        assert_lt!(summary.completed, FILES as u64);
        assert_le!(summary.enumerated, FILES as u64);
        assert_eq!(
            summary.enumerated,
            summary.completed + summary.failed + summary.abandoned
        );
        assert_eq!(summary.completed as usize, storage.keys().len());
        assert_matches!(
            summary.cancel_reason,
            Some(CancelReason::TransferFailed { .. })
        );
        assert_eq!(PipelineState::Terminated, summary.final_state);
        assert_eq!(1, summary.exit_code());
        assert_pool_accounting(&summary, &storage, &config);

        let failed = progress.keys(UploadProgressEventDiscriminants::UploadFailed);
        assert_eq!(1, failed.len());
        assert_matches!(
            progress.cancel_reason(),
            Some(CancelReason::TransferFailed { destination_key, .. }) if destination_key == failed[0]
        );

        assert!(log.contains("Failed to upload"));
        assert!(log.contains("injected failure"));
        assert!(log.contains("Cancelling upload: upload of"));
        assert!(log.contains("exit code 1"));

        Ok(())
    })
}

/// Whichever upload fails, the run ends with exactly that one failure and every file that was
/// queued is accounted for as completed, failed or abandoned
#[test]
fn failure_of_any_upload_is_accounted_for() -> Result<()> {
    test_with_logging(async move {
        const FILES: u64 = 12;

        let tree = SourceTree::with_many_files(FILES as usize, 3)?;

        for workers in [1usize, 3] {
            for k in 1..=FILES {
                let storage = MemoryStorage::with_options(
                    "audiofiles",
                    MemoryStorageOptions {
                        latency: Duration::from_millis(5),
                        fail_nth_upload: Some(k),
                        ..Default::default()
                    },
                );
                let progress = TestUploadProgressCallback::new();
                let log = LogLines::default();

                let config = Config {
                    max_concurrent_uploads: workers,
                    client_pool_size: workers,
                    max_queue_size: 4,
                    ..tree.config()
                };
                let summary = run_job(config.clone(), &storage, &progress, &log).await?;
                let context = format!("workers={workers} k={k}: {summary}");

                assert_eq!(1, summary.failed, "{context}");
                assert_eq!(1, summary.exit_code(), "{context}");
                assert_matches!(
                    summary.cancel_reason,
                    Some(CancelReason::TransferFailed { .. }),
                    "{context}"
                );
                assert_eq!(PipelineState::Terminated, summary.final_state, "{context}");
                assert_pool_accounting(&summary, &storage, &config);

                // Each count comes from a different place, so a task lost between the queue and
                // the workers shows up here
                assert_eq!(
                    summary.enumerated,
                    summary.completed + summary.failed + summary.abandoned,
                    "{context}"
                );
                let enumerated = progress.keys(UploadProgressEventDiscriminants::TaskEnumerated);
                let completed = progress.keys(UploadProgressEventDiscriminants::UploadCompleted);
                let aborted = progress.keys(UploadProgressEventDiscriminants::UploadAborted);
                assert_eq!(summary.enumerated as usize, enumerated.len(), "{context}");
                assert_eq!(summary.completed as usize, completed.len(), "{context}");
                assert_eq!(summary.completed as usize, storage.keys().len(), "{context}");
                assert_ge!(summary.abandoned as usize, aborted.len(), "{context}");
                assert_eq!(
                    summary.listing_complete,
                    progress.enumeration_finished().is_some(),
                    "{context}"
                );

                let failure_lines = log
                    .lines()
                    .into_iter()
                    .filter(|line| line.starts_with("Failed to upload"))
                    .count();
                assert_eq!(1, failure_lines, "{context}");
            }
        }

        Ok(())
    })
}

#[test]
fn failure_of_a_specific_key_is_reported() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_files(&["A/file1.wav", "B/file2.wav", "C/file3.wav"], 16)?;
        let storage = MemoryStorage::with_options(
            "audiofiles",
            MemoryStorageOptions {
                fail_keys: ["B/file2.wav".to_string()].into_iter().collect(),
                ..Default::default()
            },
        );
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        // One worker uploads in file name order, so the run stops at B
        let config = Config {
            max_concurrent_uploads: 1,
            client_pool_size: 1,
            ..tree.config()
        };
        let summary = run_job(config, &storage, &progress, &log).await?;

        assert_eq!(vec!["A/file1.wav"], storage.keys());
        assert_eq!(1, summary.completed);
        assert_eq!(1, summary.failed);
        assert_eq!(1, summary.exit_code());
        assert_eq!(
            vec!["B/file2.wav"],
            progress.keys(UploadProgressEventDiscriminants::UploadFailed)
        );
        assert!(log.contains("to 'B/file2.wav': Upload of 'B/file2.wav' was rejected"));

        Ok(())
    })
}

#[test]
fn deadline_stops_a_long_run() -> Result<()> {
    test_with_logging(async move {
        const FILES: usize = 10_000;

        let tree = SourceTree::with_many_files(FILES, 100)?;
        let storage = MemoryStorage::with_options(
            "audiofiles",
            MemoryStorageOptions {
                latency: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        let config = Config {
            seconds_to_run: 1,
            ..tree.config()
        };

        let started = Instant::now();
        let summary = run_job(config.clone(), &storage, &progress, &log).await?;

        // Uploading everything would take well over half an hour
        assert_lt!(started.elapsed(), Duration::from_secs(10));
        assert_lt!(summary.completed, 100);
        assert_eq!(0, summary.failed);
        assert_eq!(
            summary.enumerated,
            summary.completed + summary.abandoned
        );
        assert_eq!(
            Some(CancelReason::DeadlineExceeded {
                limit: Duration::from_secs(1)
            }),
            summary.cancel_reason
        );
        assert_eq!(PipelineState::Terminated, summary.final_state);
        assert_eq!(0, summary.exit_code());
        assert_pool_accounting(&summary, &storage, &config);

        assert!(log.contains("Cancelling upload: maximum run duration of 1s exceeded"));

        Ok(())
    })
}

#[test]
fn abort_future_interrupts_the_run() -> Result<()> {
    test_with_logging(async move {
        const FILES: usize = 200;

        let tree = SourceTree::with_many_files(FILES, 4)?;
        let storage = MemoryStorage::with_options(
            "audiofiles",
            MemoryStorageOptions {
                latency: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let progress = TestUploadProgressCallback::new();

        let config = Config {
            max_concurrent_uploads: 2,
            client_pool_size: 2,
            ..tree.config()
        };
        let job = UploadJobBuilder::new(config.clone())
            .with_storage(Box::new(storage.clone()))
            .build()
            .await?;

        let summary = job
            .run(
                tokio::time::sleep(Duration::from_millis(200)),
                progress.clone(),
            )
            .await?;
        progress.sanity_check_updates();

        assert_lt!(summary.completed, FILES as u64);
        assert_eq!(0, summary.failed);
        assert_eq!(
            summary.enumerated,
            summary.completed + summary.abandoned
        );
        assert_eq!(Some(CancelReason::Interrupted), summary.cancel_reason);
        assert_eq!(Some(CancelReason::Interrupted), progress.cancel_reason());
        assert_eq!(PipelineState::Terminated, summary.final_state);
        assert_eq!(0, summary.exit_code());
        assert_pool_accounting(&summary, &storage, &config);

        // Anything that was in flight when the run was interrupted was abandoned, not failed
        assert_le!(
            storage.uploads_aborted() as usize,
            progress
                .keys(UploadProgressEventDiscriminants::UploadAborted)
                .len()
        );

        Ok(())
    })
}

/// A cancellation can arrive at any point, including while the run is winding down.  Whenever
/// it lands, the summary's final state and cancel reason have to tell the same story.
#[test]
fn late_cancellation_keeps_summary_consistent() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_many_files(6, 2)?;

        for delay_ms in 0..30u64 {
            let storage = MemoryStorage::with_options(
                "audiofiles",
                MemoryStorageOptions {
                    latency: Duration::from_millis(2),
                    ..Default::default()
                },
            );
            let config = Config {
                max_concurrent_uploads: 2,
                client_pool_size: 2,
                ..tree.config()
            };
            let job = UploadJobBuilder::new(config.clone())
                .with_storage(Box::new(storage.clone()))
                .build()
                .await?;

            let cancel = job.cancellation();
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                cancel.trigger(CancelReason::Interrupted);
            });

            let summary = job.run_without_progress(futures::future::pending()).await?;
            canceller.await?;

            match summary.cancel_reason {
                Some(_) => assert_eq!(
                    PipelineState::Terminated,
                    summary.final_state,
                    "delay {delay_ms}ms: {summary}"
                ),
                None => {
                    assert_eq!(
                        PipelineState::Completed,
                        summary.final_state,
                        "delay {delay_ms}ms: {summary}"
                    );
                    assert_eq!(6, summary.completed, "delay {delay_ms}ms: {summary}");
                }
            }
            assert_eq!(0, summary.exit_code());
            assert_eq!(
                summary.enumerated,
                summary.completed + summary.abandoned,
                "delay {delay_ms}ms: {summary}"
            );
            assert_pool_accounting(&summary, &storage, &config);
        }

        Ok(())
    })
}

#[test]
fn cancelling_before_the_run_uploads_nothing() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_many_files(20, 2)?;
        let storage = MemoryStorage::new("audiofiles");

        let job = UploadJobBuilder::new(tree.config())
            .with_storage(Box::new(storage.clone()))
            .build()
            .await?;
        let mut state = job.state();
        assert_eq!(PipelineState::Idle, *state.borrow_and_update());

        job.cancellation().trigger(CancelReason::Interrupted);
        let summary = job.run_without_progress(futures::future::pending()).await?;

        assert_eq!(0, summary.enumerated);
        assert!(!summary.listing_complete);
        assert_eq!(0, summary.completed);
        assert_eq!(0, storage.uploads_started());
        assert_eq!(PipelineState::Terminated, summary.final_state);
        assert_eq!(PipelineState::Terminated, *state.borrow());
        assert_eq!(0, summary.exit_code());

        Ok(())
    })
}

#[test]
fn empty_folder_completes() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_files(&["A/readme.txt"], 8)?;
        let storage = MemoryStorage::new("audiofiles");
        let progress = TestUploadProgressCallback::new();
        let log = LogLines::default();

        let summary = run_job(tree.config(), &storage, &progress, &log).await?;

        assert_eq!(0, summary.enumerated);
        assert_eq!(PipelineState::Completed, summary.final_state);
        assert_eq!(0, summary.exit_code());
        assert_eq!(Some(0), progress.enumeration_finished());
        assert!(storage.keys().is_empty());
        assert!(log.contains("Enumerated total 0 files"));

        Ok(())
    })
}

#[test]
fn container_is_created_when_missing() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::with_files(&["A/file1.wav"], 8)?;

        let storage = MemoryStorage::new("fresh");
        let job = UploadJobBuilder::new(tree.config())
            .with_storage(Box::new(storage.clone()))
            .build()
            .await?;
        assert_eq!("fresh", job.container());
        assert!(storage.container_created());

        let existing = MemoryStorage::with_options(
            "existing",
            MemoryStorageOptions {
                container_exists: true,
                ..Default::default()
            },
        );
        UploadJobBuilder::new(tree.config())
            .with_storage(Box::new(existing.clone()))
            .build()
            .await?;
        assert!(!existing.container_created());

        Ok(())
    })
}

#[test]
fn invalid_setup_is_rejected_before_anything_runs() -> Result<()> {
    test_with_logging(async move {
        let tree = SourceTree::new()?;
        let storage = MemoryStorage::new("audiofiles");

        let config = Config {
            source_folder: Some(tree.path().join("does-not-exist")),
            ..tree.config()
        };
        let err = UploadJobBuilder::new(config)
            .with_storage(Box::new(storage.clone()))
            .build()
            .await
            .unwrap_err();
        assert_matches!(err, BulkLoadError::SourceFolderNotFound { .. });
        assert_eq!(ErrorKind::Configuration, err.kind());

        let config = Config {
            connection_string: None,
            ..tree.config()
        };
        let result = UploadJobBuilder::new(config)
            .with_storage(Box::new(storage.clone()))
            .build()
            .await;
        assert_matches!(result, Err(BulkLoadError::MissingConnectionString));

        // Nothing is touched in storage until the setup is known to be good
        assert!(!storage.container_created());

        Ok(())
    })
}
