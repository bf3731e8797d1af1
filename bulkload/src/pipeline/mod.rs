//! The upload pipeline.
//!
//! One producer lists the source folder and queues an [`UploadTask`] per file on a bounded
//! channel.  A fixed set of workers takes tasks off the channel and uploads each with a storage
//! client borrowed from a bounded pool.  Progress and error lines go through an
//! [`AsyncLogSink`](crate::log_sink::AsyncLogSink) so neither side ever waits on the terminal.
//!
//! Any upload or listing failure cancels the whole run, as do the optional deadline and the
//! caller's abort future.  Cancellation is cooperative: every component checks for it wherever it
//! would otherwise wait, so the run winds down promptly.
use crate::cancel::{CancelReason, Cancellation};
use crate::enumerate::FileEnumerator;
use crate::log_sink::{AsyncLogSink, LogCollector, LogHandle, LogSinkStats, TracingCollector};
use crate::objstore::{ObjectStorage, ObjectStorageFactory};
use crate::pool::{PoolStats, ResourcePool};
use crate::{channel, BulkLoadError, Config, Result};
use counters::PipelineCounters;
use snafu::{prelude::*, IntoError};
use state::StateTracker;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod counters;
mod producer;
mod state;
mod worker;

pub use crate::task::UploadTask;
pub use state::PipelineState;

/// A trait which callers can implement to get detailed progress updates as the upload run
/// progresses.
///
/// Methods are called from the producer's blocking thread and from the workers' async tasks, so
/// they should return quickly.
#[allow(unused_variables)]
pub trait UploadProgressCallback: Sync + Send {
    /// A file was queued for upload
    fn task_enumerated(&self, source_path: &Path, destination_key: &str) {}

    /// Every file under the source folder has been queued.  Not called if the run is cancelled
    /// first.
    fn enumeration_finished(&self, total: u64) {}

    /// A worker has a client and is about to start uploading a file
    fn upload_started(&self, source_path: &Path, destination_key: &str) {}

    fn upload_completed(&self, source_path: &Path, destination_key: &str, bytes: u64) {}

    /// An upload failed.  The run is cancelled right after this.
    fn upload_failed(&self, source_path: &Path, destination_key: &str, error: &BulkLoadError) {}

    /// An upload was abandoned because the run was cancelled
    fn upload_aborted(&self, source_path: &Path, destination_key: &str) {}

    /// The run was cancelled.  Called at most once.
    fn cancelled(&self, reason: &CancelReason) {}
}

impl<T: UploadProgressCallback + ?Sized> UploadProgressCallback for Arc<T> {
    fn task_enumerated(&self, source_path: &Path, destination_key: &str) {
        (**self).task_enumerated(source_path, destination_key)
    }

    fn enumeration_finished(&self, total: u64) {
        (**self).enumeration_finished(total)
    }

    fn upload_started(&self, source_path: &Path, destination_key: &str) {
        (**self).upload_started(source_path, destination_key)
    }

    fn upload_completed(&self, source_path: &Path, destination_key: &str, bytes: u64) {
        (**self).upload_completed(source_path, destination_key, bytes)
    }

    fn upload_failed(&self, source_path: &Path, destination_key: &str, error: &BulkLoadError) {
        (**self).upload_failed(source_path, destination_key, error)
    }

    fn upload_aborted(&self, source_path: &Path, destination_key: &str) {
        (**self).upload_aborted(source_path, destination_key)
    }

    fn cancelled(&self, reason: &CancelReason) {
        (**self).cancelled(reason)
    }
}

/// State shared by the producer, the workers and the cancellation watcher for one run
struct RunContext<P> {
    cancel: Cancellation,
    counters: PipelineCounters,
    state: StateTracker,
    progress: P,
    log: LogHandle,
}

/// What happened in an upload run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSummary {
    /// Files queued for upload
    pub enumerated: u64,

    /// `false` if the run was cancelled before the whole source folder was listed, in which case
    /// `enumerated` is less than the number of files in it
    pub listing_complete: bool,

    pub completed: u64,
    pub failed: u64,

    /// Files which were queued but never uploaded because the run was cancelled, whether they
    /// were still waiting in the queue or already being uploaded
    pub abandoned: u64,

    pub bytes_uploaded: u64,

    /// Why the run was cancelled, if it was
    pub cancel_reason: Option<CancelReason>,

    pub final_state: PipelineState,
    pub elapsed: Duration,

    /// Client pool accounting at the end of the run
    pub pool: PoolStats,

    /// Progress line accounting
    pub log: LogSinkStats,
}

impl UploadSummary {
    /// `true` if every file was uploaded, or the run was stopped on purpose before any upload
    /// failed
    pub fn succeeded(&self) -> bool {
        self.failed == 0
            && !self
                .cancel_reason
                .as_ref()
                .is_some_and(CancelReason::is_failure)
    }

    /// The process exit code for this outcome: 0 on success, 1 on failure
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for UploadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Enumerated {} files{}: {} completed, {} failed, {} abandoned ({} bytes in {:.1}s); ",
            self.enumerated,
            if self.listing_complete {
                ""
            } else {
                " before listing stopped"
            },
            self.completed,
            self.failed,
            self.abandoned,
            self.bytes_uploaded,
            self.elapsed.as_secs_f64()
        )?;

        match &self.cancel_reason {
            Some(reason) => write!(f, "cancelled: {reason}; ")?,
            None => write!(f, "not cancelled; ")?,
        }

        write!(f, "exit code {}", self.exit_code())
    }
}

/// Sets up an [`UploadJob`]: validates the configuration, checks the source folder and prepares
/// the storage container.
pub struct UploadJobBuilder {
    config: Config,
    storage: Option<Box<dyn ObjectStorage>>,
    log_collector: Arc<dyn LogCollector>,
}

impl UploadJobBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            log_collector: Arc::new(TracingCollector),
        }
    }

    /// Upload into `storage` instead of the S3 storage described by the connection string
    pub fn with_storage(mut self, storage: Box<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Send progress lines to `collector` instead of to `tracing`
    pub fn with_log_collector(mut self, collector: Arc<dyn LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    /// Construct the job (but don't run it yet).
    ///
    /// Creates the storage container if it doesn't already exist.
    pub async fn build(self) -> Result<UploadJob> {
        let Self {
            config,
            storage,
            log_collector,
        } = self;

        config.validate()?;

        let source_folder = config
            .source_folder
            .as_deref()
            .context(crate::error::MissingSourceFolderSnafu)?;
        let enumerator = FileEnumerator::new(source_folder, &config.file_pattern)?;

        let storage = match storage {
            Some(storage) => storage,
            None => ObjectStorageFactory::new(config.clone()).build().await?,
        };

        debug!(container = storage.container(), "Making sure the container exists");
        if storage.create_container_if_not_exists().await? {
            info!(container = storage.container(), "Created container");
        }

        if config.client_pool_size < config.max_concurrent_uploads {
            warn!(
                client_pool_size = config.client_pool_size,
                max_concurrent_uploads = config.max_concurrent_uploads,
                "The client pool is smaller than the number of workers; at most {} uploads will run at once",
                config.client_pool_size
            );
        }

        let pool = {
            let storage = dyn_clone::clone_box(&*storage);
            ResourcePool::new(config.client_pool_size, move || storage.new_client())
        };

        Ok(UploadJob {
            config,
            storage,
            enumerator,
            pool,
            cancel: Cancellation::new(),
            state: StateTracker::new(),
            log_collector,
        })
    }
}

/// A job which uploads every matching file under the source folder.
pub struct UploadJob {
    config: Config,
    storage: Box<dyn ObjectStorage>,
    enumerator: FileEnumerator,
    pool: worker::ClientPool,
    cancel: Cancellation,
    state: StateTracker,
    log_collector: Arc<dyn LogCollector>,
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("root", &self.enumerator.root())
            .field("storage", &self.storage)
            .field("pool", &self.pool)
            .field("state", &self.state.current())
            .finish()
    }
}

impl UploadJob {
    /// The absolute path of the folder files are uploaded from
    pub fn source_root(&self) -> &Path {
        self.enumerator.root()
    }

    pub fn container(&self) -> &str {
        self.storage.container()
    }

    /// The run's cancellation handle.  Triggering it has the same effect as the abort future
    /// passed to [`Self::run`], but with a reason of the caller's choosing.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Watch the pipeline state as the run progresses
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Alternative to [`Self::run`] which doesn't require a [`UploadProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(self, abort: impl Future<Output = ()>) -> Result<UploadSummary> {
        // A dummy impl of UploadProgressCallback that doesn't do anything with any of the
        // progress updates
        struct NoProgress {}
        impl UploadProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning only when every worker and the producer have stopped.
    ///
    /// If the `abort` future completes, the run is cancelled with [`CancelReason::Interrupted`].
    /// Uploads in flight are abandoned and queued uploads are dropped.
    ///
    /// A failed or cancelled run still produces a summary; see [`UploadSummary::exit_code`].  An
    /// error is returned only if the pipeline itself broke down.
    pub async fn run<Abort, Progress>(
        self,
        abort: Abort,
        progress: Progress,
    ) -> Result<UploadSummary>
    where
        Abort: Future<Output = ()>,
        Progress: UploadProgressCallback + 'static,
    {
        let started = Instant::now();
        let Self {
            config,
            storage,
            enumerator,
            pool,
            cancel,
            state,
            log_collector,
        } = self;

        let log_sink = AsyncLogSink::start(config.log_queue_size, log_collector);
        let context = Arc::new(RunContext {
            cancel: cancel.clone(),
            counters: PipelineCounters::default(),
            state: state.clone(),
            progress,
            log: log_sink.handle(),
        });

        state.advance(PipelineState::Running);
        info!(
            root = %enumerator.root().display(),
            container = storage.container(),
            workers = config.max_concurrent_uploads,
            clients = config.client_pool_size,
            "Starting upload run"
        );

        let watcher = tokio::spawn(watch_cancellation(context.clone()));
        let deadline = config
            .max_run_duration()
            .map(|limit| cancel.arm_deadline(limit));

        let (sender, receiver) = channel::bounded(config.max_queue_size, cancel.clone());

        let root = enumerator.root().to_path_buf();
        let producer = producer::spawn(
            enumerator.files(),
            root,
            sender,
            producer::ProducerSettings {
                progress_interval: config.progress_interval as u64,
                simulate_delay: config.simulate_delay,
            },
            context.clone(),
        );
        let workers = (0..config.max_concurrent_uploads)
            .map(|worker_id| {
                worker::spawn(worker_id, receiver.clone(), pool.clone(), context.clone())
            })
            .collect::<Vec<_>>();

        let pipeline = {
            let cancel = cancel.clone();

            async move {
                let workers = async move {
                    let results = futures::future::join_all(workers).await;
                    if results.iter().any(Result::is_err) {
                        // Nobody is reading the queue any more, so the producer must not wait
                        // for room in it
                        cancel.trigger(CancelReason::Interrupted);
                    }

                    results
                };
                let (producer_result, worker_results) = tokio::join!(producer, workers);

                // The producer and every worker have stopped, so whatever is still queued was
                // never started
                let discarded = receiver.discard_queued().await;
                (producer_result, worker_results, discarded as u64)
            }
        };
        tokio::pin!(pipeline);
        tokio::pin!(abort);

        let (producer_result, worker_results, discarded) = tokio::select! {
            results = &mut pipeline => results,
            _ = &mut abort => {
                context.cancel.trigger(CancelReason::Interrupted);
                pipeline.await
            }
        };

        if let Some(deadline) = deadline {
            deadline.abort();
        }

        // Report the first internal failure, but only after the run has been wound down properly
        let mut internal_error = match producer_result {
            Ok(result) => result.err(),
            Err(e) => Some(crate::error::SpawnBlockingSnafu.into_error(e)),
        };
        for result in worker_results {
            if let Err(e) = result {
                internal_error.get_or_insert(crate::error::SpawnSnafu.into_error(e));
            }
        }

        if discarded > 0 {
            debug!(discarded, "Queued tasks dropped by cancellation");
            context.counters.tasks_abandoned(discarded);
        }

        // Read once, so a cancellation arriving right now can't leave the final state and the
        // reason disagreeing
        let cancel_reason = cancel.reason();
        let final_state = if cancel_reason.is_some() {
            watcher.await.context(crate::error::SpawnSnafu)?;
            PipelineState::Terminated
        } else {
            watcher.abort();
            PipelineState::Completed
        };
        state.advance(final_state);

        let counts = context.counters.snapshot();
        if counts.completed + counts.failed + counts.abandoned != counts.enumerated {
            warn!(?counts, "Task counts don't add up; some tasks are unaccounted for");
        }

        let mut summary = UploadSummary {
            enumerated: counts.enumerated,
            listing_complete: counts.listing_finished,
            completed: counts.completed,
            failed: counts.failed,
            abandoned: counts.abandoned,
            bytes_uploaded: counts.bytes_uploaded,
            cancel_reason,
            final_state,
            elapsed: started.elapsed(),
            pool: pool.stats(),
            log: LogSinkStats::default(),
        };
        context.log.log(summary.to_string()).await;
        drop(context);

        summary.log = log_sink.shutdown(config.log_drain_timeout()).await?;
        debug!(?summary, "Upload run finished");

        match internal_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Move the pipeline into `Cancelling` and tell everyone why, as soon as the run is cancelled
async fn watch_cancellation<P: UploadProgressCallback>(context: Arc<RunContext<P>>) {
    context.cancel.cancelled().await;
    context.state.advance(PipelineState::Cancelling);

    if let Some(reason) = context.cancel.reason() {
        context.progress.cancelled(&reason);
        context.log.log(format!("Cancelling upload: {reason}")).await;
    }
}
