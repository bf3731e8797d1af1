//! The producer side of the pipeline: lists the source folder and queues an upload task for
//! each file.
//!
//! Directory listing is blocking I/O, so the producer runs on a blocking thread and enters the
//! runtime with [`Handle::block_on`] only to wait for room in the task channel.
use super::{RunContext, UploadProgressCallback};
use crate::cancel::CancelReason;
use crate::channel::TaskSender;
use crate::error::error_chain;
use crate::task::UploadTask;
use crate::Result;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info_span};

#[derive(Clone, Copy, Debug)]
pub(super) struct ProducerSettings {
    /// Log a progress line every this many files
    pub progress_interval: u64,

    /// Pause a random while at every progress line
    pub simulate_delay: bool,
}

/// Start the producer on a blocking thread.
///
/// The task resolves once every file has been queued, or the run is cancelled, or the listing
/// failed (which cancels the run).  Only an internal failure is reported as an error.
pub(super) fn spawn<I, P>(
    files: I,
    root: PathBuf,
    sender: TaskSender<UploadTask>,
    settings: ProducerSettings,
    context: Arc<RunContext<P>>,
) -> JoinHandle<Result<()>>
where
    I: Iterator<Item = Result<PathBuf>> + Send + 'static,
    P: UploadProgressCallback + 'static,
{
    let handle = Handle::current();
    let span = info_span!("producer", root = %root.display());

    tokio::task::spawn_blocking(move || {
        let _guard = span.enter();

        produce(files, &root, sender, settings, &context, &handle)
    })
}

fn produce<I, P>(
    files: I,
    root: &Path,
    sender: TaskSender<UploadTask>,
    settings: ProducerSettings,
    context: &RunContext<P>,
    handle: &Handle,
) -> Result<()>
where
    I: Iterator<Item = Result<PathBuf>>,
    P: UploadProgressCallback,
{
    debug!("Listing files to upload");

    for entry in files {
        if context.cancel.is_cancelled() {
            debug!("Run cancelled; no more files will be queued");
            return Ok(());
        }

        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                let message = error_chain(&e);
                debug!(error = ?e, "Listing the source folder failed");

                handle.block_on(context.log.log(format!("Failed to list files: {message}")));
                context.cancel.trigger(CancelReason::EnumerationFailed {
                    root: root.to_path_buf(),
                    message,
                });

                return Ok(());
            }
        };

        let task = UploadTask::new(path);
        match handle.block_on(sender.send(task.clone())) {
            Ok(()) => {}
            Err(e) if e.is_aborted() => {
                debug!("Run cancelled while waiting for room in the queue");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let enumerated = context.counters.task_enumerated();
        context
            .progress
            .task_enumerated(task.source_path(), task.destination_key());

        if enumerated % settings.progress_interval == 0 {
            handle.block_on(context.log.log(format!("Enumerated {enumerated} files")));

            if settings.simulate_delay {
                let pause = Duration::from_millis(rand::thread_rng().gen_range(100..=1000));

                handle.block_on(async {
                    tokio::select! {
                        _ = context.cancel.cancelled() => {},
                        _ = tokio::time::sleep(pause) => {},
                    }
                });
            }
        }
    }

    context.counters.listing_finished();
    let total = context.counters.snapshot().enumerated;
    debug!(total, "Finished listing files");

    context.state.advance(super::PipelineState::Draining);
    sender.complete();

    context.progress.enumeration_finished(total);
    handle.block_on(context.log.log(format!("Enumerated total {total} files")));

    Ok(())
}
