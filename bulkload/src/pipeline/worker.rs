use super::{RunContext, UploadProgressCallback};
use crate::cancel::CancelReason;
use crate::channel::{Received, TaskReceiver};
use crate::error::error_chain;
use crate::objstore::{SourceFile, StorageClient};
use crate::pool::ResourcePool;
use crate::task::UploadTask;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, Instrument};

pub(super) type ClientPool = ResourcePool<Box<dyn StorageClient>>;

/// Start one upload worker.
///
/// The worker takes tasks off the channel one at a time until the channel is drained, the run is
/// cancelled, or one of its uploads fails (which cancels the run).  It never retries an upload.
pub(super) fn spawn<P>(
    worker_id: usize,
    receiver: TaskReceiver<UploadTask>,
    pool: ClientPool,
    context: Arc<RunContext<P>>,
) -> JoinHandle<()>
where
    P: UploadProgressCallback + 'static,
{
    tokio::spawn(
        async move {
            loop {
                let task = match receiver.recv().await {
                    Received::Item(task) => task,
                    Received::EndOfStream => {
                        debug!("Task queue drained; worker exiting");
                        break;
                    }
                    Received::Cancelled => {
                        debug!("Run cancelled; worker exiting");
                        break;
                    }
                };

                if !upload(&task, &pool, &context).await {
                    break;
                }
            }
        }
        .instrument(debug_span!("worker", worker_id)),
    )
}

/// Upload one file with a client borrowed from the pool.
///
/// Returns `false` if the worker should stop taking tasks.
async fn upload<P: UploadProgressCallback>(
    task: &UploadTask,
    pool: &ClientPool,
    context: &RunContext<P>,
) -> bool {
    let source_path = task.source_path();
    let key = task.destination_key();

    // The lease lives only as long as this block, so the client goes back to the pool whatever
    // the outcome
    let result = async {
        let client = pool.acquire(&context.cancel).await?;

        context.progress.upload_started(source_path, key);
        let source = SourceFile::open(source_path).await?;

        client.upload(key, source, context.cancel.token()).await
    }
    .await;

    match result {
        Ok(bytes) => {
            debug!(key, bytes, "Uploaded file");
            context.counters.task_completed(bytes);
            context.progress.upload_completed(source_path, key, bytes);

            true
        }
        Err(e) if e.is_aborted() => {
            debug!(key, "Upload aborted by cancellation");
            context.counters.tasks_abandoned(1);
            context.progress.upload_aborted(source_path, key);

            false
        }
        Err(e) => {
            debug!(key, error = ?e, "Upload failed");
            context.counters.task_failed();
            context
                .log
                .log(format!(
                    "Failed to upload '{}' to '{key}': {}",
                    source_path.display(),
                    error_chain(&e)
                ))
                .await;
            context.progress.upload_failed(source_path, key, &e);

            context.cancel.trigger(CancelReason::TransferFailed {
                source_path: source_path.to_path_buf(),
                destination_key: key.to_string(),
            });

            false
        }
    }
}
