//! Asynchronous sink for operator-facing progress and error lines.
//!
//! Producer and workers never write progress output themselves.  They push lines into a bounded
//! queue through a [`LogHandle`], and a single writer task hands them to the [`LogCollector`] in
//! the order they were queued.  A slow terminal therefore never stalls an upload.
//!
//! Delivery is best-effort.  On [`AsyncLogSink::shutdown`] the writer keeps draining the queue
//! until it is empty or the drain timeout passes; anything still queued after that, and anything
//! logged after the sink has stopped, is counted as dropped.
use crate::Result;
use snafu::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Destination for the lines written through an [`AsyncLogSink`].
///
/// Only ever called from the sink's writer task, one line at a time.
pub trait LogCollector: Send + Sync + 'static {
    fn write(&self, message: &str);
}

impl<F> LogCollector for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn write(&self, message: &str) {
        self(message)
    }
}

/// The default collector, which forwards every line to `tracing` at `info` level under the
/// `bulkload::progress` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingCollector;

impl LogCollector for TracingCollector {
    fn write(&self, message: &str) {
        info!(target: "bulkload::progress", "{message}");
    }
}

/// Counts reported when the sink shuts down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogSinkStats {
    pub written: u64,
    pub dropped: u64,
}

/// Cloneable handle for queueing lines
#[derive(Clone, Debug)]
pub struct LogHandle {
    sender: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl LogHandle {
    /// Queue a line, waiting for room if the queue is full.
    ///
    /// The line is dropped if the sink has already stopped.
    pub async fn log(&self, message: impl Into<String>) {
        if self.sender.send(message.into()).await.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct AsyncLogSink {
    handle: LogHandle,
    shutdown: oneshot::Sender<Duration>,
    writer: tokio::task::JoinHandle<u64>,
}

impl AsyncLogSink {
    /// Start the writer task.  Must be called from within a tokio runtime.
    ///
    /// Panics if `capacity` is zero.
    pub fn start(capacity: usize, collector: Arc<dyn LogCollector>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, shutdown_receiver) = oneshot::channel();
        let dropped = Arc::new(AtomicU64::new(0));

        let writer = tokio::spawn(write_loop(
            receiver,
            shutdown_receiver,
            collector,
            dropped.clone(),
        ));

        Self {
            handle: LogHandle { sender, dropped },
            shutdown,
            writer,
        }
    }

    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }

    /// Stop the writer, giving it at most `drain_timeout` to write what is still queued.
    pub async fn shutdown(self, drain_timeout: Duration) -> Result<LogSinkStats> {
        let Self {
            handle,
            shutdown,
            writer,
        } = self;

        // The writer may already be gone if it exited on its own; that's fine
        let _ = shutdown.send(drain_timeout);

        let written = writer.await.context(crate::error::SpawnSnafu)?;

        Ok(LogSinkStats {
            written,
            dropped: handle.dropped.load(Ordering::Relaxed),
        })
    }
}

async fn write_loop(
    mut receiver: mpsc::Receiver<String>,
    mut shutdown: oneshot::Receiver<Duration>,
    collector: Arc<dyn LogCollector>,
    dropped: Arc<AtomicU64>,
) -> u64 {
    let mut written = 0u64;

    let drain_timeout = loop {
        tokio::select! {
            biased;

            timeout = &mut shutdown => {
                // A dropped shutdown sender means the sink itself was dropped without a shutdown
                break timeout.unwrap_or_default();
            }
            message = receiver.recv() => match message {
                Some(message) => {
                    collector.write(&message);
                    written += 1;
                }
                None => {
                    debug!(written, "All log handles dropped; log writer exiting");
                    return written;
                }
            }
        }
    };

    // Refuse new lines, then drain whatever is already queued until the deadline
    receiver.close();
    let deadline = tokio::time::Instant::now() + drain_timeout;

    loop {
        // `recv` is always ready while lines are queued, so the deadline is checked before every
        // write rather than only while waiting
        if tokio::time::Instant::now() >= deadline {
            drop_queued(&mut receiver, &dropped, drain_timeout);
            break;
        }

        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(message)) => {
                collector.write(&message);
                written += 1;
            }
            Ok(None) => break,
            Err(_) => {
                drop_queued(&mut receiver, &dropped, drain_timeout);
                break;
            }
        }
    }

    written
}

fn drop_queued(
    receiver: &mut mpsc::Receiver<String>,
    dropped: &AtomicU64,
    drain_timeout: Duration,
) {
    let mut abandoned = 0u64;
    while receiver.try_recv().is_ok() {
        abandoned += 1;
    }
    dropped.fetch_add(abandoned, Ordering::Relaxed);
    debug!(
        abandoned,
        ?drain_timeout,
        "Log drain timed out; remaining lines dropped"
    );
}
