//! The bounded channel which carries upload tasks from the producer to the workers.
//!
//! This is a thin layer over [`tokio::sync::mpsc`] which adds the two things the upload pipeline
//! needs on top of a plain bounded channel:
//!
//! - Every suspension point races the run's [`Cancellation`], so neither the producer (waiting for
//!   space) nor a worker (waiting for a task) can stay parked after the run is cancelled.
//! - The receiving half can be shared by any number of workers.  Tasks are handed out in the
//!   order the producer sent them.
use crate::cancel::Cancellation;
use crate::Result;
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Create a new channel which holds at most `capacity` items.
///
/// Panics if `capacity` is zero.
pub fn bounded<T>(capacity: usize, cancel: Cancellation) -> (TaskSender<T>, TaskReceiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity);

    (
        TaskSender {
            inner: sender,
            cancel: cancel.clone(),
        },
        TaskReceiver {
            inner: Arc::new(Mutex::new(receiver)),
            cancel,
        },
    )
}

/// The producer's end of the channel.
///
/// Deliberately not `Clone`: there is one producer, and dropping it (or calling
/// [`Self::complete`]) is what tells the workers no more tasks are coming.
#[derive(Debug)]
pub struct TaskSender<T> {
    inner: mpsc::Sender<T>,
    cancel: Cancellation,
}

impl<T> TaskSender<T> {
    /// Enqueue an item, waiting for space if the channel is full.
    ///
    /// Fails with [`crate::BulkLoadError::Aborted`] without enqueuing anything if the run is (or
    /// becomes, while waiting) cancelled, which the producer takes as its signal to stop.
    pub async fn send(&self, item: T) -> Result<()> {
        ensure!(!self.cancel.is_cancelled(), crate::error::AbortedSnafu);

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => crate::error::AbortedSnafu.fail(),
            result = self.inner.send(item) => {
                result.map_err(|_| crate::error::ChannelClosedSnafu.build())
            }
        }
    }

    /// Mark the channel complete.
    ///
    /// Workers still receive whatever is already queued, after which they get
    /// [`Received::EndOfStream`].
    pub fn complete(self) {
        drop(self);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.max_capacity() - self.inner.capacity()
    }
}

/// Outcome of waiting for the next item
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),

    /// The producer completed the channel and every queued item has been handed out
    EndOfStream,

    /// The run was cancelled.  Any items still queued are abandoned.
    Cancelled,
}

/// The workers' end of the channel.  Clones share the same queue.
#[derive(Debug)]
pub struct TaskReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
    cancel: Cancellation,
}

impl<T> Clone for TaskReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> TaskReceiver<T> {
    /// Wait for the next item.
    ///
    /// Once the run is cancelled this never yields another item, even if some are still queued.
    pub async fn recv(&self) -> Received<T> {
        if self.cancel.is_cancelled() {
            return Received::Cancelled;
        }

        // `mpsc::Receiver::recv` is cancel safe, so losing the race below never loses an item
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Received::Cancelled,
            item = async { self.inner.lock().await.recv().await } => match item {
                Some(item) => Received::Item(item),
                None => Received::EndOfStream,
            },
        }
    }

    /// Take every item still queued without handing any of them out, returning how many there
    /// were.
    ///
    /// After a cancellation [`Self::recv`] stops yielding items, so whatever was queued and never
    /// started is only accounted for by calling this once the sender is gone.
    pub async fn discard_queued(&self) -> usize {
        let mut receiver = self.inner.lock().await;
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }

        discarded
    }
}
