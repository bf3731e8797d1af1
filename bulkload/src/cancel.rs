//! The cancellation coordinator shared by every component of an upload run.
//!
//! There is exactly one [`Cancellation`] per run.  It is created by the job and handed (by clone)
//! to the producer, the workers, the resource pool and the deadline timer; there is no ambient
//! global state, so independent runs (and tests) never interfere with each other.
//!
//! The first call to [`Cancellation::trigger`] wins: it records why the run is being cancelled
//! and fires the underlying [`CancellationToken`].  Every later call is a no-op, so triggering
//! twice is indistinguishable from triggering once.
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

/// Why an upload run was cancelled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The operator asked for the run to stop (Ctrl-C, or the caller's abort future completed)
    Interrupted,

    /// The configured maximum run duration elapsed
    DeadlineExceeded { limit: Duration },

    /// Listing the source folder failed
    EnumerationFailed { root: PathBuf, message: String },

    /// An upload failed
    TransferFailed {
        source_path: PathBuf,
        destination_key: String,
    },
}

impl CancelReason {
    /// `true` for the reasons that mean the run failed, as opposed to being stopped on purpose
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::EnumerationFailed { .. } | Self::TransferFailed { .. }
        )
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(f, "interrupted"),
            Self::DeadlineExceeded { limit } => {
                write!(f, "maximum run duration of {}s exceeded", limit.as_secs())
            }
            Self::EnumerationFailed { root, message } => {
                write!(f, "listing '{}' failed: {message}", root.display())
            }
            Self::TransferFailed {
                source_path,
                destination_key,
            } => write!(
                f,
                "upload of '{}' to '{destination_key}' failed",
                source_path.display()
            ),
        }
    }
}

/// Cheaply cloneable handle to the run's cancellation state
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceCell<CancelReason>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the run.
    ///
    /// Returns `true` if this call is the one that cancelled the run, `false` if it was already
    /// cancelled, in which case the first reason is kept.
    pub fn trigger(&self, reason: CancelReason) -> bool {
        let mut won = false;
        self.reason.get_or_init(|| {
            won = true;
            reason.clone()
        });

        if won {
            info!(%reason, "Cancelling upload run");
        } else {
            debug!(%reason, "Upload run is already cancelled; ignoring additional trigger");
        }

        // Cancel unconditionally, so a caller that observes `reason()` also observes the token as
        // cancelled once this returns
        self.token.cancel();

        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason given by the trigger that cancelled the run, if it has been cancelled
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    /// Future which completes when the run is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The raw token, for passing to transports that understand [`CancellationToken`]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Start the deadline timer.
    ///
    /// After `limit` elapses the run is cancelled with [`CancelReason::DeadlineExceeded`].  The
    /// timer task exits early if the run is cancelled for any other reason first.  The caller
    /// should abort the returned handle when the run finishes normally.
    pub fn arm_deadline(&self, limit: Duration) -> tokio::task::JoinHandle<()> {
        let me = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = me.cancelled() => {
                    debug!("Run cancelled before the deadline; deadline timer exiting");
                }
                _ = tokio::time::sleep(limit) => {
                    me.trigger(CancelReason::DeadlineExceeded { limit });
                }
            }
        })
    }
}
