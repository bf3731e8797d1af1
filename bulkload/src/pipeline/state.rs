use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of one upload run.
///
/// ```text
/// Idle -> Running -> Draining -> Completed
///            |          |
///            +----------+-> Cancelling -> Terminated
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Built but not started
    Idle,

    /// The producer is listing files and the workers are uploading them
    Running,

    /// Every file has been queued; the workers are uploading what is left in the queue
    Draining,

    /// The run was cancelled.  No new uploads start; in-flight ones finish or abort.
    Cancelling,

    /// Every file was uploaded
    Completed,

    /// The run stopped after being cancelled
    Terminated,
}

impl PipelineState {
    fn can_become(self, next: Self) -> bool {
        use PipelineState::*;

        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Draining)
                | (Running, Cancelling)
                | (Draining, Cancelling)
                | (Draining, Completed)
                | (Cancelling, Terminated)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        };

        f.write_str(name)
    }
}

/// Shared, observable pipeline state.
///
/// Components report transitions as they happen; a transition which isn't valid from the current
/// state is ignored.  That is what makes, for example, a late "enumeration finished" after the run
/// was already cancelled harmless.
#[derive(Clone, Debug)]
pub(crate) struct StateTracker {
    sender: watch::Sender<PipelineState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(PipelineState::Idle);

        Self { sender }
    }

    /// Move to `next` if that is a valid transition from the current state.
    ///
    /// Returns `true` if the state changed.
    pub fn advance(&self, next: PipelineState) -> bool {
        self.sender.send_if_modified(|current| {
            if current.can_become(next) {
                debug!(from = %current, to = %next, "Pipeline state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> PipelineState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.sender.subscribe()
    }
}
