//! Catalog command types.

use tokio::sync::oneshot;

use flywheel_jobs::JobError;
use flywheel_jobs::job::RunJob;
use flywheel_jobs::job::RunState;
use flywheel_jobs::request::RunRequest;

use crate::models::ModelBasic;
use crate::runlog::LogTail;
use crate::state::JobServiceState;

/// A queued job as reported to clients: its record and queue position.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// The queue position.
    pub position: u64,
    /// The job record.
    pub job: RunJob,
}

/// Commands sent to the catalog actor.
#[derive(Debug)]
pub enum CatalogCommand {
    /// List every known model.
    ListModels {
        /// Channel to send the response back.
        rx: oneshot::Sender<Vec<ModelBasic>>,
    },

    /// Submit a model run.
    SubmitRun {
        /// The run request.
        request: Box<RunRequest>,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<RunState, JobError>>,
    },

    /// Find an active run by owning instance and submission stamp.
    FindActive {
        /// The owning instance name.
        oms: String,
        /// The submission stamp.
        submit: String,
        /// Channel to send the response back.
        rx: oneshot::Sender<Option<RunJob>>,
    },

    /// Find a queued run by owning instance and submission stamp.
    FindQueued {
        /// The owning instance name.
        oms: String,
        /// The submission stamp.
        submit: String,
        /// Channel to send the response back.
        rx: oneshot::Sender<Option<QueuedJob>>,
    },

    /// Move a queued run of this instance to another position.
    MoveInQueue {
        /// The submission stamp.
        submit: String,
        /// The target queue position.
        position: u64,
        /// Channel to send the response back.
        rx: oneshot::Sender<bool>,
    },

    /// Stop a run: cancel it from the queue or signal its process.
    StopRun {
        /// The submission stamp.
        submit: String,
        /// Channel to send the response back.
        rx: oneshot::Sender<bool>,
    },

    /// Read a page of an active run's console log.
    TailLog {
        /// The submission stamp.
        submit: String,
        /// The first line index wanted.
        offset: u64,
        /// The maximum number of lines.
        size: usize,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<LogTail, JobError>>,
    },

    /// Pause or resume this instance's queue.
    PauseQueue {
        /// Whether to pause.
        paused: bool,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<(), JobError>>,
    },

    /// Pause or resume the shared queue for all instances.
    PauseAll {
        /// Whether to pause.
        paused: bool,
        /// Channel to send the response back.
        rx: oneshot::Sender<Result<(), JobError>>,
    },

    /// Read the service-state snapshot.
    ServiceState {
        /// Channel to send the response back.
        rx: oneshot::Sender<JobServiceState>,
    },

    /// Run a scheduler tick now instead of waiting for the timer.
    Refresh {
        /// Channel to send the response back.
        rx: oneshot::Sender<()>,
    },

    /// Stop the actor, closing every model database.
    Shutdown {
        /// Channel to send the response back.
        rx: oneshot::Sender<()>,
    },
}
