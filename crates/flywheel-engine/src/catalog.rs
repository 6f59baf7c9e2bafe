//! The run catalog: a single owner actor over the queue, the active runs,
//! and the model catalog.
//!
//! All scheduling state is owned by one task; clients talk to it through
//! [`Catalog`], which sends commands over a channel and awaits oneshot
//! replies. No lock is ever held across I/O.

pub mod actor;
pub mod commands;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use flywheel_jobs::JobError;
use flywheel_jobs::job::RunJob;
use flywheel_jobs::job::RunState;
use flywheel_jobs::request::RunRequest;

use crate::models::ModelBasic;
use crate::runlog::LogTail;
use crate::state::JobServiceState;

pub use commands::CatalogCommand;
pub use commands::QueuedJob;

/// A cheap cloneable client handle to the catalog actor.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// The command channel into the actor.
    tx: mpsc::Sender<CatalogCommand>,
}

impl Catalog {
    /// Wraps a command channel.
    pub(crate) fn new(tx: mpsc::Sender<CatalogCommand>) -> Self {
        Self { tx }
    }

    /// Sends one command and awaits its reply.
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CatalogCommand,
    ) -> Result<T, JobError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| JobError::Transient("the job service is shutting down".into()))?;
        rx.await
            .map_err(|_| JobError::Transient("the job service dropped the request".into()))
    }

    /// Lists every known model.
    pub async fn list_models(&self) -> Result<Vec<ModelBasic>, JobError> {
        self.call(|rx| CatalogCommand::ListModels { rx }).await
    }

    /// Submits a model run; returns its initial state.
    pub async fn submit_run(&self, request: RunRequest) -> Result<RunState, JobError> {
        self.call(|rx| CatalogCommand::SubmitRun {
            request: Box::new(request),
            rx,
        })
        .await?
    }

    /// Finds an active run by owning instance and submission stamp.
    ///
    /// Stamps are unique only per instance, so the lookup is keyed by both.
    pub async fn find_active(&self, oms: &str, submit: &str) -> Result<Option<RunJob>, JobError> {
        self.call(|rx| CatalogCommand::FindActive {
            oms: oms.to_string(),
            submit: submit.to_string(),
            rx,
        })
        .await
    }

    /// Finds a queued run by owning instance and submission stamp.
    ///
    /// Stamps are unique only per instance, so the lookup is keyed by both.
    pub async fn find_queued(
        &self,
        oms: &str,
        submit: &str,
    ) -> Result<Option<QueuedJob>, JobError> {
        self.call(|rx| CatalogCommand::FindQueued {
            oms: oms.to_string(),
            submit: submit.to_string(),
            rx,
        })
        .await
    }

    /// Moves one of this instance's queued runs to another position.
    ///
    /// `position` is the zero-padded value in the queue file name, not an
    /// index. Moving onto a value another file already carries is allowed;
    /// the scheduler breaks the tie by submission stamp, exactly as it would
    /// after a hand rename.
    ///
    /// Returns `false` when the stamp is unknown or the job already left the
    /// queue.
    pub async fn move_in_queue(&self, submit: &str, position: u64) -> Result<bool, JobError> {
        self.call(|rx| CatalogCommand::MoveInQueue {
            submit: submit.to_string(),
            position,
            rx,
        })
        .await
    }

    /// Stops a run. Idempotent; returns `false` for unknown stamps.
    pub async fn stop_run(&self, submit: &str) -> Result<bool, JobError> {
        self.call(|rx| CatalogCommand::StopRun {
            submit: submit.to_string(),
            rx,
        })
        .await
    }

    /// Reads a page of an active run's console log.
    pub async fn tail_log(
        &self,
        submit: &str,
        offset: u64,
        size: usize,
    ) -> Result<LogTail, JobError> {
        self.call(|rx| CatalogCommand::TailLog {
            submit: submit.to_string(),
            offset,
            size,
            rx,
        })
        .await?
    }

    /// Pauses or resumes this instance's queue.
    pub async fn pause_queue(&self, paused: bool) -> Result<(), JobError> {
        self.call(|rx| CatalogCommand::PauseQueue { paused, rx })
            .await?
    }

    /// Pauses or resumes the shared queue for all instances.
    pub async fn pause_all(&self, paused: bool) -> Result<(), JobError> {
        self.call(|rx| CatalogCommand::PauseAll { paused, rx })
            .await?
    }

    /// Reads the service-state snapshot.
    pub async fn service_state(&self) -> Result<JobServiceState, JobError> {
        self.call(|rx| CatalogCommand::ServiceState { rx }).await
    }

    /// Runs a scheduler tick now and waits for it to finish.
    pub async fn refresh(&self) -> Result<(), JobError> {
        self.call(|rx| CatalogCommand::Refresh { rx }).await
    }

    /// Stops the job service.
    pub async fn shutdown(&self) -> Result<(), JobError> {
        self.call(|rx| CatalogCommand::Shutdown { rx }).await
    }
}
