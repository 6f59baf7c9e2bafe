//! Error types shared across the job-control crates.

use std::io;

/// A convenience alias for results produced by job-control operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// Behavioral error kinds for job-control operations.
///
/// The variants deliberately describe behavior rather than origin: callers
/// branch on whether a failure is the client's fault (`NotFound`,
/// `BadArgument`, `Rejected`), retryable (`Transient`), or terminal to a run
/// or a compute host.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// An unknown model digest, submission stamp, or host name.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invalid request: forbidden option keys, malformed template, or an
    /// impossible resource envelope. Produces no side effects.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The request was valid but cannot be accepted right now: the queue is
    /// paused, storage is over quota, or the job can never fit.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A retryable condition: a rename race, lock contention, or a partially
    /// written file. Handled internally up to a small retry bound.
    #[error("transient: {0}")]
    Transient(String),

    /// A control file name that does not follow the rendezvous grammar.
    #[error("malformed control file name `{0}`")]
    BadFileName(String),

    /// An underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A JSON encode or decode failure on a control file body.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// Returns `true` if the error is worth retrying internally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
