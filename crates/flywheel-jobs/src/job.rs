//! Run jobs, resource envelopes, and their lifecycle states.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::request::RunRequest;

/// The terminal status of a model run, as recorded in history file names.
///
/// The serialized tokens are part of the on-disk protocol and must not change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    /// The model process exited with a zero status code.
    Success,
    /// The run was cancelled, either from the queue or by signalling the
    /// process.
    Kill,
    /// The model process exited non-zero, was terminated by a signal, or its
    /// pid vanished.
    Error,
}

impl RunStatus {
    /// Maps a process exit code to a terminal status.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 { Self::Success } else { Self::Error }
    }
}

/// Whether a job spans hosts over MPI or runs on the local host only.
///
/// The serialized tokens appear in control file names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    /// A multi-process run placed across compute hosts.
    Mpi,
    /// A single-host run on the submitting instance.
    Local,
}

/// The lifecycle state of a compute host.
///
/// The serialized tokens appear in `comp-state/` file names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HostState {
    /// The host is powered down or otherwise unavailable.
    Off,
    /// The start script has been invoked and the ready probe is awaited.
    Starting,
    /// The host accepted its ready probe and can take MPI ranks.
    Ready,
    /// At least one active job is placed on the host. A host with remaining
    /// capacity is simultaneously `ready` and `used`; `used` wins in the
    /// state file.
    Used,
    /// The stop script has been invoked.
    Stopping,
    /// The error budget was exhausted; sticky until the operator removes the
    /// host's state file.
    Error,
}

/// The computed resource envelope of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceEnvelope {
    /// Total CPU cores across all processes.
    pub cpu: u32,
    /// Total memory in gigabytes across all processes, rounded up.
    pub mem_gb: u32,
    /// The number of model processes.
    pub process_count: u32,
    /// The number of modelling threads per process.
    pub thread_count: u32,
    /// Memory per process in megabytes.
    pub process_mem_mb: u64,
    /// Memory per thread in megabytes.
    pub thread_mem_mb: u64,
}

impl ResourceEnvelope {
    /// Computes the envelope for a request given the model's per-process and
    /// per-thread memory hints in megabytes.
    pub fn compute(req: &RunRequest, process_mem_mb: u64, thread_mem_mb: u64) -> Self {
        let process_count = req.process_count();
        let thread_count = req.thread_count();

        let total_mb =
            process_count as u64 * (process_mem_mb + thread_mem_mb * thread_count as u64);
        let mem_gb = total_mb.div_ceil(1024) as u32;

        Self {
            cpu: process_count * thread_count,
            mem_gb,
            process_count,
            thread_count,
            process_mem_mb,
            thread_mem_mb,
        }
    }
}

/// A model-run job: the persisted control record behind every queue, active,
/// and history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunJob {
    /// The unique submission stamp; stable across all state transitions.
    pub submit_stamp: String,
    /// The name of the owning server instance.
    pub oms: String,
    /// The model name.
    pub model_name: String,
    /// The model digest.
    pub model_digest: String,
    /// The run stamp of this run attempt.
    pub run_stamp: String,
    /// The process id; zero until the job is promoted to active.
    #[serde(default)]
    pub pid: u32,
    /// The model executable path; empty until promoted.
    #[serde(default)]
    pub exe_path: PathBuf,
    /// The original run request.
    pub request: RunRequest,
    /// The computed resource envelope.
    pub res: ResourceEnvelope,
    /// Whether the job runs over MPI.
    pub is_mpi: bool,
    /// The console log file of the run; always set for active jobs.
    #[serde(default)]
    pub log_path: PathBuf,
    /// A generated ini file path, when table retention is requested.
    #[serde(default)]
    pub ini_path: Option<PathBuf>,
    /// The model binary directory.
    #[serde(default)]
    pub bin_dir: PathBuf,
    /// The working directory for the model process.
    #[serde(default)]
    pub work_dir: PathBuf,
    /// For active MPI jobs, the cores and memory taken from each compute
    /// host. Peers aggregate per-host use by reading these records, so the
    /// single-writer-per-file invariant covers resource accounting too.
    #[serde(default)]
    pub hosts: Vec<HostUse>,
}

/// Resources an MPI job takes from one compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostUse {
    /// The compute host name.
    pub name: String,
    /// Cores taken from the host.
    pub cpu: u32,
    /// Memory taken from the host, in gigabytes.
    pub mem_gb: u32,
}

impl RunJob {
    /// The job kind token used in control file names.
    pub fn kind(&self) -> JobKind {
        if self.is_mpi { JobKind::Mpi } else { JobKind::Local }
    }
}

/// A queued job together with its queue position.
///
/// The ordering key is `(position, submission stamp)`; positions are dense
/// integers that may have gaps after cancellations and reordering.
#[derive(Debug, Clone)]
pub struct QueueJobFile {
    /// The queue position from the file name.
    pub position: u64,
    /// Whether the owning instance's queue is paused.
    pub is_paused: bool,
    /// The job record.
    pub job: RunJob,
    /// The control file backing this entry.
    pub path: PathBuf,
}

impl QueueJobFile {
    /// The ordering key within the queue.
    pub fn order_key(&self) -> (u64, &str) {
        (self.position, &self.job.submit_stamp)
    }
}

/// The initial state returned to a client after a successful submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunState {
    /// The assigned submission stamp.
    pub submit_stamp: String,
    /// The run stamp the model will carry.
    pub run_stamp: String,
    /// The queue position assigned at submit time.
    pub queue_position: u64,
    /// The model digest.
    pub model_digest: String,
    /// The model name.
    pub model_name: String,
}
