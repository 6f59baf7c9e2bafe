//! Observability snapshot of the job service.

use serde::Deserialize;
use serde::Serialize;

/// CPU and memory figures for one resource pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolFigures {
    /// Total cores in the pool.
    pub cpu: u32,
    /// Total memory in gigabytes in the pool.
    pub mem_gb: u32,
    /// Cores taken by active jobs.
    pub active_cpu: u32,
    /// Memory in gigabytes taken by active jobs.
    pub active_mem_gb: u32,
    /// Cores requested by queued jobs.
    pub queued_cpu: u32,
    /// Memory in gigabytes requested by queued jobs.
    pub queued_mem_gb: u32,
}

/// A point-in-time snapshot of scheduling state.
///
/// Derived from the same scans the scheduler acts on; observational only and
/// never fed back into decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobServiceState {
    /// Whether this instance's queue is paused.
    pub is_queue_paused: bool,
    /// Whether the shared queue is paused for all instances.
    pub is_all_queue_paused: bool,
    /// MPI figures across all cooperating instances.
    pub mpi_total: PoolFigures,
    /// MPI figures for jobs owned by this instance.
    pub mpi_own: PoolFigures,
    /// Non-MPI figures for this host.
    pub local: PoolFigures,
    /// Upper bound on modelling threads per MPI process; zero is unlimited.
    pub mpi_max_threads: u32,
    /// Whether this instance currently leads fleet decisions.
    pub is_leader: bool,
    /// Stamp of the last compute-host start action, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start_stamp: Option<String>,
    /// Stamp of the last compute-host stop action, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop_stamp: Option<String>,
}
