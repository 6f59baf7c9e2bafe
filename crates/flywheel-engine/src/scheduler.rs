//! Scheduling policy: scan digestion, leader election, and fair job
//! selection.
//!
//! Every cooperating instance runs the same tick over the shared rendezvous
//! tree. Decisions here are pure functions over one scan, so the policy is
//! testable without processes or timers; the catalog actor owns the side
//! effects.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use flywheel_jobs::files;
use flywheel_jobs::files::CompStateFile;
use flywheel_jobs::files::ControlFile;
use flywheel_jobs::files::ControlKind;
use flywheel_jobs::files::JobDir;
use flywheel_jobs::job::HostState;
use flywheel_jobs::job::HostUse;
use flywheel_jobs::job::JobKind;
use flywheel_jobs::job::ResourceEnvelope;
use flywheel_jobs::job::RunJob;
use flywheel_jobs::stamp;

use crate::placement::HostCapacity;
use crate::placement::place_mpi;

/// A heartbeat older than this belongs to a dead instance.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(65);

/// One scan of the rendezvous tree.
#[derive(Debug, Default)]
pub struct Scan {
    /// All queued jobs, sorted by `(position, submission stamp)`.
    pub queued: Vec<ControlFile>,
    /// All active jobs.
    pub active: Vec<ControlFile>,
    /// All finished jobs still in `history/`.
    pub history: Vec<ControlFile>,
    /// All compute-host state files.
    pub comp: Vec<CompStateFile>,
    /// Instance heartbeats as `(name, age)`.
    pub heartbeats: Vec<(String, Duration)>,
    /// Instances whose queue is paused.
    pub paused: HashSet<String>,
    /// Whether the shared queue is paused for everyone.
    pub all_paused: bool,
}

impl Scan {
    /// Reads one consistent-enough snapshot of the rendezvous tree.
    pub fn read(dir: &JobDir) -> flywheel_jobs::Result<Self> {
        let mut queued = files::list_control_files(&dir.queue())?;
        queued.sort_by(|a, b| {
            let pos = |f: &ControlFile| match f.kind {
                ControlKind::Queue { position } => position,
                _ => u64::MAX,
            };
            pos(a)
                .cmp(&pos(b))
                .then_with(|| a.submit_stamp.cmp(&b.submit_stamp))
        });

        Ok(Self {
            queued,
            active: files::list_control_files(&dir.active())?,
            history: files::list_control_files(&dir.history())?,
            comp: files::list_comp_state(dir)?,
            heartbeats: files::list_heartbeats(dir)?,
            paused: files::list_paused(dir)?.into_iter().collect(),
            all_paused: files::is_all_paused(dir),
        })
    }

    /// The next free queue position: one past the highest in use.
    pub fn next_queue_position(&self) -> u64 {
        self.queued
            .iter()
            .filter_map(|f| match f.kind {
                ControlKind::Queue { position } => Some(position),
                _ => None,
            })
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    /// The observed state of each compute host, from `comp-state/` names.
    ///
    /// With multiple files for one host (a publish race) `ready` wins, since
    /// it is the one written by the host itself.
    pub fn observed_hosts(&self) -> HashMap<String, HostState> {
        let mut out: HashMap<String, HostState> = HashMap::new();
        for file in &self.comp {
            out.entry(file.host.clone())
                .and_modify(|state| {
                    if file.state == HostState::Ready {
                        *state = HostState::Ready;
                    }
                })
                .or_insert(file.state);
        }
        out
    }

    /// Capacity of every host currently advertising a ready file.
    ///
    /// Totals come from the file name, so followers need no fleet state.
    pub fn ready_hosts(&self, used: &HashMap<String, (u32, u32)>) -> Vec<HostCapacity> {
        self.comp
            .iter()
            .filter(|f| f.state == HostState::Ready)
            .map(|f| {
                let (used_cpu, used_mem_gb) = used.get(&f.host).copied().unwrap_or((0, 0));
                HostCapacity {
                    name: f.host.clone(),
                    total_cpu: f.cpu,
                    total_mem_gb: f.mem_gb,
                    used_cpu,
                    used_mem_gb,
                }
            })
            .collect()
    }
}

/// Elects the leader: the lexicographically-first live instance.
pub fn elect_leader(heartbeats: &[(String, Duration)], ttl: Duration) -> Option<String> {
    heartbeats
        .iter()
        .filter(|(_, age)| *age < ttl)
        .map(|(name, _)| name.clone())
        .min()
}

/// Aggregates per-host MPI use from active job records.
///
/// Each owning instance wrote its own records, so reading them is the only
/// cross-instance accounting needed.
pub fn aggregate_host_use<'a>(
    active_jobs: impl IntoIterator<Item = &'a RunJob>,
) -> HashMap<String, (u32, u32)> {
    let mut out: HashMap<String, (u32, u32)> = HashMap::new();

    for job in active_jobs {
        for host in &job.hosts {
            let entry = out.entry(host.name.clone()).or_default();
            entry.0 += host.cpu;
            entry.1 += host.mem_gb;
        }
    }

    out
}

/// The body facts selection needs for an own MPI job.
#[derive(Debug, Clone)]
pub struct OwnMpiFacts {
    /// The resource envelope.
    pub res: ResourceEnvelope,
    /// Whether worker ranks may land on the root host.
    pub mpi_on_root: bool,
}

/// Jobs this instance should launch now.
#[derive(Debug, Default)]
pub struct Selection {
    /// Non-MPI jobs, in queue order.
    pub local: Vec<ControlFile>,
    /// MPI jobs with their placements, in queue order.
    pub mpi: Vec<(ControlFile, Vec<HostUse>)>,
}

/// Selects launchable jobs in `(position, submission stamp)` order.
///
/// The MPI and non-MPI pools are independent classes. Within a class the
/// first job that does not fit blocks everything behind it, so a big job can
/// never starve behind a stream of small ones. Jobs of paused instances are
/// skipped without blocking. Peer jobs that fit consume capacity here on the
/// assumption their owner selects them the same way.
pub fn select_jobs(
    scan: &Scan,
    oms: &str,
    root_host: Option<&str>,
    mut local_free_cpu: u32,
    mut local_free_mem_gb: u32,
    hosts: &mut Vec<HostCapacity>,
    own_mpi_facts: &dyn Fn(&ControlFile) -> Option<OwnMpiFacts>,
) -> Selection {
    let mut selection = Selection::default();

    if scan.all_paused {
        return selection;
    }

    let mut local_blocked = false;
    let mut mpi_blocked = false;
    let mut agg_cpu: u32 = hosts.iter().map(HostCapacity::free_cpu).sum();
    let mut agg_mem: u32 = hosts.iter().map(HostCapacity::free_mem_gb).sum();

    for file in &scan.queued {
        if scan.paused.contains(&file.oms) {
            continue;
        }

        match file.job_kind {
            JobKind::Local => {
                if local_blocked {
                    continue;
                }

                if file.cpu <= local_free_cpu && file.mem_gb <= local_free_mem_gb {
                    local_free_cpu -= file.cpu;
                    local_free_mem_gb -= file.mem_gb;
                    if file.oms == oms {
                        selection.local.push(file.clone());
                    }
                } else {
                    local_blocked = true;
                }
            }
            JobKind::Mpi => {
                if mpi_blocked {
                    continue;
                }

                if file.oms == oms {
                    // an unreadable body blocks the class rather than let a
                    // later job skip ahead
                    let Some(facts) = own_mpi_facts(file) else {
                        mpi_blocked = true;
                        continue;
                    };

                    let root = if facts.mpi_on_root { None } else { root_host };
                    match place_mpi(&facts.res, hosts, root) {
                        Some(placed) => {
                            for taken in &placed {
                                if let Some(host) =
                                    hosts.iter_mut().find(|h| h.name == taken.name)
                                {
                                    host.used_cpu += taken.cpu;
                                    host.used_mem_gb += taken.mem_gb;
                                }
                            }
                            agg_cpu = agg_cpu.saturating_sub(file.cpu);
                            agg_mem = agg_mem.saturating_sub(file.mem_gb);
                            selection.mpi.push((file.clone(), placed));
                        }
                        None => mpi_blocked = true,
                    }
                } else if file.cpu <= agg_cpu && file.mem_gb <= agg_mem {
                    agg_cpu -= file.cpu;
                    agg_mem -= file.mem_gb;
                } else {
                    mpi_blocked = true;
                }
            }
        }
    }

    selection
}

/// Queued MPI demand not covered by free ready capacity, as `(cpu, mem_gb)`.
///
/// The leader starts compute hosts to cover this deficit.
pub fn mpi_deficit(scan: &Scan, hosts: &[HostCapacity]) -> (u32, u32) {
    let mut demand_cpu = 0u32;
    let mut demand_mem = 0u32;

    for file in &scan.queued {
        if file.job_kind == JobKind::Mpi && !scan.paused.contains(&file.oms) {
            demand_cpu += file.cpu;
            demand_mem += file.mem_gb;
        }
    }

    let free_cpu: u32 = hosts.iter().map(HostCapacity::free_cpu).sum();
    let free_mem: u32 = hosts.iter().map(HostCapacity::free_mem_gb).sum();

    (
        demand_cpu.saturating_sub(free_cpu),
        demand_mem.saturating_sub(free_mem),
    )
}

/// History files of this instance old enough to shelve into `past/YYYY_MM/`.
pub fn shelvable<'a>(
    history: &'a [ControlFile],
    oms: &str,
    keep_days: u32,
    now_ms: i64,
) -> Vec<&'a ControlFile> {
    let cutoff_ms = now_ms - keep_days as i64 * 24 * 3600 * 1000;

    history
        .iter()
        .filter(|f| f.oms == oms)
        .filter(|f| {
            stamp::to_millis(&f.submit_stamp).is_some_and(|ms| ms < cutoff_ms)
        })
        .collect()
}
