//! MPI placement across ready compute hosts and hostfile rendering.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use flywheel_jobs::job::HostUse;
use flywheel_jobs::job::ResourceEnvelope;

use crate::config::HostFileConfig;

/// The host-name substitution token in hostfile line templates.
const HOST_TOKEN: &str = "@-HOST-@";

/// The core-count substitution token in hostfile line templates.
const CORES_TOKEN: &str = "@-CORES-@";

/// A compute host's capacity as observed for one placement decision.
#[derive(Debug, Clone)]
pub struct HostCapacity {
    /// The host name.
    pub name: String,
    /// Total cores.
    pub total_cpu: u32,
    /// Total memory in gigabytes.
    pub total_mem_gb: u32,
    /// Cores already taken by active jobs.
    pub used_cpu: u32,
    /// Memory in gigabytes already taken by active jobs.
    pub used_mem_gb: u32,
}

impl HostCapacity {
    /// Free cores.
    pub fn free_cpu(&self) -> u32 {
        self.total_cpu.saturating_sub(self.used_cpu)
    }

    /// Free memory in gigabytes.
    pub fn free_mem_gb(&self) -> u32 {
        self.total_mem_gb.saturating_sub(self.used_mem_gb)
    }
}

/// Places an MPI job across hosts by drawing cores from each in
/// free-core-descending order until the job's total core count is covered.
///
/// Cores are the only placement constraint; memory is apportioned to each
/// host in proportion to the cores it contributes, for accounting. When
/// `root_host` is given it contributes no worker slots (its rank does no
/// modelling work). Returns `None` without consuming anything when the free
/// cores do not cover the total.
pub fn place_mpi(
    res: &ResourceEnvelope,
    hosts: &[HostCapacity],
    root_host: Option<&str>,
) -> Option<Vec<HostUse>> {
    let need = res.cpu.max(1);

    let mut candidates: Vec<&HostCapacity> = hosts
        .iter()
        .filter(|h| Some(h.name.as_str()) != root_host)
        .collect();
    candidates.sort_by(|a, b| {
        b.free_cpu()
            .cmp(&a.free_cpu())
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut remaining = need;
    let mut given_cpu = 0u32;
    let mut given_mem = 0u32;
    let mut placed = Vec::new();

    for host in candidates {
        if remaining == 0 {
            break;
        }

        let take = remaining.min(host.free_cpu());
        if take == 0 {
            continue;
        }

        // cumulative share keeps the apportioned total exact
        given_cpu += take;
        let mem_so_far = (res.mem_gb as u64 * given_cpu as u64 / need as u64) as u32;

        placed.push(HostUse {
            name: host.name.clone(),
            cpu: take,
            mem_gb: mem_so_far - given_mem,
        });
        given_mem = mem_so_far;
        remaining -= take;
    }

    if remaining > 0 { None } else { Some(placed) }
}

/// Renders a hostfile for one MPI launch.
///
/// Returns `None` when hostfile generation is disabled. The root line is
/// emitted first, then one line per placed host in placement order.
pub fn render_hostfile(
    config: &HostFileConfig,
    root_host: &str,
    placed: &[HostUse],
) -> Option<String> {
    if !config.is_use {
        return None;
    }

    let mut out = String::new();

    if !config.root_line.is_empty() {
        let root_cores = config.cpu_cores.unwrap_or(1);
        out.push_str(
            &config
                .root_line
                .replace(HOST_TOKEN, root_host)
                .replace(CORES_TOKEN, &root_cores.to_string()),
        );
        out.push('\n');
    }

    for host in placed {
        out.push_str(
            &config
                .host_line
                .replace(HOST_TOKEN, &host.name)
                .replace(CORES_TOKEN, &host.cpu.to_string()),
        );
        out.push('\n');
    }

    Some(out)
}

/// Writes the hostfile for a run into the log directory.
pub fn write_hostfile(log_dir: &Path, submit_stamp: &str, content: &str) -> Result<PathBuf> {
    let path = log_dir.join(format!("{submit_stamp}.hostfile.txt"));
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write hostfile `{}`", path.display()))?;
    Ok(path)
}
