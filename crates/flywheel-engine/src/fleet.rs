//! Compute fleet: the per-host lifecycle state machine and its start/stop
//! helpers.
//!
//! Hosts move `off -> starting -> ready <-> used -> stopping -> off`. The
//! `ready` probe is the host's state file written by the site's start script;
//! this module only observes it. `error` is sticky until the operator removes
//! the host's state file. Helper scripts are never killed on deadline; an
//! exceeded deadline charges the host's error budget instead.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use flywheel_jobs::job::HostState;
use flywheel_jobs::stamp;

use crate::config::ComputeServerConfig;
use crate::placement::HostCapacity;

/// Which helper script a [`HostEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperAction {
    /// The start script.
    Start,
    /// The stop script.
    Stop,
}

/// An event from a fleet helper process.
#[derive(Debug)]
pub enum HostEvent {
    /// A helper script exited.
    HelperExited {
        /// The compute host name.
        host: String,
        /// Which script exited.
        action: HelperAction,
        /// Whether the script exited with a zero status code.
        ok: bool,
    },
}

/// A fleet decision to be executed this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetAction {
    /// Invoke the host's start script.
    Start {
        /// The compute host name.
        host: String,
    },
    /// Invoke the host's stop script.
    Stop {
        /// The compute host name.
        host: String,
    },
}

/// One tracked compute host.
#[derive(Debug)]
struct Host {
    /// The static host configuration.
    config: ComputeServerConfig,
    /// The current lifecycle state.
    state: HostState,
    /// When the current state was entered.
    entered: Instant,
    /// When the host last went unused while ready; drives idle stops.
    idle_since: Option<Instant>,
    /// Consecutive start/stop failures.
    errors: u32,
}

/// The compute fleet state machine.
///
/// Driven by the leader instance only; followers keep a fleet but never call
/// [`Fleet::tick`].
#[derive(Debug)]
pub struct Fleet {
    /// Tracked hosts in configuration order.
    hosts: BTreeMap<String, Host>,
    /// Start-script deadline.
    max_start: Duration,
    /// Stop-script deadline.
    max_stop: Duration,
    /// Ready-and-unused interval before a host is stopped.
    max_idle: Duration,
    /// Consecutive failures before the sticky `error` state.
    max_errors: u32,
    /// Stamp of the last start action, for the service-state snapshot.
    last_start_stamp: Option<String>,
    /// Stamp of the last stop action, for the service-state snapshot.
    last_stop_stamp: Option<String>,
}

impl Fleet {
    /// Builds a fleet from configuration.
    pub fn new(
        hosts: &[ComputeServerConfig],
        max_start: Duration,
        max_stop: Duration,
        max_idle: Duration,
        max_errors: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            hosts: hosts
                .iter()
                .map(|config| {
                    (
                        config.name.clone(),
                        Host {
                            config: config.clone(),
                            state: HostState::Off,
                            entered: now,
                            idle_since: None,
                            errors: 0,
                        },
                    )
                })
                .collect(),
            max_start,
            max_stop,
            max_idle,
            max_errors,
            last_start_stamp: None,
            last_stop_stamp: None,
        }
    }

    /// The current state of one host, if tracked.
    pub fn state_of(&self, host: &str) -> Option<HostState> {
        self.hosts.get(host).map(|h| h.state)
    }

    /// Stamp of the last start action.
    pub fn last_start_stamp(&self) -> Option<&str> {
        self.last_start_stamp.as_deref()
    }

    /// Stamp of the last stop action.
    pub fn last_stop_stamp(&self) -> Option<&str> {
        self.last_stop_stamp.as_deref()
    }

    /// Total cores across hosts not in the `error` state.
    pub fn total_cpu(&self) -> u32 {
        self.hosts
            .values()
            .filter(|h| h.state != HostState::Error)
            .map(|h| h.config.cpu)
            .sum()
    }

    /// Total memory in gigabytes across hosts not in the `error` state.
    pub fn total_mem_gb(&self) -> u32 {
        self.hosts
            .values()
            .filter(|h| h.state != HostState::Error)
            .map(|h| h.config.mem_gb)
            .sum()
    }

    /// Capacity view of hosts that can take MPI ranks right now.
    ///
    /// `used` maps host name to `(cpu, mem_gb)` aggregated from active job
    /// records.
    pub fn ready_capacities(&self, used: &HashMap<String, (u32, u32)>) -> Vec<HostCapacity> {
        self.hosts
            .values()
            .filter(|h| matches!(h.state, HostState::Ready | HostState::Used))
            .map(|h| {
                let (used_cpu, used_mem_gb) = used.get(&h.config.name).copied().unwrap_or((0, 0));
                HostCapacity {
                    name: h.config.name.clone(),
                    total_cpu: h.config.cpu,
                    total_mem_gb: h.config.mem_gb,
                    used_cpu,
                    used_mem_gb,
                }
            })
            .collect()
    }

    /// Host states the leader publishes to `comp-state/`.
    ///
    /// Ready files come from start scripts and `used` is derived from active
    /// job records, so only `starting`, `stopping`, and `error` are ours to
    /// write.
    pub fn publishable(&self) -> Vec<(String, HostState, u32, u32)> {
        self.hosts
            .values()
            .filter(|h| {
                matches!(
                    h.state,
                    HostState::Starting | HostState::Stopping | HostState::Error
                )
            })
            .map(|h| (h.config.name.clone(), h.state, h.config.cpu, h.config.mem_gb))
            .collect()
    }

    /// Folds one tick of observations and deadlines into the state machine
    /// and decides start/stop actions.
    ///
    /// `observed` is the host-to-state map read from `comp-state/` file
    /// names; `used` the per-host use aggregated from active jobs;
    /// `deficit_cpu`/`deficit_mem_gb` the queued MPI demand not covered by
    /// ready capacity.
    pub fn tick(
        &mut self,
        observed: &HashMap<String, HostState>,
        used: &HashMap<String, (u32, u32)>,
        deficit_cpu: u32,
        deficit_mem_gb: u32,
        now: Instant,
    ) -> Vec<FleetAction> {
        let mut actions = Vec::new();

        for host in self.hosts.values_mut() {
            host.fold_observation(
                observed.get(&host.config.name).copied(),
                used.get(&host.config.name).copied().unwrap_or((0, 0)),
                self.max_start,
                self.max_stop,
                self.max_errors,
                now,
            );

            // idle ready hosts past the idle deadline are stopped
            if host.state == HostState::Ready
                && host.config.stop_exe.is_some()
                && host
                    .idle_since
                    .is_some_and(|since| now.duration_since(since) >= self.max_idle)
            {
                host.enter(HostState::Stopping, now);
                self.last_stop_stamp = Some(stamp::now_stamp());
                actions.push(FleetAction::Stop {
                    host: host.config.name.clone(),
                });
            }
        }

        // cover the capacity deficit with off hosts, in name order
        let mut need_cpu = deficit_cpu;
        let mut need_mem = deficit_mem_gb;
        if need_cpu > 0 || need_mem > 0 {
            for host in self.hosts.values_mut() {
                if need_cpu == 0 && need_mem == 0 {
                    break;
                }

                if host.state != HostState::Off || host.config.start_exe.is_none() {
                    continue;
                }

                host.enter(HostState::Starting, now);
                self.last_start_stamp = Some(stamp::now_stamp());
                actions.push(FleetAction::Start {
                    host: host.config.name.clone(),
                });
                need_cpu = need_cpu.saturating_sub(host.config.cpu);
                need_mem = need_mem.saturating_sub(host.config.mem_gb);
            }
        }

        actions
    }

    /// Folds a helper exit into the state machine.
    pub fn helper_exited(&mut self, host: &str, action: HelperAction, ok: bool, now: Instant) {
        let Some(host) = self.hosts.get_mut(host) else {
            return;
        };

        match (action, ok) {
            // the ready probe, not the script's exit, completes a start
            (HelperAction::Start, true) => {}
            (HelperAction::Stop, true) => {
                if host.state == HostState::Stopping {
                    host.enter(HostState::Off, now);
                }
            }
            (_, false) => {
                warn!(host = %host.config.name, ?action, "fleet helper failed");
                host.charge_error(self.max_errors, now);
            }
        }
    }

    /// Spawns the helper script for an action; its exit is reported on
    /// `events`.
    ///
    /// The helper is detached on purpose: deadlines are enforced by the state
    /// machine, never by killing the script.
    pub fn launch_helper(&self, action: &FleetAction, events: mpsc::Sender<HostEvent>) {
        let (name, helper_action) = match action {
            FleetAction::Start { host } => (host, HelperAction::Start),
            FleetAction::Stop { host } => (host, HelperAction::Stop),
        };

        let Some(host) = self.hosts.get(name) else {
            return;
        };

        let (exe, args) = match helper_action {
            HelperAction::Start => (host.config.start_exe.clone(), host.config.start_args.clone()),
            HelperAction::Stop => (host.config.stop_exe.clone(), host.config.stop_args.clone()),
        };

        let Some(exe) = exe else {
            return;
        };

        info!(host = %name, ?helper_action, exe = %exe.display(), "invoking fleet helper");
        tokio::spawn(run_helper(name.clone(), exe, args, helper_action, events));
    }
}

impl Host {
    /// Enters a new state.
    fn enter(&mut self, state: HostState, now: Instant) {
        if self.state != state {
            info!(host = %self.config.name, from = %self.state, to = %state, "host state change");
        }
        self.state = state;
        self.entered = now;
        if state != HostState::Ready {
            self.idle_since = None;
        }
    }

    /// Folds the observed state file and usage into this host.
    fn fold_observation(
        &mut self,
        observed: Option<HostState>,
        used: (u32, u32),
        max_start: Duration,
        max_stop: Duration,
        max_errors: u32,
        now: Instant,
    ) {
        let in_use = used.0 > 0 || used.1 > 0;

        match self.state {
            HostState::Error => {
                // sticky until the operator removes the state file
                if observed.is_none() {
                    info!(host = %self.config.name, "error state cleared by operator");
                    self.errors = 0;
                    self.enter(HostState::Off, now);
                }
            }
            HostState::Starting => {
                if observed == Some(HostState::Ready) {
                    self.errors = 0;
                    self.enter(HostState::Ready, now);
                    self.idle_since = Some(now);
                } else if now.duration_since(self.entered) >= max_start {
                    warn!(host = %self.config.name, "host start deadline exceeded");
                    self.charge_error(max_errors, now);
                }
            }
            HostState::Stopping => {
                if observed.is_none() || observed == Some(HostState::Off) {
                    self.enter(HostState::Off, now);
                } else if now.duration_since(self.entered) >= max_stop {
                    warn!(host = %self.config.name, "host stop deadline exceeded");
                    self.charge_error(max_errors, now);
                }
            }
            HostState::Off => {
                // a host may come up outside our control
                if observed == Some(HostState::Ready) {
                    self.enter(HostState::Ready, now);
                    self.idle_since = Some(now);
                }
            }
            HostState::Ready | HostState::Used => {
                if observed != Some(HostState::Ready) {
                    // the ready file vanished underneath us
                    self.enter(HostState::Off, now);
                } else if in_use {
                    self.enter(HostState::Used, now);
                } else if self.state == HostState::Used {
                    self.enter(HostState::Ready, now);
                    self.idle_since = Some(now);
                } else if self.idle_since.is_none() {
                    self.idle_since = Some(now);
                }
            }
        }
    }

    /// Charges one error; past the budget the host goes sticky `error`.
    fn charge_error(&mut self, max_errors: u32, now: Instant) {
        self.errors += 1;
        if self.errors >= max_errors {
            warn!(
                host = %self.config.name,
                errors = self.errors,
                "error budget exhausted, host out of rotation"
            );
            self.enter(HostState::Error, now);
        } else {
            self.enter(HostState::Off, now);
        }
    }
}

/// Runs one helper script to completion and reports its exit.
async fn run_helper(
    host: String,
    exe: PathBuf,
    args: Vec<String>,
    action: HelperAction,
    events: mpsc::Sender<HostEvent>,
) {
    let ok = match Command::new(&exe).args(&args).status().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(%host, exe = %exe.display(), error = %e, "fleet helper failed to start");
            false
        }
    };

    let _ = events.send(HostEvent::HelperExited { host, action, ok }).await;
}
