//! Catalog actor implementation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use flywheel_jobs::JobError;
use flywheel_jobs::files;
use flywheel_jobs::files::ControlFile;
use flywheel_jobs::files::ControlKind;
use flywheel_jobs::files::JobDir;
use flywheel_jobs::job::HostState;
use flywheel_jobs::job::HostUse;
use flywheel_jobs::job::JobKind;
use flywheel_jobs::job::ResourceEnvelope;
use flywheel_jobs::job::RunJob;
use flywheel_jobs::job::RunState;
use flywheel_jobs::job::RunStatus;
use flywheel_jobs::request::RunRequest;
use flywheel_jobs::stamp;

use crate::catalog::Catalog;
use crate::catalog::commands::CatalogCommand;
use crate::catalog::commands::QueuedJob;
use crate::config::Config;
use crate::diskuse;
use crate::diskuse::DiskWatch;
use crate::fleet::Fleet;
use crate::fleet::HostEvent;
use crate::launch;
use crate::launch::LaunchSpec;
use crate::launch::RunEvent;
use crate::launch::RunHandle;
use crate::launch::pid_alive;
use crate::models::ModelCatalog;
use crate::placement;
use crate::runlog::LogTail;
use crate::runlog::RunLog;
use crate::scheduler;
use crate::scheduler::HEARTBEAT_TTL;
use crate::scheduler::OwnMpiFacts;
use crate::scheduler::Scan;
use crate::state::JobServiceState;
use crate::state::PoolFigures;
use crate::template;

/// Channel buffer size for catalog commands.
const CHANNEL_BUFFER_SIZE: usize = 200;

/// Channel buffer size for run and host events.
const EVENT_BUFFER_SIZE: usize = 1024;

/// A run this instance launched and supervises.
#[derive(Debug)]
struct ActiveRun {
    /// The job record, as written into the active control file.
    job: RunJob,
    /// The process handle.
    handle: RunHandle,
    /// The active control file path.
    active_path: PathBuf,
    /// When the process was spawned; drives the elapsed-seconds token.
    started: Instant,
}

/// The catalog actor: sole owner of all scheduling state.
pub struct CatalogActor {
    /// Server configuration.
    config: Config,
    /// This instance's name.
    oms: String,
    /// This server's host name; the MPI root host.
    host_name: String,
    /// The rendezvous tree.
    job_dir: JobDir,
    /// The model catalog.
    models: ModelCatalog,
    /// The compute fleet state machine; acted on only while leading.
    fleet: Fleet,
    /// The disk-use watchdog, when configured.
    disk: Option<DiskWatch>,
    /// Cores available to non-MPI runs on this host.
    local_total_cpu: u32,
    /// Memory in gigabytes available to non-MPI runs on this host.
    local_total_mem_gb: u32,
    /// Console rings by submission stamp.
    rings: HashMap<String, RunLog>,
    /// Runs this instance supervises, by submission stamp.
    running: HashMap<String, ActiveRun>,
    /// Decoded control-file bodies by path.
    bodies: HashMap<PathBuf, RunJob>,
    /// Paths whose body failed to decode; flagged, never deleted.
    corrupt: HashSet<PathBuf>,
    /// The last service-state snapshot.
    snapshot: JobServiceState,
    /// Command receiver.
    rx: mpsc::Receiver<CatalogCommand>,
    /// Run event sender, cloned into every spawned run.
    run_events_tx: mpsc::Sender<RunEvent>,
    /// Run event receiver.
    run_events_rx: mpsc::Receiver<RunEvent>,
    /// Host event sender, cloned into every fleet helper.
    host_events_tx: mpsc::Sender<HostEvent>,
    /// Host event receiver.
    host_events_rx: mpsc::Receiver<HostEvent>,
    /// Shutdown signal.
    shutdown: CancellationToken,
}

/// Validates the environment and spawns the catalog actor.
///
/// Creates missing rendezvous subdirectories, dry-renders every launch
/// template, and discovers models before the first tick.
pub async fn spawn_catalog(
    config: Config,
    shutdown: CancellationToken,
) -> Result<(Catalog, JoinHandle<()>)> {
    config.validate()?;

    let oms = config.instance_name();
    let job_dir = JobDir::new(config.job_dir());
    job_dir
        .ensure()
        .with_context(|| format!("failed to prepare job directory `{}`", job_dir.root().display()))?;
    std::fs::create_dir_all(config.log_dir())
        .with_context(|| format!("failed to create log directory `{}`", config.log_dir().display()))?;

    template::validate_all(&config.etc_dir())?;

    let models = ModelCatalog::discover(&config.model_dir(), &oms).await?;

    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (run_events_tx, run_events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
    let (host_events_tx, host_events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);

    let system = sysinfo::System::new_all();
    let local_total_cpu = config.local_cpu.unwrap_or(system.cpus().len() as u32);
    let local_total_mem_gb = config
        .local_mem_gb
        .unwrap_or((system.total_memory() / (1024 * 1024 * 1024)).max(1) as u32);

    let fleet = Fleet::new(
        &config.compute,
        Duration::from_secs(config.max_start_time),
        Duration::from_secs(config.max_stop_time),
        Duration::from_secs(config.max_idle_time),
        config.max_compute_errors,
    );
    let disk = DiskWatch::new(config.disk_use.as_ref(), vec![config.files_dir()]);
    let host_name = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());

    let actor = CatalogActor {
        config,
        oms,
        host_name,
        job_dir,
        models,
        fleet,
        disk,
        local_total_cpu,
        local_total_mem_gb,
        rings: HashMap::new(),
        running: HashMap::new(),
        bodies: HashMap::new(),
        corrupt: HashSet::new(),
        snapshot: JobServiceState::default(),
        rx,
        run_events_tx,
        run_events_rx,
        host_events_tx,
        host_events_rx,
        shutdown,
    };

    let handle = tokio::spawn(actor.run());
    Ok((Catalog::new(tx), handle))
}

impl CatalogActor {
    /// Runs the actor event loop until shutdown.
    async fn run(mut self) {
        info!(oms = %self.oms, "job service started");

        let mut ticker = tokio::time::interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                event = self.run_events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_run_event(event).await;
                    }
                }
                event = self.host_events_rx.recv() => {
                    if let Some(HostEvent::HelperExited { host, action, ok }) = event {
                        self.fleet.helper_exited(&host, action, ok, Instant::now());
                    }
                }
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.models.close_all().await;
        info!(oms = %self.oms, "job service stopped");
    }

    /// Dispatches one command; returns `true` on shutdown.
    async fn handle_command(&mut self, command: CatalogCommand) -> bool {
        match command {
            CatalogCommand::ListModels { rx } => {
                let _ = rx.send(self.models.list());
            }
            CatalogCommand::SubmitRun { request, rx } => {
                debug!(digest = %request.model_digest, "received `SubmitRun` command");
                let _ = rx.send(self.handle_submit(*request));
            }
            CatalogCommand::FindActive { oms, submit, rx } => {
                let _ = rx.send(self.find_active(&oms, &submit));
            }
            CatalogCommand::FindQueued { oms, submit, rx } => {
                let _ = rx.send(self.find_queued(&oms, &submit));
            }
            CatalogCommand::MoveInQueue { submit, position, rx } => {
                debug!(%submit, position, "received `MoveInQueue` command");
                let _ = rx.send(self.move_in_queue(&submit, position));
            }
            CatalogCommand::StopRun { submit, rx } => {
                debug!(%submit, "received `StopRun` command");
                let _ = rx.send(self.stop_run(&submit));
            }
            CatalogCommand::TailLog { submit, offset, size, rx } => {
                let _ = rx.send(self.tail_log(&submit, offset, size));
            }
            CatalogCommand::PauseQueue { paused, rx } => {
                info!(paused, "pausing own queue");
                let _ = rx.send(files::set_paused(&self.job_dir, &self.oms, paused));
            }
            CatalogCommand::PauseAll { paused, rx } => {
                info!(paused, "pausing the shared queue");
                let _ = rx.send(files::set_all_paused(&self.job_dir, paused));
            }
            CatalogCommand::ServiceState { rx } => {
                let _ = rx.send(self.snapshot.clone());
            }
            CatalogCommand::Refresh { rx } => {
                self.tick().await;
                let _ = rx.send(());
            }
            CatalogCommand::Shutdown { rx } => {
                info!("job service shutting down");
                let _ = rx.send(());
                return true;
            }
        }

        false
    }

    /// One scheduler tick: scan, reconcile, lead the fleet, select, launch,
    /// and shelve.
    async fn tick(&mut self) {
        if let Err(e) = files::beat(&self.job_dir, &self.oms) {
            warn!(error = %e, "failed to write heartbeat");
        }

        let scan = match Scan::read(&self.job_dir) {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "failed to scan the job directory");
                return;
            }
        };

        self.refresh_bodies(&scan);
        self.demote_stale_active(&scan).await;

        let active_paths: HashSet<&PathBuf> = scan.active.iter().map(|f| &f.path).collect();
        let host_used = scheduler::aggregate_host_use(
            self.bodies
                .iter()
                .filter(|(path, _)| active_paths.contains(path))
                .map(|(_, job)| job),
        );

        let leader = scheduler::elect_leader(&scan.heartbeats, HEARTBEAT_TTL);
        let is_leader = leader.as_deref() == Some(self.oms.as_str());

        if let Some(disk) = &mut self.disk {
            disk.maybe_scan(Instant::now());
        }

        if is_leader {
            self.lead_fleet(&scan, &host_used);
        }

        let local_used_cpu: u32 = scan
            .active
            .iter()
            .filter(|f| f.job_kind == JobKind::Local)
            .map(|f| f.cpu)
            .sum();
        let local_used_mem: u32 = scan
            .active
            .iter()
            .filter(|f| f.job_kind == JobKind::Local)
            .map(|f| f.mem_gb)
            .sum();

        let mut hosts = scan.ready_hosts(&host_used);
        let bodies = &self.bodies;
        let facts = |file: &ControlFile| -> Option<OwnMpiFacts> {
            bodies.get(&file.path).map(|job| OwnMpiFacts {
                res: job.res,
                mpi_on_root: job.request.mpi_on_root,
            })
        };

        let selection = scheduler::select_jobs(
            &scan,
            &self.oms,
            Some(self.host_name.as_str()),
            self.local_total_cpu.saturating_sub(local_used_cpu),
            self.local_total_mem_gb.saturating_sub(local_used_mem),
            &mut hosts,
            &facts,
        );

        for file in &selection.local {
            self.launch_job(file, Vec::new()).await;
        }
        for (file, placed) in &selection.mpi {
            self.launch_job(file, placed.clone()).await;
        }

        let now_ms = stamp::to_millis(&stamp::now_stamp()).unwrap_or(0);
        for file in scheduler::shelvable(&scan.history, &self.oms, self.config.job_past, now_ms) {
            if let Err(e) = files::shelve(&self.job_dir, file) {
                warn!(path = %file.path.display(), error = %e, "failed to shelve history file");
            }
        }

        let idle = Duration::from_secs(self.config.run_log_idle_sec);
        let running = &self.running;
        self.rings
            .retain(|submit, ring| running.contains_key(submit) || !ring.is_idle(idle));

        self.snapshot = self.build_snapshot(&scan, is_leader);
    }

    /// Leader-only fleet work: drive the state machine, publish state files,
    /// and invoke helpers.
    fn lead_fleet(&mut self, scan: &Scan, host_used: &HashMap<String, (u32, u32)>) {
        let observed = scan.observed_hosts();
        let ready = scan.ready_hosts(host_used);
        let (deficit_cpu, deficit_mem) = scheduler::mpi_deficit(scan, &ready);

        let actions = self
            .fleet
            .tick(&observed, host_used, deficit_cpu, deficit_mem, Instant::now());

        for (host, state, cpu, mem_gb) in self.fleet.publishable() {
            if let Err(e) = files::publish_comp_state(&self.job_dir, &host, state, cpu, mem_gb) {
                warn!(%host, error = %e, "failed to publish host state");
            }
        }

        // retract our transitional files once a host settles back to off;
        // error files stay for the operator, ready files belong to the host
        for (host, state) in &observed {
            if matches!(state, HostState::Starting | HostState::Stopping)
                && self.fleet.state_of(host) == Some(HostState::Off)
                && let Err(e) = files::clear_comp_state(&self.job_dir, host)
            {
                warn!(%host, error = %e, "failed to clear host state file");
            }
        }

        for action in &actions {
            self.fleet.launch_helper(action, self.host_events_tx.clone());
        }
    }

    /// Keeps the body cache aligned with one scan: drops vanished paths and
    /// decodes bodies this tick needs.
    fn refresh_bodies(&mut self, scan: &Scan) {
        let listed: HashSet<&PathBuf> = scan
            .queued
            .iter()
            .chain(scan.active.iter())
            .map(|f| &f.path)
            .collect();
        self.bodies.retain(|path, _| listed.contains(path));
        self.corrupt.retain(|path| path.exists());

        // active bodies carry host use; own queued bodies feed selection
        let wanted: Vec<ControlFile> = scan
            .active
            .iter()
            .chain(scan.queued.iter().filter(|f| f.oms == self.oms))
            .cloned()
            .collect();
        for file in &wanted {
            let _ = self.body_of(file);
        }
    }

    /// Looks a control file's body up, reading and caching it on first use.
    ///
    /// Returns `None` for files still within the write grace period and for
    /// bodies flagged corrupt.
    fn body_of(&mut self, file: &ControlFile) -> Option<RunJob> {
        if let Some(job) = self.bodies.get(&file.path) {
            return Some(job.clone());
        }
        if self.corrupt.contains(&file.path) {
            return None;
        }

        match files::read_json::<RunJob>(&file.path, files::WRITE_GRACE) {
            Ok(Some(job)) => {
                self.bodies.insert(file.path.clone(), job.clone());
                Some(job)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "control file body is corrupt");
                self.corrupt.insert(file.path.clone());
                None
            }
        }
    }

    /// Demotes active files whose process is gone to history with `error`.
    ///
    /// Covers own files orphaned by a previous incarnation and files of
    /// instances whose heartbeat went stale, pid-checked on this host.
    async fn demote_stale_active(&mut self, scan: &Scan) {
        let live: HashSet<&str> = scan
            .heartbeats
            .iter()
            .filter(|(_, age)| *age < HEARTBEAT_TTL)
            .map(|(name, _)| name.as_str())
            .collect();

        for file in &scan.active {
            if self.running.contains_key(&file.submit_stamp) {
                continue;
            }

            let owned = file.oms == self.oms;
            if !owned && live.contains(file.oms.as_str()) {
                continue;
            }

            let Some(job) = self.body_of(file) else {
                continue;
            };
            if job.pid != 0 && pid_alive(job.pid) {
                continue;
            }

            let now_ms = stamp::to_millis(&stamp::now_stamp()).unwrap_or(0);
            let seconds = stamp::to_millis(&job.submit_stamp)
                .map(|start| (now_ms - start).max(0) as u64 / 1000)
                .unwrap_or(0);

            warn!(
                submit = %file.submit_stamp,
                oms = %file.oms,
                pid = job.pid,
                "demoting active run with a dead process"
            );

            self.bodies.remove(&file.path);
            match files::complete(&self.job_dir, &file.path, &job, seconds, RunStatus::Error) {
                Ok(_) => self.record_run_status(&job, RunStatus::Error).await,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "failed to demote active run")
                }
            }
        }
    }

    /// Launches one selected queue file.
    async fn launch_job(&mut self, file: &ControlFile, placed: Vec<HostUse>) {
        let Some(mut job) = self.body_of(file) else {
            return;
        };

        let Some(basic) = self
            .models
            .by_digest(&job.model_digest)
            .map(|entry| entry.basic.clone())
        else {
            warn!(submit = %job.submit_stamp, digest = %job.model_digest, "model vanished, failing run");
            self.fail_queued(&file.path, &job).await;
            return;
        };

        let log_dir = self.config.log_dir();
        job.log_path = log_dir.join(format!(
            "{model}.{run}.console.log",
            model = job.model_name,
            run = job.run_stamp,
        ));
        job.bin_dir = basic.bin_dir.clone();
        if job.work_dir.as_os_str().is_empty() {
            job.work_dir = basic.bin_dir.clone();
        }
        job.hosts = placed.clone();

        job.ini_path =
            match launch::write_retain_ini(&log_dir, &job.submit_stamp, &job.request.tables) {
                Ok(path) => path,
                Err(e) => {
                    warn!(submit = %job.submit_stamp, error = %e, "failed to write run ini");
                    self.fail_queued(&file.path, &job).await;
                    return;
                }
            };

        let notes = match launch::write_run_notes(&log_dir, &job.run_stamp, &job.request.run_notes)
        {
            Ok(notes) => notes,
            Err(e) => {
                warn!(submit = %job.submit_stamp, error = %e, "failed to write run notes");
                self.fail_queued(&file.path, &job).await;
                return;
            }
        };

        let argv = launch::model_argv(&job.request, &job.run_stamp, job.ini_path.as_deref(), &notes);

        let (exe, args) = if job.is_mpi {
            if let Some(host_file) = &self.config.host_file
                && let Some(content) = placement::render_hostfile(host_file, &self.host_name, &placed)
                && let Err(e) = placement::write_hostfile(&log_dir, &job.submit_stamp, &content)
            {
                warn!(submit = %job.submit_stamp, error = %e, "failed to write hostfile");
                self.fail_queued(&file.path, &job).await;
                return;
            }

            let rendered = template::find_mpi_template(
                &self.config.etc_dir(),
                &job.model_name,
                job.request.template.as_deref(),
            )
            .and_then(|path| {
                template::render_file(
                    &path,
                    &template::LaunchInput {
                        model_name: job.model_name.clone(),
                        exe_stem: basic.name.clone(),
                        dir: job.work_dir.display().to_string(),
                        bin_dir: basic.bin_dir.display().to_string(),
                        db_path: basic.db_path.display().to_string(),
                        mpi_np: job.res.process_count,
                        args: argv.clone(),
                        env: job.request.env.clone(),
                    },
                )
            });

            match rendered {
                Ok(rendered) => (rendered.exe, rendered.args),
                Err(e) => {
                    warn!(submit = %job.submit_stamp, error = %e, "launch template failed");
                    self.fail_queued(&file.path, &job).await;
                    return;
                }
            }
        } else {
            (basic.exe_path(), argv)
        };

        job.exe_path = exe.clone();

        let spec = LaunchSpec {
            submit: job.submit_stamp.clone(),
            exe,
            args,
            env: job.request.env.clone(),
            work_dir: job.work_dir.clone(),
            log_path: job.log_path.clone(),
        };

        match launch::spawn_run(spec, self.run_events_tx.clone()).await {
            Ok(handle) => {
                job.pid = handle.pid;
                match files::promote(&self.job_dir, &file.path, &job) {
                    Ok(active_path) => {
                        info!(
                            submit = %job.submit_stamp,
                            model = %job.model_name,
                            pid = job.pid,
                            mpi = job.is_mpi,
                            "run launched"
                        );
                        self.bodies.remove(&file.path);
                        self.bodies.insert(active_path.clone(), job.clone());
                        self.rings.insert(
                            job.submit_stamp.clone(),
                            RunLog::new(self.config.run_log_lines),
                        );
                        self.running.insert(
                            job.submit_stamp.clone(),
                            ActiveRun {
                                job,
                                handle,
                                active_path,
                                started: Instant::now(),
                            },
                        );
                    }
                    Err(e) => {
                        // a concurrent cancel won the rename race
                        warn!(submit = %job.submit_stamp, error = %e, "promotion lost, stopping process");
                        handle.stop();
                    }
                }
            }
            Err(e) => {
                warn!(submit = %job.submit_stamp, error = %e, "failed to spawn run");
                self.fail_queued(&file.path, &job).await;
            }
        }
    }

    /// Moves a queue file straight to history with `error` and records the
    /// status.
    async fn fail_queued(&mut self, queue_path: &Path, job: &RunJob) {
        self.bodies.remove(queue_path);
        match files::complete(&self.job_dir, queue_path, job, 0, RunStatus::Error) {
            Ok(_) => self.record_run_status(job, RunStatus::Error).await,
            Err(e) => {
                warn!(path = %queue_path.display(), error = %e, "failed to file queued run as error")
            }
        }
    }

    /// Folds one supervised-process event.
    async fn handle_run_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Line { submit, line } => {
                if let Some(ring) = self.rings.get_mut(&submit) {
                    ring.append(line);
                }
            }
            RunEvent::Exited { submit, status } => {
                let Some(run) = self.running.remove(&submit) else {
                    return;
                };

                let seconds = run.started.elapsed().as_secs();
                info!(%submit, %status, seconds, "run finished");

                self.bodies.remove(&run.active_path);
                match files::complete(&self.job_dir, &run.active_path, &run.job, seconds, status) {
                    Ok(_) => self.record_run_status(&run.job, status).await,
                    Err(e) => {
                        warn!(%submit, error = %e, "failed to move run to history")
                    }
                }
            }
        }
    }

    /// Records a run's terminal status in its model database, when the model
    /// is still known.
    async fn record_run_status(&self, job: &RunJob, status: RunStatus) {
        if let Some(entry) = self.models.by_digest(&job.model_digest)
            && let Err(e) = entry.db.update_run_status(&job.run_stamp, status).await
        {
            warn!(run = %job.run_stamp, error = %e, "failed to record run status");
        }
    }

    /// Handles a run submission.
    fn handle_submit(&mut self, request: RunRequest) -> Result<RunState, JobError> {
        request.validate()?;

        let Some(basic) = self
            .models
            .by_digest(&request.model_digest)
            .map(|entry| entry.basic.clone())
        else {
            return Err(JobError::NotFound(format!(
                "no model with digest `{}`",
                request.model_digest
            )));
        };

        if request.is_mpi
            && self.config.mpi_max_threads > 0
            && request.thread_count() > self.config.mpi_max_threads
        {
            return Err(JobError::BadArgument(format!(
                "thread count {} exceeds the MPI limit of {}",
                request.thread_count(),
                self.config.mpi_max_threads
            )));
        }

        let res = ResourceEnvelope::compute(&request, basic.process_mem_mb, basic.thread_mem_mb);

        // a job larger than the pool it runs in can never leave the queue
        if request.is_mpi {
            let fleet_cpu = self.fleet.total_cpu();
            let fleet_mem = self.fleet.total_mem_gb();
            if (fleet_cpu > 0 && res.cpu > fleet_cpu) || (fleet_mem > 0 && res.mem_gb > fleet_mem) {
                return Err(JobError::Rejected(format!(
                    "job needs {} cores and {} GB but the compute fleet has {} cores and {} GB",
                    res.cpu, res.mem_gb, fleet_cpu, fleet_mem
                )));
            }
        } else if res.cpu > self.local_total_cpu || res.mem_gb > self.local_total_mem_gb {
            return Err(JobError::Rejected(format!(
                "job needs {} cores and {} GB but the local pool has {} cores and {} GB",
                res.cpu,
                res.mem_gb,
                self.local_total_cpu,
                self.local_total_mem_gb
            )));
        }

        if files::is_all_paused(&self.job_dir) || files::is_paused(&self.job_dir, &self.oms) {
            return Err(JobError::Rejected("the job queue is paused".into()));
        }

        if let Some(disk) = &self.disk
            && disk.over_quota()
        {
            return Err(JobError::Rejected(diskuse::quota_reason(disk)));
        }

        let submit_stamp = stamp::new_stamp();
        let run_stamp = request
            .run_stamp
            .clone()
            .unwrap_or_else(stamp::new_stamp);

        let position = files::list_control_files(&self.job_dir.queue())?
            .iter()
            .filter_map(|f| match f.kind {
                ControlKind::Queue { position } => Some(position),
                _ => None,
            })
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        let is_mpi = request.is_mpi;
        let work_dir = request.dir.clone().unwrap_or_else(|| basic.bin_dir.clone());

        let job = RunJob {
            submit_stamp: submit_stamp.clone(),
            oms: self.oms.clone(),
            model_name: basic.name.clone(),
            model_digest: basic.digest.clone(),
            run_stamp: run_stamp.clone(),
            pid: 0,
            exe_path: PathBuf::new(),
            request,
            res,
            is_mpi,
            log_path: PathBuf::new(),
            ini_path: None,
            bin_dir: basic.bin_dir.clone(),
            work_dir,
            hosts: Vec::new(),
        };

        let path = files::submit(&self.job_dir, position, &job)?;
        info!(
            submit = %submit_stamp,
            model = %job.model_name,
            position,
            mpi = is_mpi,
            "run queued"
        );
        self.bodies.insert(path, job);

        Ok(RunState {
            submit_stamp,
            run_stamp,
            queue_position: position,
            model_digest: basic.digest,
            model_name: basic.name,
        })
    }

    /// Finds an active run by owning instance and submission stamp.
    ///
    /// Stamps are unique only per instance, so both keys are required.
    fn find_active(&mut self, oms: &str, submit: &str) -> Option<RunJob> {
        if oms == self.oms
            && let Some(run) = self.running.get(submit)
        {
            return Some(run.job.clone());
        }

        let listed = files::list_control_files(&self.job_dir.active()).ok()?;
        let file = listed
            .into_iter()
            .find(|f| f.oms == oms && f.submit_stamp == submit)?;
        self.body_of(&file)
    }

    /// Finds a queued run by owning instance and submission stamp.
    fn find_queued(&mut self, oms: &str, submit: &str) -> Option<QueuedJob> {
        let listed = files::list_control_files(&self.job_dir.queue()).ok()?;
        let file = listed
            .into_iter()
            .find(|f| f.oms == oms && f.submit_stamp == submit)?;
        let position = match file.kind {
            ControlKind::Queue { position } => position,
            _ => return None,
        };

        self.body_of(&file).map(|job| QueuedJob { position, job })
    }

    /// Moves one of this instance's queue files to another position.
    fn move_in_queue(&mut self, submit: &str, position: u64) -> bool {
        let Ok(listed) = files::list_control_files(&self.job_dir.queue()) else {
            return false;
        };
        let Some(file) = listed
            .into_iter()
            .find(|f| f.submit_stamp == submit && f.oms == self.oms)
        else {
            return false;
        };

        match files::renumber(&self.job_dir, &file, position) {
            Ok(new_path) => {
                if let Some(job) = self.bodies.remove(&file.path) {
                    self.bodies.insert(new_path, job);
                }
                true
            }
            Err(e) => {
                warn!(%submit, error = %e, "failed to move run in queue");
                false
            }
        }
    }

    /// Stops a run: signals its process, or cancels it from the queue.
    fn stop_run(&mut self, submit: &str) -> bool {
        if let Some(run) = self.running.get(submit) {
            run.handle.stop();
            return true;
        }

        let Ok(listed) = files::list_control_files(&self.job_dir.queue()) else {
            return false;
        };
        let Some(file) = listed
            .into_iter()
            .find(|f| f.submit_stamp == submit && f.oms == self.oms)
        else {
            return false;
        };

        // the body may be unreadable; the name tokens suffice for the rename
        let job = self.body_of(&file).unwrap_or_else(|| job_from_name(&file));

        match files::kill_queued(&self.job_dir, &file.path, &job) {
            Ok(Some(_)) => {
                info!(%submit, "queued run cancelled");
                self.bodies.remove(&file.path);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(%submit, error = %e, "failed to cancel queued run");
                false
            }
        }
    }

    /// Reads a page of a run's console ring.
    fn tail_log(&mut self, submit: &str, offset: u64, size: usize) -> Result<LogTail, JobError> {
        self.rings
            .get_mut(submit)
            .map(|ring| ring.tail(offset, size))
            .ok_or_else(|| JobError::NotFound(format!("no console log for run `{submit}`")))
    }

    /// Builds the service-state snapshot from one scan.
    fn build_snapshot(&self, scan: &Scan, is_leader: bool) -> JobServiceState {
        let sum = |files: &dyn Fn(&&ControlFile) -> bool, list: &[ControlFile]| -> (u32, u32) {
            list.iter()
                .filter(files)
                .fold((0, 0), |(cpu, mem), f| (cpu + f.cpu, mem + f.mem_gb))
        };

        let mpi = |f: &&ControlFile| f.job_kind == JobKind::Mpi;
        let own_mpi = |f: &&ControlFile| f.job_kind == JobKind::Mpi && f.oms == self.oms;
        let local = |f: &&ControlFile| f.job_kind == JobKind::Local;

        let (mpi_active_cpu, mpi_active_mem) = sum(&mpi, &scan.active);
        let (mpi_queued_cpu, mpi_queued_mem) = sum(&mpi, &scan.queued);
        let (own_active_cpu, own_active_mem) = sum(&own_mpi, &scan.active);
        let (own_queued_cpu, own_queued_mem) = sum(&own_mpi, &scan.queued);
        let (local_active_cpu, local_active_mem) = sum(&local, &scan.active);
        let (local_queued_cpu, local_queued_mem) = sum(&local, &scan.queued);

        JobServiceState {
            is_queue_paused: scan.paused.contains(&self.oms),
            is_all_queue_paused: scan.all_paused,
            mpi_total: PoolFigures {
                cpu: self.fleet.total_cpu(),
                mem_gb: self.fleet.total_mem_gb(),
                active_cpu: mpi_active_cpu,
                active_mem_gb: mpi_active_mem,
                queued_cpu: mpi_queued_cpu,
                queued_mem_gb: mpi_queued_mem,
            },
            mpi_own: PoolFigures {
                cpu: self.fleet.total_cpu(),
                mem_gb: self.fleet.total_mem_gb(),
                active_cpu: own_active_cpu,
                active_mem_gb: own_active_mem,
                queued_cpu: own_queued_cpu,
                queued_mem_gb: own_queued_mem,
            },
            local: PoolFigures {
                cpu: self.local_total_cpu,
                mem_gb: self.local_total_mem_gb,
                active_cpu: local_active_cpu,
                active_mem_gb: local_active_mem,
                queued_cpu: local_queued_cpu,
                queued_mem_gb: local_queued_mem,
            },
            mpi_max_threads: self.config.mpi_max_threads,
            is_leader,
            last_start_stamp: self.fleet.last_start_stamp().map(str::to_string),
            last_stop_stamp: self.fleet.last_stop_stamp().map(str::to_string),
        }
    }
}

/// Reconstructs a job record from control-file name tokens alone.
///
/// Used when a body cannot be read but a rename still needs name-faithful
/// facts.
fn job_from_name(file: &ControlFile) -> RunJob {
    RunJob {
        submit_stamp: file.submit_stamp.clone(),
        oms: file.oms.clone(),
        model_name: file.model_name.clone(),
        model_digest: file.model_digest.clone(),
        run_stamp: file.run_stamp.clone(),
        pid: 0,
        exe_path: PathBuf::new(),
        request: RunRequest {
            model_digest: file.model_digest.clone(),
            model_name: file.model_name.clone(),
            env: BTreeMap::new(),
            ..Default::default()
        },
        res: ResourceEnvelope {
            cpu: file.cpu,
            mem_gb: file.mem_gb,
            ..Default::default()
        },
        is_mpi: file.job_kind == JobKind::Mpi,
        log_path: PathBuf::new(),
        ini_path: None,
        bin_dir: PathBuf::new(),
        work_dir: PathBuf::new(),
        hosts: Vec::new(),
    }
}
