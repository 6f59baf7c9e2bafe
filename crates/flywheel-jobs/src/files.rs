//! The job-control filesystem protocol.
//!
//! A rendezvous directory tree is shared by all cooperating instances on a
//! host. Control files carry all routing information in their names, so a
//! scan never has to open a file to order the queue or account resources;
//! bodies are opened only for records not seen before.
//!
//! Every lifecycle transition is an atomic rename within the same filesystem:
//!
//! - submit writes `queue/<pos>-#-<submit>-#-…json`
//! - promotion renames it into `active/` and rewrites the body with the pid
//! - completion renames it into `history/` with elapsed seconds and status
//! - aged history is shelved into `past/YYYY_MM/`
//!
//! Writers create a temp file in the destination directory and rename over
//! the final name; readers skip files younger than a grace period and flag
//! (but never delete) files that fail to decode.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::JobError;
use crate::Result;
use crate::job::HostState;
use crate::job::JobKind;
use crate::job::RunJob;
use crate::job::RunStatus;
use crate::stamp;

/// The token separator inside control file names.
pub const SEPARATOR: &str = "-#-";

/// Width of the zero-padded queue position prefix; lexicographic order of
/// queue file names then matches numeric order.
pub const POSITION_WIDTH: usize = 8;

/// How long a freshly written file is considered possibly incomplete.
pub const WRITE_GRACE: Duration = Duration::from_millis(1500);

/// Name of the global pause sentinel file.
const ALL_PAUSED_FILE: &str = "jobs.queue.all.paused";

/// Name of the per-instance pause sentinel directory.
const PAUSED_DIR: &str = "jobs.queue.paused";

/// Resolved paths of a rendezvous directory tree.
#[derive(Debug, Clone)]
pub struct JobDir {
    /// The rendezvous root.
    root: PathBuf,
}

impl JobDir {
    /// Wraps the given rendezvous root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The rendezvous root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `queue/` directory.
    pub fn queue(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// The `active/` directory.
    pub fn active(&self) -> PathBuf {
        self.root.join("active")
    }

    /// The `history/` directory.
    pub fn history(&self) -> PathBuf {
        self.root.join("history")
    }

    /// The `past/YYYY_MM/` directory for the given month key.
    pub fn past(&self, month: &str) -> PathBuf {
        self.root.join("past").join(month)
    }

    /// The `comp-state/` directory of compute-host state files.
    pub fn comp_state(&self) -> PathBuf {
        self.root.join("comp-state")
    }

    /// The `state/` directory of instance heartbeats.
    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    /// The per-instance pause sentinel for `oms`.
    pub fn paused_sentinel(&self, oms: &str) -> PathBuf {
        self.root.join(PAUSED_DIR).join(oms)
    }

    /// The global pause sentinel.
    pub fn all_paused_sentinel(&self) -> PathBuf {
        self.root.join(ALL_PAUSED_FILE)
    }

    /// Creates every fixed subdirectory of the tree, tolerating those that
    /// already exist.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.queue(),
            self.active(),
            self.history(),
            self.root.join("past"),
            self.comp_state(),
            self.state(),
            self.root.join(PAUSED_DIR),
        ] {
            fs::create_dir_all(&dir)?;
        }

        Ok(())
    }
}

/// The lifecycle directory a control file was parsed from, with the extra
/// tokens that directory's names carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// A queued job with its position prefix.
    Queue {
        /// The queue position.
        position: u64,
    },
    /// An active job.
    Active,
    /// A finished job with its elapsed seconds and terminal status.
    History {
        /// Total run time in whole seconds.
        seconds: u64,
        /// The terminal status token.
        status: RunStatus,
    },
}

/// A control file name, parsed without opening the file.
#[derive(Debug, Clone)]
pub struct ControlFile {
    /// Which lifecycle directory the file belongs to.
    pub kind: ControlKind,
    /// The submission stamp.
    pub submit_stamp: String,
    /// The owning instance name.
    pub oms: String,
    /// The model name.
    pub model_name: String,
    /// The model digest.
    pub model_digest: String,
    /// The run stamp.
    pub run_stamp: String,
    /// MPI or local.
    pub job_kind: JobKind,
    /// Total CPU cores.
    pub cpu: u32,
    /// Total memory in gigabytes.
    pub mem_gb: u32,
    /// The full path of the file.
    pub path: PathBuf,
}

impl ControlFile {
    /// Parses a control file path into its name tokens.
    pub fn parse(path: &Path) -> Result<Self> {
        let bad = || JobError::BadFileName(path.display().to_string());

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(bad)?;
        let name = name.strip_suffix(".json").ok_or_else(bad)?;

        let tokens: Vec<&str> = name.split(SEPARATOR).collect();
        let (kind, core) = match tokens.len() {
            10 => (ControlKind::Active, &tokens[..]),
            11 => {
                let position = tokens[0].parse().map_err(|_| bad())?;
                (ControlKind::Queue { position }, &tokens[1..])
            }
            12 => {
                let seconds = tokens[10].parse().map_err(|_| bad())?;
                let status = RunStatus::from_str(tokens[11]).map_err(|_| bad())?;
                (ControlKind::History { seconds, status }, &tokens[..10])
            }
            _ => return Err(bad()),
        };

        // core layout: submit, oms, model, digest, runStamp, kind, "cpu", N, "mem", GB
        if core[6] != "cpu" || core[8] != "mem" {
            return Err(bad());
        }

        Ok(Self {
            kind,
            submit_stamp: core[0].to_string(),
            oms: core[1].to_string(),
            model_name: core[2].to_string(),
            model_digest: core[3].to_string(),
            run_stamp: core[4].to_string(),
            job_kind: JobKind::from_str(core[5]).map_err(|_| bad())?,
            cpu: core[7].parse().map_err(|_| bad())?,
            mem_gb: core[9].parse().map_err(|_| bad())?,
            path: path.to_path_buf(),
        })
    }
}

/// Formats the core name tokens shared by all lifecycle directories.
fn core_name(job: &RunJob) -> String {
    format!(
        "{submit}{s}{oms}{s}{model}{s}{digest}{s}{run}{s}{kind}{s}cpu{s}{cpu}{s}mem{s}{mem}",
        s = SEPARATOR,
        submit = job.submit_stamp,
        oms = job.oms,
        model = job.model_name,
        digest = job.model_digest,
        run = job.run_stamp,
        kind = job.kind(),
        cpu = job.res.cpu,
        mem = job.res.mem_gb,
    )
}

/// The file name of a queued job at the given position.
pub fn queue_file_name(position: u64, job: &RunJob) -> String {
    format!(
        "{position:0width$}{SEPARATOR}{core}.json",
        width = POSITION_WIDTH,
        core = core_name(job),
    )
}

/// The file name of an active job.
pub fn active_file_name(job: &RunJob) -> String {
    format!("{core}.json", core = core_name(job))
}

/// The file name of a finished job.
pub fn history_file_name(job: &RunJob, seconds: u64, status: RunStatus) -> String {
    format!(
        "{core}{SEPARATOR}{seconds}{SEPARATOR}{status}.json",
        core = core_name(job),
    )
}

/// Serializes `value` as JSON to `path` via a temp file in the same directory
/// followed by a rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        JobError::BadArgument(format!("`{}` has no parent directory", path.display()))
    })?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| JobError::BadFileName(path.display().to_string()))?;

    let tmp = dir.join(format!(".{name}.tmp-{pid}", pid = std::process::id()));
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;

    fs::rename(&tmp, path).inspect_err(|_| {
        // best effort, the temp file is otherwise orphaned
        let _ = fs::remove_file(&tmp);
    })?;

    Ok(())
}

/// Reads and decodes a JSON control file body.
///
/// Returns `Ok(None)` when the file is younger than `grace` (a peer may still
/// be writing it) or has vanished between listing and reading. Decode
/// failures are surfaced so the caller can flag the file in memory; the file
/// itself is never deleted here.
pub fn read_json<T: DeserializeOwned>(path: &Path, grace: Duration) -> Result<Option<T>> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if let Ok(modified) = meta.modified()
        && SystemTime::now()
            .duration_since(modified)
            .map(|age| age < grace)
            .unwrap_or(true)
    {
        return Ok(None);
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Lists and parses every control file in a lifecycle directory, skipping
/// names that do not follow the grammar.
pub fn list_control_files(dir: &Path) -> Result<Vec<ControlFile>> {
    let mut out = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match ControlFile::parse(&path) {
            Ok(parsed) => out.push(parsed),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparsable control file"),
        }
    }

    Ok(out)
}

/// Writes a new queue file for a submitted job.
///
/// Returns the path of the created file.
pub fn submit(dir: &JobDir, position: u64, job: &RunJob) -> Result<PathBuf> {
    let path = dir.queue().join(queue_file_name(position, job));
    write_json_atomic(&path, job)?;
    Ok(path)
}

/// Promotes a queued job to active: renames the queue file into `active/` and
/// rewrites the body to include the pid and executable path.
///
/// A rename race (the queue file vanished, e.g. a concurrent cancel) is
/// reported as [`JobError::Transient`].
pub fn promote(dir: &JobDir, queue_path: &Path, job: &RunJob) -> Result<PathBuf> {
    let active_path = dir.active().join(active_file_name(job));

    fs::rename(queue_path, &active_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            JobError::Transient(format!(
                "queue file `{}` vanished before promotion",
                queue_path.display()
            ))
        } else {
            e.into()
        }
    })?;

    write_json_atomic(&active_path, job)?;
    Ok(active_path)
}

/// Completes an active job: renames the active file into `history/` with the
/// elapsed seconds and terminal status appended.
pub fn complete(
    dir: &JobDir,
    active_path: &Path,
    job: &RunJob,
    seconds: u64,
    status: RunStatus,
) -> Result<PathBuf> {
    let history_path = dir.history().join(history_file_name(job, seconds, status));
    fs::rename(active_path, &history_path)?;
    Ok(history_path)
}

/// Cancels a queued job: renames the queue file directly into `history/` with
/// status `kill`. Idempotent: a missing queue file means a concurrent cancel
/// or promotion already won, and is not an error.
pub fn kill_queued(dir: &JobDir, queue_path: &Path, job: &RunJob) -> Result<Option<PathBuf>> {
    let history_path = dir.history().join(history_file_name(job, 0, RunStatus::Kill));

    match fs::rename(queue_path, &history_path) {
        Ok(()) => Ok(Some(history_path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Shelves a history file into `past/YYYY_MM/`, keyed by the submission
/// stamp's month.
pub fn shelve(dir: &JobDir, file: &ControlFile) -> Result<PathBuf> {
    let month = stamp::month_of(&file.submit_stamp)
        .ok_or_else(|| JobError::BadFileName(file.path.display().to_string()))?;

    let past_dir = dir.past(month);
    fs::create_dir_all(&past_dir)?;

    let name = file
        .path
        .file_name()
        .ok_or_else(|| JobError::BadFileName(file.path.display().to_string()))?;
    let target = past_dir.join(name);
    fs::rename(&file.path, &target)?;
    Ok(target)
}

/// Renames a queue file to a new position, preserving all other tokens.
pub fn renumber(dir: &JobDir, file: &ControlFile, new_position: u64) -> Result<PathBuf> {
    let name = file
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| JobError::BadFileName(file.path.display().to_string()))?;

    let rest = name
        .split_once(SEPARATOR)
        .map(|(_, rest)| rest)
        .ok_or_else(|| JobError::BadFileName(file.path.display().to_string()))?;

    let target = dir.queue().join(format!(
        "{new_position:0width$}{SEPARATOR}{rest}",
        width = POSITION_WIDTH,
    ));

    fs::rename(&file.path, &target).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            JobError::Transient(format!(
                "queue file `{}` vanished before renumbering",
                file.path.display()
            ))
        } else {
            JobError::Io(e)
        }
    })?;

    Ok(target)
}

/// Sets or clears this instance's pause sentinel.
pub fn set_paused(dir: &JobDir, oms: &str, paused: bool) -> Result<()> {
    let sentinel = dir.paused_sentinel(oms);

    if paused {
        fs::write(&sentinel, [])?;
    } else {
        match fs::remove_file(&sentinel) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Returns `true` while this instance's pause sentinel exists.
pub fn is_paused(dir: &JobDir, oms: &str) -> bool {
    dir.paused_sentinel(oms).exists()
}

/// Returns `true` while the global pause sentinel exists.
pub fn is_all_paused(dir: &JobDir) -> bool {
    dir.all_paused_sentinel().exists()
}

/// Sets or clears the global pause sentinel.
pub fn set_all_paused(dir: &JobDir, paused: bool) -> Result<()> {
    let sentinel = dir.all_paused_sentinel();

    if paused {
        fs::write(&sentinel, [])?;
    } else {
        match fs::remove_file(&sentinel) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Lists the instances whose pause sentinel is set.
pub fn list_paused(dir: &JobDir) -> Result<Vec<String>> {
    let mut out = Vec::new();

    let entries = match fs::read_dir(dir.root.join(PAUSED_DIR)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        if let Some(name) = entry?.file_name().to_str() {
            out.push(name.to_string());
        }
    }

    Ok(out)
}

/// A compute-host state file name: `<host>.<state>.<cpu>.<mem>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompStateFile {
    /// The compute host name.
    pub host: String,
    /// The host state token.
    pub state: HostState,
    /// The host's total cores.
    pub cpu: u32,
    /// The host's total memory in gigabytes.
    pub mem_gb: u32,
    /// The full path of the file.
    pub path: PathBuf,
}

impl CompStateFile {
    /// Parses a comp-state file path into its name tokens.
    pub fn parse(path: &Path) -> Result<Self> {
        let bad = || JobError::BadFileName(path.display().to_string());

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(bad)?;
        let name = name.strip_suffix(".json").ok_or_else(bad)?;

        // host names may themselves contain dots, so split from the right
        let mut it = name.rsplitn(4, '.');
        let mem_gb = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let cpu = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let state = HostState::from_str(it.next().ok_or_else(bad)?).map_err(|_| bad())?;
        let host = it.next().ok_or_else(bad)?.to_string();

        if host.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            host,
            state,
            cpu,
            mem_gb,
            path: path.to_path_buf(),
        })
    }

    /// The file name for the given host facts.
    pub fn name(host: &str, state: HostState, cpu: u32, mem_gb: u32) -> String {
        format!("{host}.{state}.{cpu}.{mem_gb}.json")
    }
}

/// Lists and parses every comp-state file.
pub fn list_comp_state(dir: &JobDir) -> Result<Vec<CompStateFile>> {
    let mut out = Vec::new();

    let entries = match fs::read_dir(dir.comp_state()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match CompStateFile::parse(&path) {
            Ok(parsed) => out.push(parsed),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparsable comp-state file"),
        }
    }

    Ok(out)
}

/// Publishes a compute host's state: writes the new name and removes any
/// previous file for the same host. Only the leader instance calls this.
pub fn publish_comp_state(
    dir: &JobDir,
    host: &str,
    state: HostState,
    cpu: u32,
    mem_gb: u32,
) -> Result<PathBuf> {
    let target = dir
        .comp_state()
        .join(CompStateFile::name(host, state, cpu, mem_gb));
    write_json_atomic(&target, &serde_json::json!({ "Host": host, "Stamp": stamp::now_stamp() }))?;

    for old in list_comp_state(dir)? {
        if old.host == host && old.path != target {
            let _ = fs::remove_file(&old.path);
        }
    }

    Ok(target)
}

/// Removes a compute host's state file; the operator's way of clearing a
/// sticky `error` state.
pub fn clear_comp_state(dir: &JobDir, host: &str) -> Result<()> {
    for old in list_comp_state(dir)? {
        if old.host == host {
            fs::remove_file(&old.path)?;
        }
    }

    Ok(())
}

/// Rewrites this instance's heartbeat file; liveness for leader election.
pub fn beat(dir: &JobDir, oms: &str) -> Result<()> {
    let path = dir.state().join(format!("{oms}.heartbeat.json"));
    write_json_atomic(&path, &serde_json::json!({ "Oms": oms, "Stamp": stamp::now_stamp() }))
}

/// Lists instance heartbeats as `(name, age)` pairs.
pub fn list_heartbeats(dir: &JobDir) -> Result<Vec<(String, Duration)>> {
    let mut out = Vec::new();

    let entries = match fs::read_dir(dir.state()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".heartbeat.json"))
        else {
            continue;
        };

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::MAX);

        out.push((name.to_string(), age));
    }

    Ok(out)
}
