//! Model process supervision: argv building, spawning, console capture, and
//! reaping.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use flywheel_jobs::job::RunStatus;
use flywheel_jobs::request::RunRequest;

/// How long a cancelled run gets to exit after SIGTERM before a hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Returns `true` when a process with the given pid exists on this host.
pub fn pid_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system.process(target).is_some()
}

/// An event from a supervised model process.
#[derive(Debug)]
pub enum RunEvent {
    /// One console line (stdout or stderr).
    Line {
        /// The submission stamp of the run.
        submit: String,
        /// The console line, without the trailing newline.
        line: String,
    },
    /// The process exited and was reaped.
    Exited {
        /// The submission stamp of the run.
        submit: String,
        /// The terminal status derived from the exit code, or `kill` when the
        /// run was cancelled.
        status: RunStatus,
    },
}

/// Everything needed to start one model process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The submission stamp, used to tag events.
    pub submit: String,
    /// The executable to run.
    pub exe: PathBuf,
    /// The argument vector.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// The working directory.
    pub work_dir: PathBuf,
    /// Console output is appended here so runs survive server restarts.
    pub log_path: PathBuf,
}

/// A handle to a running model process.
#[derive(Debug)]
pub struct RunHandle {
    /// The child pid.
    pub pid: u32,
    /// Cancelling this token stops the run.
    cancel: CancellationToken,
}

impl RunHandle {
    /// Requests the run to stop: SIGTERM, then a hard kill after
    /// [`KILL_GRACE`]. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Builds the model argument vector from a run request.
///
/// Options come first, each key normalized to a single leading dash. The
/// standard trailer pins the run stamp and routes model logging through our
/// console capture instead of the model's own log files.
pub fn model_argv(
    request: &RunRequest,
    run_stamp: &str,
    ini_path: Option<&Path>,
    notes: &[(String, PathBuf)],
) -> Vec<String> {
    let mut args = Vec::with_capacity(request.opts.len() * 2 + 8);

    for (key, value) in &request.opts {
        let key = key.trim();
        if key.starts_with('-') {
            args.push(key.to_string());
        } else {
            args.push(format!("-{key}"));
        }
        args.push(value.clone());
    }

    if request.threads > 1 {
        args.push("-OpenM.Threads".to_string());
        args.push(request.threads.to_string());
    }

    args.push("-OpenM.RunStamp".to_string());
    args.push(run_stamp.to_string());
    args.push("-OpenM.LogToConsole".to_string());
    args.push("true".to_string());
    args.push("-OpenM.LogToFile".to_string());
    args.push("false".to_string());

    if let Some(ini_path) = ini_path {
        args.push("-ini".to_string());
        args.push(ini_path.display().to_string());
    }

    for (lang, path) in notes {
        args.push(format!("-{lang}.RunNotesPath"));
        args.push(path.display().to_string());
    }

    args
}

/// Writes the generated ini holding the retained-tables list.
///
/// Returns `None` when the request retains no tables and no ini is needed.
pub fn write_retain_ini(dir: &Path, stamp: &str, tables: &[String]) -> Result<Option<PathBuf>> {
    if tables.is_empty() {
        return Ok(None);
    }

    let path = dir.join(format!("{stamp}.ini"));
    let body = format!("[Tables]\nRetain = {}\n", tables.join(", "));
    std::fs::write(&path, body)
        .with_context(|| format!("failed to write run ini `{}`", path.display()))?;
    Ok(Some(path))
}

/// Writes one run-notes markdown file per language.
pub fn write_run_notes(
    dir: &Path,
    stamp: &str,
    notes: &BTreeMap<String, String>,
) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::with_capacity(notes.len());

    for (lang, text) in notes {
        if text.trim().is_empty() {
            continue;
        }

        let path = dir.join(format!("{stamp}.run_notes.{lang}.md"));
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write run notes `{}`", path.display()))?;
        out.push((lang.clone(), path));
    }

    Ok(out)
}

/// Spawns a model process and supervises it to completion.
///
/// Console lines flow to `events` and to the run's log file; exactly one
/// `Exited` event follows the last line. The returned handle carries the pid
/// for the active control file and a token to cancel the run.
pub async fn spawn_run(spec: LaunchSpec, events: mpsc::Sender<RunEvent>) -> Result<RunHandle> {
    let mut child = Command::new(&spec.exe)
        .args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start model `{}`", spec.exe.display()))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow!("model `{}` exited before its pid was read", spec.exe.display()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr was not piped"))?;

    // merge both streams into one writer so log-file lines never interleave
    let (line_tx, line_rx) = mpsc::channel::<String>(256);
    tokio::spawn(read_lines(stdout, line_tx.clone()));
    tokio::spawn(read_lines(stderr, line_tx));

    let cancel = CancellationToken::new();
    tokio::spawn(supervise(
        child,
        spec,
        line_rx,
        events,
        cancel.clone(),
    ));

    Ok(RunHandle { pid, cancel })
}

/// Forwards lines from one child stream into the merge channel.
async fn read_lines(stream: impl tokio::io::AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// How long to wait for trailing console lines after the child exits.
///
/// Descendant processes may inherit the pipes and never close them, so the
/// drain after exit must be bounded.
const STREAM_LINGER: Duration = Duration::from_millis(250);

/// Drains console lines, waits for exit, and emits the terminal event.
async fn supervise(
    mut child: tokio::process::Child,
    spec: LaunchSpec,
    mut line_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
) {
    let mut log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(
                log = %spec.log_path.display(),
                error = %e,
                "console log file unavailable, capturing to memory only"
            );
            None
        }
    };

    let pid = child.id();
    let mut cancelled = false;
    let exit = loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    emit_line(&mut log_file, &events, &spec.submit, line).await;
                }
                // both streams closed, the child is exiting
                None => break child.wait().await,
            },
            status = child.wait() => break status,
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                if let Some(pid) = pid {
                    terminate(pid, &spec.submit);
                }
            }
        }
    };

    // bounded drain of lines buffered behind the exit
    while let Ok(Some(line)) = tokio::time::timeout(STREAM_LINGER, line_rx.recv()).await {
        emit_line(&mut log_file, &events, &spec.submit, line).await;
    }

    let status = match exit {
        Ok(status) if cancelled => {
            debug!(submit = %spec.submit, code = ?status.code(), "cancelled run exited");
            RunStatus::Kill
        }
        Ok(status) => match status.code() {
            Some(code) => RunStatus::from_exit_code(code),
            // terminated by an unexpected signal
            None => RunStatus::Error,
        },
        Err(e) => {
            warn!(submit = %spec.submit, error = %e, "failed to reap model process");
            RunStatus::Error
        }
    };

    let _ = events
        .send(RunEvent::Exited {
            submit: spec.submit.clone(),
            status,
        })
        .await;
}

/// Appends one line to the run's log file and forwards it to the events
/// channel.
async fn emit_line(
    log_file: &mut Option<tokio::fs::File>,
    events: &mpsc::Sender<RunEvent>,
    submit: &str,
    line: String,
) {
    if let Some(file) = log_file.as_mut()
        && let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await
    {
        warn!(error = %e, "failed to append console log line");
        *log_file = None;
    }

    let _ = events
        .send(RunEvent::Line {
            submit: submit.to_string(),
            line,
        })
        .await;
}

/// Sends SIGTERM and arms a hard kill after the grace interval.
fn terminate(pid: u32, submit: &str) {
    debug!(%submit, pid, "stopping model process");

    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    let submit = submit.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(KILL_GRACE).await;
        if pid_alive(pid) {
            warn!(%submit, pid, "model ignored SIGTERM, killing");
            // SAFETY: same pid, escalated to SIGKILL after the grace interval.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    });
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn sh_spec(tmp: &TempDir, submit: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            submit: submit.to_string(),
            exe: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            work_dir: tmp.path().to_path_buf(),
            log_path: tmp.path().join(format!("{submit}.console.log")),
        }
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(u32::MAX - 1));
    }

    #[test]
    fn argv_trailer_and_option_normalization() {
        let mut request = RunRequest::default();
        request.opts.insert("OpenM.SubValues".into(), "8".into());
        request.opts.insert("-Parameter.Ratio".into(), "0.5".into());

        let ini = PathBuf::from("/tmp/x.ini");
        let notes = vec![("EN".to_string(), PathBuf::from("/tmp/n.md"))];
        let args = model_argv(&request, "2024_03_05_10_00_00_000", Some(&ini), &notes);

        assert_eq!(
            args,
            [
                "-Parameter.Ratio",
                "0.5",
                "-OpenM.SubValues",
                "8",
                "-OpenM.RunStamp",
                "2024_03_05_10_00_00_000",
                "-OpenM.LogToConsole",
                "true",
                "-OpenM.LogToFile",
                "false",
                "-ini",
                "/tmp/x.ini",
                "-EN.RunNotesPath",
                "/tmp/n.md",
            ]
        );
    }

    #[test]
    fn retain_ini_written_only_when_needed() {
        let tmp = TempDir::new().unwrap();

        assert!(
            write_retain_ini(tmp.path(), "s", &[])
                .unwrap()
                .is_none()
        );

        let path = write_retain_ini(
            tmp.path(),
            "2024_03_05_10_00_00_000",
            &["ageTable".to_string(), "incomeTable".to_string()],
        )
        .unwrap()
        .unwrap();

        let body = std::fs::read_to_string(path).unwrap();
        assert_eq!(body, "[Tables]\nRetain = ageTable, incomeTable\n");
    }

    #[test]
    fn run_notes_one_file_per_language() {
        let tmp = TempDir::new().unwrap();
        let mut notes = BTreeMap::new();
        notes.insert("EN".to_string(), "english notes".to_string());
        notes.insert("FR".to_string(), "notes en français".to_string());
        notes.insert("XX".to_string(), "   ".to_string());

        let written = write_run_notes(tmp.path(), "stamp", &notes).unwrap();
        let langs: Vec<&str> = written.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(langs, ["EN", "FR"], "blank notes produce no file");

        let (_, en_path) = &written[0];
        assert_eq!(
            en_path.file_name().unwrap().to_str().unwrap(),
            "stamp.run_notes.EN.md"
        );
        assert_eq!(std::fs::read_to_string(en_path).unwrap(), "english notes");
    }

    #[tokio::test]
    async fn captures_lines_and_exit_status() {
        let tmp = TempDir::new().unwrap();
        let spec = sh_spec(&tmp, "s1", "echo one; echo two >&2; echo three; exit 0");
        let log_path = spec.log_path.clone();

        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_run(spec, tx).await.unwrap();
        assert!(handle.pid > 0);

        let mut lines = Vec::new();
        let mut status = None;
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::Line { line, .. } => lines.push(line),
                RunEvent::Exited { status: s, .. } => {
                    status = Some(s);
                    break;
                }
            }
        }

        lines.sort();
        assert_eq!(lines, ["one", "three", "two"]);
        assert_eq!(status, Some(RunStatus::Success));

        // the console log holds the same lines
        let log = std::fs::read_to_string(log_path).unwrap();
        let mut logged: Vec<&str> = log.lines().collect();
        logged.sort();
        assert_eq!(logged, ["one", "three", "two"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_error() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        spawn_run(sh_spec(&tmp, "s2", "exit 3"), tx).await.unwrap();

        loop {
            match rx.recv().await {
                Some(RunEvent::Exited { status, .. }) => {
                    assert_eq!(status, RunStatus::Error);
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed without an exit event"),
            }
        }
    }

    #[tokio::test]
    async fn stop_files_kill() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_run(sh_spec(&tmp, "s3", "echo up; sleep 600"), tx)
            .await
            .unwrap();

        // wait for the process to be up, then cancel
        loop {
            match rx.recv().await {
                Some(RunEvent::Line { line, .. }) if line == "up" => break,
                Some(_) => continue,
                None => panic!("channel closed early"),
            }
        }
        handle.stop();
        assert!(handle.is_stopping());

        loop {
            match rx.recv().await {
                Some(RunEvent::Exited { status, .. }) => {
                    assert_eq!(status, RunStatus::Kill);
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed without an exit event"),
            }
        }
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let tmp = TempDir::new().unwrap();
        let mut spec = sh_spec(&tmp, "s4", "");
        spec.exe = tmp.path().join("no-such-model");

        let (tx, _rx) = mpsc::channel(4);
        assert!(spawn_run(spec, tx).await.is_err());
    }
}
