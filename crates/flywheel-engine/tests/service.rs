//! End-to-end tests of the job service over a real rendezvous tree, model
//! databases, and stub model executables.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flywheel_engine::Catalog;
use flywheel_engine::Config;
use flywheel_engine::spawn_catalog;
use flywheel_jobs::JobError;
use flywheel_jobs::files;
use flywheel_jobs::files::ControlKind;
use flywheel_jobs::files::JobDir;
use flywheel_jobs::job::RunJob;
use flywheel_jobs::job::RunStatus;
use flywheel_jobs::request::RunRequest;

/// The instance name every test runs under.
const OMS: &str = "test_1";

/// A running job service over a temp directory tree.
struct Rig {
    /// The temp root; dropped last.
    _tmp: TempDir,
    /// The client handle.
    catalog: Catalog,
    /// The actor task.
    actor: JoinHandle<()>,
    /// The shutdown token handed to the actor.
    shutdown: CancellationToken,
    /// The rendezvous tree.
    job_dir: JobDir,
    /// The run-log directory.
    log_dir: PathBuf,
}

impl Rig {
    /// Builds a service over a fresh tree with one stub model.
    ///
    /// `extra` is appended to the configuration file; `script` is the body of
    /// the stub model executable.
    async fn start(extra: &str, script: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let bin_dir = tmp.path().join("models").join("Stub");
        std::fs::create_dir_all(&bin_dir).unwrap();

        create_model_db(&bin_dir.join("Stub.sqlite"), "Stub", "stub-digest").await;
        write_executable(&bin_dir.join("Stub"), script);

        let toml = format!(
            r#"
            RootDir = "{root}"
            Name = "{OMS}"
            ScanIntervalMs = 100
            {extra}
            "#,
            root = tmp.path().display(),
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let job_dir = JobDir::new(config.job_dir());
        let log_dir = config.log_dir();

        let shutdown = CancellationToken::new();
        let (catalog, actor) = spawn_catalog(config, shutdown.clone()).await.unwrap();

        Self {
            _tmp: tmp,
            catalog,
            actor,
            shutdown,
            job_dir,
            log_dir,
        }
    }

    /// A minimal run request against the stub model.
    fn request(&self) -> RunRequest {
        RunRequest {
            model_digest: "stub-digest".into(),
            model_name: "Stub".into(),
            ..Default::default()
        }
    }

    /// Polls until `check` passes or a generous deadline expires.
    async fn wait_for(&self, what: &str, check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// The terminal status of a submission, when it reached history.
    fn history_status(&self, submit: &str) -> Option<RunStatus> {
        files::list_control_files(&self.job_dir.history())
            .unwrap()
            .into_iter()
            .find(|f| f.submit_stamp == submit)
            .map(|f| match f.kind {
                ControlKind::History { status, .. } => status,
                _ => panic!("history file without history tokens"),
            })
    }

    /// Stops the service and waits for the actor to exit.
    async fn stop(self) {
        let _ = self.catalog.shutdown().await;
        self.shutdown.cancel();
        self.actor.await.unwrap();
    }
}

/// Creates a model database with the schema the server contracts on.
async fn create_model_db(path: &Path, name: &str, digest: &str) {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePool::connect(&url).await.unwrap();

    sqlx::query("pragma user_version = 102")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "create table model_dic ( \
         model_name text not null, model_digest text not null, \
         model_version text not null, default_lang text not null, \
         process_mem_mb integer not null, thread_mem_mb integer not null )",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "create table run_lst ( \
         run_id integer primary key, run_stamp text not null, \
         status text not null, update_dt text not null )",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("insert into model_dic values (?, ?, '1.0.0', 'EN', 256, 64)")
        .bind(name)
        .bind(digest)
        .execute(&pool)
        .await
        .unwrap();

    pool.close().await;
}

/// Writes an executable shell script.
fn write_executable(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perm = std::fs::metadata(path).unwrap().permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(path, perm).unwrap();
}

#[tokio::test]
async fn local_run_completes() {
    let rig = Rig::start("", "echo model says hello").await;

    let state = rig.catalog.submit_run(rig.request()).await.unwrap();
    assert_eq!(state.model_name, "Stub");
    assert_eq!(state.queue_position, 0);

    rig.wait_for("run completion", || {
        rig.history_status(&state.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&state.submit_stamp),
        Some(RunStatus::Success)
    );

    // console output went to the run's log file
    let log = rig
        .log_dir
        .join(format!("Stub.{}.console.log", state.run_stamp));
    assert!(
        std::fs::read_to_string(log)
            .unwrap()
            .contains("model says hello")
    );

    // a single instance leads itself
    let snapshot = rig.catalog.service_state().await.unwrap();
    assert!(snapshot.is_leader);
    assert!(!snapshot.is_queue_paused);

    rig.stop().await;
}

#[tokio::test]
async fn failing_run_lands_in_history_as_error() {
    let rig = Rig::start("", "echo boom >&2; exit 3").await;

    let state = rig.catalog.submit_run(rig.request()).await.unwrap();
    rig.wait_for("run completion", || {
        rig.history_status(&state.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&state.submit_stamp),
        Some(RunStatus::Error)
    );

    rig.stop().await;
}

#[tokio::test]
async fn queued_job_can_be_cancelled_and_moved() {
    // four local cores; a long sleeper takes them all, later jobs queue
    // behind it
    let rig = Rig::start("LocalCpu = 4\nLocalMemGb = 64", "sleep 600").await;

    let mut request = rig.request();
    request.threads = 4;

    let blocker = rig.catalog.submit_run(request.clone()).await.unwrap();
    rig.wait_for("blocker activation", || {
        files::list_control_files(&rig.job_dir.active())
            .unwrap()
            .iter()
            .any(|f| f.submit_stamp == blocker.submit_stamp)
    })
    .await;

    let first = rig.catalog.submit_run(request.clone()).await.unwrap();
    let second = rig.catalog.submit_run(request).await.unwrap();
    assert_eq!(second.queue_position, 2);

    // still queued after a few ticks
    tokio::time::sleep(Duration::from_millis(500)).await;
    let queued = rig
        .catalog
        .find_queued(OMS, &first.submit_stamp)
        .await
        .unwrap()
        .expect("the over-committed job must stay queued");
    assert_eq!(queued.position, 1);

    // lookups are keyed by owning instance as well as stamp
    assert!(
        rig.catalog
            .find_queued("front_2", &first.submit_stamp)
            .await
            .unwrap()
            .is_none()
    );

    // move the second entry to the back, then cancel the first
    assert!(
        rig.catalog
            .move_in_queue(&second.submit_stamp, 7)
            .await
            .unwrap()
    );
    let moved = rig
        .catalog
        .find_queued(OMS, &second.submit_stamp)
        .await
        .unwrap()
        .expect("the moved job is still queued");
    assert_eq!(moved.position, 7);

    assert!(rig.catalog.stop_run(&first.submit_stamp).await.unwrap());
    rig.wait_for("cancellation", || {
        rig.history_status(&first.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&first.submit_stamp),
        Some(RunStatus::Kill)
    );
    assert!(
        rig.catalog
            .find_queued(OMS, &first.submit_stamp)
            .await
            .unwrap()
            .is_none()
    );

    // cancelling an unknown stamp reports false
    assert!(!rig.catalog.stop_run("2020_01_01_00_00_00_000").await.unwrap());

    // drain the queue before releasing the sleeper
    assert!(rig.catalog.stop_run(&second.submit_stamp).await.unwrap());
    assert!(rig.catalog.stop_run(&blocker.submit_stamp).await.unwrap());
    rig.stop().await;
}

#[tokio::test]
async fn active_run_can_be_stopped() {
    let rig = Rig::start("", "echo up; sleep 600").await;

    let state = rig.catalog.submit_run(rig.request()).await.unwrap();
    rig.wait_for("run activation", || {
        files::list_control_files(&rig.job_dir.active())
            .unwrap()
            .iter()
            .any(|f| f.submit_stamp == state.submit_stamp)
    })
    .await;

    assert!(
        rig.catalog
            .find_active(OMS, &state.submit_stamp)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        rig.catalog
            .find_active("front_2", &state.submit_stamp)
            .await
            .unwrap()
            .is_none()
    );

    assert!(rig.catalog.stop_run(&state.submit_stamp).await.unwrap());
    rig.wait_for("kill", || {
        rig.history_status(&state.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&state.submit_stamp),
        Some(RunStatus::Kill)
    );

    rig.stop().await;
}

#[tokio::test]
async fn console_log_is_pollable_while_running() {
    let rig = Rig::start("", "echo line one; echo line two; sleep 600").await;

    let state = rig.catalog.submit_run(rig.request()).await.unwrap();
    rig.wait_for("run activation", || {
        files::list_control_files(&rig.job_dir.active())
            .unwrap()
            .iter()
            .any(|f| f.submit_stamp == state.submit_stamp)
    })
    .await;

    // the ring fills as the process writes
    let mut tail = rig
        .catalog
        .tail_log(&state.submit_stamp, 0, 100)
        .await
        .unwrap();
    for _ in 0..50 {
        if tail.lines.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        tail = rig
            .catalog
            .tail_log(&state.submit_stamp, 0, 100)
            .await
            .unwrap();
    }
    assert_eq!(tail.lines, ["line one", "line two"]);
    assert_eq!(tail.offset, 0);

    // an unknown stamp has no ring
    assert!(matches!(
        rig.catalog.tail_log("2020_01_01_00_00_00_000", 0, 10).await,
        Err(JobError::NotFound(_))
    ));

    assert!(rig.catalog.stop_run(&state.submit_stamp).await.unwrap());
    rig.stop().await;
}

#[tokio::test]
async fn paused_queue_rejects_submissions() {
    let rig = Rig::start("", "exit 0").await;

    rig.catalog.pause_queue(true).await.unwrap();
    assert!(matches!(
        rig.catalog.submit_run(rig.request()).await,
        Err(JobError::Rejected(_))
    ));

    rig.catalog.pause_queue(false).await.unwrap();
    rig.catalog.pause_all(true).await.unwrap();
    assert!(matches!(
        rig.catalog.submit_run(rig.request()).await,
        Err(JobError::Rejected(_))
    ));

    rig.catalog.pause_all(false).await.unwrap();
    assert!(rig.catalog.submit_run(rig.request()).await.is_ok());

    rig.stop().await;
}

#[tokio::test]
async fn bad_submissions_produce_no_side_effects() {
    let rig = Rig::start("", "exit 0").await;

    let mut unknown = rig.request();
    unknown.model_digest = "no-such-digest".into();
    assert!(matches!(
        rig.catalog.submit_run(unknown).await,
        Err(JobError::NotFound(_))
    ));

    let mut forbidden = rig.request();
    forbidden
        .opts
        .insert("-OpenM.LogToFile".into(), "true".into());
    assert!(matches!(
        rig.catalog.submit_run(forbidden).await,
        Err(JobError::BadArgument(_))
    ));

    assert!(
        files::list_control_files(&rig.job_dir.queue())
            .unwrap()
            .is_empty()
    );

    rig.stop().await;
}

#[tokio::test]
async fn infeasible_submission_is_rejected() {
    // two local cores; a four-thread job can never leave the queue
    let rig = Rig::start("LocalCpu = 2\nLocalMemGb = 64", "exit 0").await;

    let mut request = rig.request();
    request.threads = 4;
    assert!(matches!(
        rig.catalog.submit_run(request).await,
        Err(JobError::Rejected(_))
    ));
    assert!(
        files::list_control_files(&rig.job_dir.queue())
            .unwrap()
            .is_empty()
    );

    rig.stop().await;
}

#[tokio::test]
async fn models_are_listed() {
    let rig = Rig::start("", "exit 0").await;

    let models = rig.catalog.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "Stub");
    assert_eq!(models[0].digest, "stub-digest");

    rig.stop().await;
}

#[tokio::test]
async fn mpi_run_places_and_writes_hostfile() {
    let extra = r#"
        [HostFile]
        IsUse = true
        RootLine = "@-HOST-@ slots=1"
        HostLine = "@-HOST-@ slots=@-CORES-@"
    "#;
    let rig = Rig::start(extra, "echo mpi run done").await;

    // the site template runs the model directly, standing in for mpiexec
    let etc = rig._tmp.path().join("etc");
    std::fs::create_dir_all(&etc).unwrap();
    std::fs::write(
        etc.join("mpi.ModelRun.template.txt"),
        "{BinDir}/{ExeStem}\n{Args}\n",
    )
    .unwrap();

    // a compute host advertising a ready file, as its start script would
    std::fs::write(
        rig.job_dir.comp_state().join("cpc-1.ready.8.32.json"),
        "{}",
    )
    .unwrap();

    let mut request = rig.request();
    request.is_mpi = true;
    request.mpi_np = 1;
    let state = rig.catalog.submit_run(request).await.unwrap();

    rig.wait_for("mpi completion", || {
        rig.history_status(&state.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&state.submit_stamp),
        Some(RunStatus::Success)
    );

    let hostfile = rig
        .log_dir
        .join(format!("{}.hostfile.txt", state.submit_stamp));
    let content = std::fs::read_to_string(hostfile).unwrap();
    assert!(content.contains("cpc-1 slots=1"), "hostfile was: {content}");

    rig.stop().await;
}

#[tokio::test]
async fn mpi_cores_are_drawn_across_hosts() {
    let extra = r#"
        [HostFile]
        IsUse = true
        RootLine = "@-HOST-@ slots=1"
        HostLine = "@-HOST-@ slots=@-CORES-@"
    "#;
    let rig = Rig::start(extra, "exit 0").await;

    let etc = rig._tmp.path().join("etc");
    std::fs::create_dir_all(&etc).unwrap();
    std::fs::write(
        etc.join("mpi.ModelRun.template.txt"),
        "{BinDir}/{ExeStem}\n{Args}\n",
    )
    .unwrap();

    // two ready hosts of four cores each
    for host in ["cpc-1", "cpc-2"] {
        std::fs::write(
            rig.job_dir
                .comp_state()
                .join(format!("{host}.ready.4.16.json")),
            "{}",
        )
        .unwrap();
    }

    // two processes of three threads: six cores, the first host filled whole
    let mut request = rig.request();
    request.is_mpi = true;
    request.mpi_np = 2;
    request.threads = 3;
    let state = rig.catalog.submit_run(request).await.unwrap();

    rig.wait_for("mpi completion", || {
        rig.history_status(&state.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&state.submit_stamp),
        Some(RunStatus::Success)
    );

    let hostfile = rig
        .log_dir
        .join(format!("{}.hostfile.txt", state.submit_stamp));
    let content = std::fs::read_to_string(hostfile).unwrap();
    assert!(content.contains("cpc-1 slots=4"), "hostfile was: {content}");
    assert!(content.contains("cpc-2 slots=2"), "hostfile was: {content}");

    rig.stop().await;
}

#[tokio::test]
async fn active_file_with_dead_process_is_demoted() {
    let rig = Rig::start("", "exit 0").await;

    // an orphaned active file left by a previous incarnation of this instance
    let job = RunJob {
        submit_stamp: "2024_03_05_10_00_00_000".into(),
        oms: OMS.into(),
        model_name: "Stub".into(),
        model_digest: "stub-digest".into(),
        run_stamp: "2024_03_05_10_00_00_001".into(),
        pid: u32::MAX - 1,
        exe_path: PathBuf::new(),
        request: RunRequest {
            model_digest: "stub-digest".into(),
            ..Default::default()
        },
        res: Default::default(),
        is_mpi: false,
        log_path: PathBuf::new(),
        ini_path: None,
        bin_dir: PathBuf::new(),
        work_dir: PathBuf::new(),
        hosts: Vec::new(),
    };
    let active_path = rig
        .job_dir
        .active()
        .join(files::active_file_name(&job));
    files::write_json_atomic(&active_path, &job).unwrap();

    // the body is only readable once past the write grace period
    tokio::time::sleep(Duration::from_millis(1700)).await;

    rig.wait_for("demotion", || {
        rig.history_status(&job.submit_stamp).is_some()
    })
    .await;
    assert_eq!(
        rig.history_status(&job.submit_stamp),
        Some(RunStatus::Error)
    );
    assert!(!active_path.exists());

    rig.stop().await;
}
