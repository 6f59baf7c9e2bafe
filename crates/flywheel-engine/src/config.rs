//! Server configuration.
//!
//! The configuration surface is enumerated and closed: unknown keys are
//! rejected at parse time (`deny_unknown_fields`). Keys consumed only by the
//! HTTP layer (`Listen`, `LogRequest`, `ApiOnly`, `AdminAll`) are accepted so
//! a configuration file shared with that layer round-trips cleanly.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// The default scheduler tick period in milliseconds.
const DEFAULT_SCAN_INTERVAL_MS: u64 = 1000;

/// The default number of days a history file stays before shelving into
/// `past/YYYY_MM/`.
const DEFAULT_JOB_PAST_DAYS: u32 = 14;

/// The default per-run console ring capacity, in lines.
const DEFAULT_RUN_LOG_LINES: usize = 500;

/// The default idle interval after which an unpolled console ring is evicted,
/// in seconds.
const DEFAULT_RUN_LOG_IDLE_SEC: u64 = 600;

/// Top-level server configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// The server root directory; all other directories default to
    /// subdirectories of it.
    pub root_dir: PathBuf,

    /// The models root directory, scanned recursively for model databases.
    /// Defaults to `<RootDir>/models`.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// The directory of launch templates and other site files. Defaults to
    /// `<RootDir>/etc`.
    #[serde(default)]
    pub etc_dir: Option<PathBuf>,

    /// The directory of run console logs. Defaults to `<RootDir>/log`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// The upload/download files directory, measured by the disk-use
    /// watchdog. Defaults to `<RootDir>/files`.
    #[serde(default)]
    pub files_dir: Option<PathBuf>,

    /// The instance name; embeds into control file names. Defaults to
    /// `<hostname>_<pid>`.
    #[serde(default)]
    pub name: Option<String>,

    /// The listen address, consumed by the HTTP layer.
    #[serde(default)]
    pub listen: Option<String>,

    /// Whether to log requests, consumed by the HTTP layer.
    #[serde(default)]
    pub log_request: bool,

    /// Whether to serve the API without the UI, consumed by the HTTP layer.
    #[serde(default)]
    pub api_only: bool,

    /// Comma-separated list of preferred languages.
    #[serde(default = "default_languages")]
    pub languages: String,

    /// Whether global administrative routes are enabled, consumed by the
    /// HTTP layer.
    #[serde(default)]
    pub admin_all: bool,

    /// The job-control rendezvous directory shared by cooperating instances.
    /// Defaults to `<RootDir>/job`.
    #[serde(default)]
    pub job_control: Option<PathBuf>,

    /// Days a history file remains in `history/` before shelving into
    /// `past/YYYY_MM/`.
    #[serde(default = "default_job_past_days")]
    pub job_past: u32,

    /// Disk-use watchdog settings; the watchdog is off when absent.
    #[serde(default)]
    pub disk_use: Option<DiskUseConfig>,

    /// MPI hostfile settings.
    #[serde(default)]
    pub host_file: Option<HostFileConfig>,

    /// Seconds a compute host may spend between start-script invocation and
    /// its ready probe.
    #[serde(default = "default_max_start_time")]
    pub max_start_time: u64,

    /// Seconds a compute host may spend stopping.
    #[serde(default = "default_max_stop_time")]
    pub max_stop_time: u64,

    /// Seconds a ready compute host may sit without placed jobs before it is
    /// stopped.
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time: u64,

    /// Consecutive start/stop failures before a host enters the sticky
    /// `error` state.
    #[serde(default = "default_max_compute_errors")]
    pub max_compute_errors: u32,

    /// Upper bound on modelling threads per MPI process; zero is unlimited.
    #[serde(default)]
    pub mpi_max_threads: u32,

    /// Cores available to non-MPI runs on this instance; defaults to the
    /// host's core count.
    #[serde(default)]
    pub local_cpu: Option<u32>,

    /// Memory in gigabytes available to non-MPI runs on this instance;
    /// defaults to the host's total memory.
    #[serde(default)]
    pub local_mem_gb: Option<u32>,

    /// The scheduler tick period in milliseconds.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Per-run console ring capacity, in lines.
    #[serde(default = "default_run_log_lines")]
    pub run_log_lines: usize,

    /// Seconds an unpolled console ring survives before eviction.
    #[serde(default = "default_run_log_idle_sec")]
    pub run_log_idle_sec: u64,

    /// The compute-host fleet available for MPI placement.
    #[serde(default)]
    pub compute: Vec<ComputeServerConfig>,
}

/// Disk-use watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DiskUseConfig {
    /// Seconds between storage scans.
    #[serde(default = "default_disk_scan_sec")]
    pub scan_interval_sec: u64,

    /// The storage quota in gigabytes; measured use beyond it rejects new
    /// submissions.
    pub limit_gb: u64,
}

/// MPI hostfile settings: three template strings with `@-HOST-@` and
/// `@-CORES-@` substitutions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HostFileConfig {
    /// Whether a hostfile is generated on MPI launch.
    #[serde(default)]
    pub is_use: bool,

    /// The line emitted for rank 0 (the leader host).
    #[serde(default)]
    pub root_line: String,

    /// The line emitted per worker host.
    #[serde(default)]
    pub host_line: String,

    /// When set, the `@-CORES-@` value emitted on the root line.
    #[serde(default)]
    pub cpu_cores: Option<u32>,
}

/// A compute host available for MPI placement, with its site-provided
/// start/stop helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ComputeServerConfig {
    /// The host name, as it appears in hostfiles and state files.
    pub name: String,

    /// Total cores on the host.
    pub cpu: u32,

    /// Total memory on the host, in gigabytes.
    pub mem_gb: u32,

    /// The start helper executable.
    #[serde(default)]
    pub start_exe: Option<PathBuf>,

    /// Arguments for the start helper.
    #[serde(default)]
    pub start_args: Vec<String>,

    /// The stop helper executable.
    #[serde(default)]
    pub stop_exe: Option<PathBuf>,

    /// Arguments for the stop helper.
    #[serde(default)]
    pub stop_args: Vec<String>,
}

/// Serde default for [`Config::languages`].
fn default_languages() -> String {
    "EN".to_string()
}

/// Serde default for [`Config::job_past`].
fn default_job_past_days() -> u32 {
    DEFAULT_JOB_PAST_DAYS
}

/// Serde default for [`Config::max_start_time`].
fn default_max_start_time() -> u64 {
    180
}

/// Serde default for [`Config::max_stop_time`].
fn default_max_stop_time() -> u64 {
    180
}

/// Serde default for [`Config::max_idle_time`].
fn default_max_idle_time() -> u64 {
    900
}

/// Serde default for [`Config::max_compute_errors`].
fn default_max_compute_errors() -> u32 {
    2
}

/// Serde default for [`Config::scan_interval_ms`].
fn default_scan_interval_ms() -> u64 {
    DEFAULT_SCAN_INTERVAL_MS
}

/// Serde default for [`DiskUseConfig::scan_interval_sec`].
fn default_disk_scan_sec() -> u64 {
    60
}

/// Serde default for [`Config::run_log_lines`].
fn default_run_log_lines() -> usize {
    DEFAULT_RUN_LOG_LINES
}

/// Serde default for [`Config::run_log_idle_sec`].
fn default_run_log_idle_sec() -> u64 {
    DEFAULT_RUN_LOG_IDLE_SEC
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates settings that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_start_time == 0 || self.max_stop_time == 0 || self.max_idle_time == 0 {
            bail!("MaxStartTime, MaxStopTime, and MaxIdleTime must be greater than zero");
        }

        if self.scan_interval_ms == 0 {
            bail!("ScanIntervalMs must be greater than zero");
        }

        if self.run_log_lines == 0 {
            bail!("RunLogLines must be greater than zero");
        }

        for host in &self.compute {
            if host.name.is_empty() {
                bail!("a compute host must have a name");
            }

            if host.cpu == 0 {
                bail!("compute host `{}` must have at least one core", host.name);
            }
        }

        if let Some(hf) = &self.host_file
            && hf.is_use
            && hf.host_line.is_empty()
        {
            bail!("HostFile.HostLine is required when HostFile.IsUse is set");
        }

        Ok(())
    }

    /// The effective instance name.
    pub fn instance_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
            format!("{host}_{pid}", pid = std::process::id())
        })
    }

    /// The effective models root directory.
    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("models"))
    }

    /// The effective templates directory.
    pub fn etc_dir(&self) -> PathBuf {
        self.etc_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("etc"))
    }

    /// The effective run-log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("log"))
    }

    /// The effective files directory.
    pub fn files_dir(&self) -> PathBuf {
        self.files_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("files"))
    }

    /// The effective job-control rendezvous directory.
    pub fn job_dir(&self) -> PathBuf {
        self.job_control
            .clone()
            .unwrap_or_else(|| self.root_dir.join("job"))
    }

    /// The scheduler tick period.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// The preferred languages, split from the comma list.
    pub fn language_list(&self) -> Vec<String> {
        self.languages
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn minimal_config() {
        let config: Config = toml::from_str(r#"RootDir = "/srv/models""#).unwrap();
        config.validate().unwrap();

        assert_eq!(config.model_dir(), PathBuf::from("/srv/models/models"));
        assert_eq!(config.job_dir(), PathBuf::from("/srv/models/job"));
        assert_eq!(config.language_list(), vec!["EN".to_string()]);
        assert_eq!(config.scan_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn unknown_keys_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str(
            r#"
            RootDir = "/srv/models"
            Bogus = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn full_surface() {
        let config: Config = toml::from_str(
            r#"
            RootDir = "/srv/models"
            ModelDir = "/data/models"
            EtcDir = "/srv/etc"
            LogDir = "/var/log/flywheel"
            FilesDir = "/data/files"
            Listen = "localhost:4040"
            LogRequest = true
            ApiOnly = true
            Languages = "EN, FR"
            AdminAll = true
            JobControl = "/shared/job"
            JobPast = 30
            MaxStartTime = 60
            MaxStopTime = 60
            MaxIdleTime = 300
            MaxComputeErrors = 3
            MpiMaxThreads = 8

            [DiskUse]
            ScanIntervalSec = 120
            LimitGb = 500

            [HostFile]
            IsUse = true
            RootLine = "localhost slots=1"
            HostLine = "@-HOST-@ slots=@-CORES-@"

            [[Compute]]
            Name = "cpc-1"
            Cpu = 16
            MemGb = 64
            StartExe = "/srv/etc/compute-start.sh"
            StartArgs = ["cpc-1"]
            StopExe = "/srv/etc/compute-stop.sh"
            StopArgs = ["cpc-1"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.language_list(), vec!["EN".to_string(), "FR".to_string()]);
        assert_eq!(config.compute.len(), 1);
        assert_eq!(config.compute[0].cpu, 16);
        assert_eq!(config.job_dir(), PathBuf::from("/shared/job"));
    }

    #[test]
    fn zero_fleet_deadline_rejected() {
        let config: Config = toml::from_str(
            r#"
            RootDir = "/srv/models"
            MaxStartTime = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn hostfile_requires_host_line() {
        let config: Config = toml::from_str(
            r#"
            RootDir = "/srv/models"

            [HostFile]
            IsUse = true
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
