//! Disk-use watchdog: periodic size scans gating new submissions.

use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::DiskUseConfig;

/// Sums the apparent size of every file under the given directories.
///
/// Missing directories count as zero; unreadable entries are skipped.
pub fn measure(dirs: &[PathBuf]) -> u64 {
    let mut total = 0u64;

    for dir in dirs {
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file()
                && let Ok(meta) = entry.metadata()
            {
                total += meta.len();
            }
        }
    }

    total
}

/// The disk-use watchdog.
///
/// While use exceeds the quota new submissions are rejected; active runs are
/// never touched.
#[derive(Debug)]
pub struct DiskWatch {
    /// Scanned directories.
    dirs: Vec<PathBuf>,
    /// The quota in bytes.
    limit_bytes: u64,
    /// Interval between scans.
    interval: Duration,
    /// When the last scan ran.
    last_scan: Option<Instant>,
    /// The last measured total, in bytes.
    total_bytes: u64,
    /// Whether the last measurement exceeded the quota.
    over_quota: bool,
}

impl DiskWatch {
    /// Builds a watchdog from configuration; `None` disables it.
    pub fn new(config: Option<&DiskUseConfig>, dirs: Vec<PathBuf>) -> Option<Self> {
        let config = config?;
        Some(Self {
            dirs,
            limit_bytes: config.limit_gb * 1024 * 1024 * 1024,
            interval: Duration::from_secs(config.scan_interval_sec.max(1)),
            last_scan: None,
            total_bytes: 0,
            over_quota: false,
        })
    }

    /// Whether the last scan found use over the quota.
    pub fn over_quota(&self) -> bool {
        self.over_quota
    }

    /// The last measured total, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Scans when the interval has elapsed; returns `true` after a scan.
    pub fn maybe_scan(&mut self, now: Instant) -> bool {
        if self
            .last_scan
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return false;
        }

        self.last_scan = Some(now);
        self.total_bytes = measure(&self.dirs);
        let was_over = self.over_quota;
        self.over_quota = self.total_bytes > self.limit_bytes;

        if self.over_quota && !was_over {
            warn!(
                total_bytes = self.total_bytes,
                limit_bytes = self.limit_bytes,
                "storage quota exceeded, rejecting new submissions"
            );
        } else if !self.over_quota && was_over {
            debug!(total_bytes = self.total_bytes, "storage back under quota");
        }

        true
    }

    /// Forces a scan on the next [`DiskWatch::maybe_scan`] call.
    pub fn invalidate(&mut self) {
        self.last_scan = None;
    }
}

/// Formats a rejection reason for an over-quota submit.
pub fn quota_reason(watch: &DiskWatch) -> String {
    format!(
        "storage quota exceeded: {} bytes in use",
        watch.total_bytes()
    )
}
