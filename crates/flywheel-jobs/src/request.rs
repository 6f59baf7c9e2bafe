//! Model-run requests as submitted by clients.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::JobError;
use crate::Result;

/// The option-key namespace that controls the model runtime.
pub const MODEL_OPTION_PREFIX: &str = "OpenM.";

/// Option keys the scheduler always appends to a launch; client-supplied
/// values for these (or any `Log*`/`Database`/`ImportDb.` key) are forbidden
/// because the scheduler must stay in control of run identity and logging.
pub const RUN_STAMP_OPTION: &str = "-OpenM.RunStamp";

/// A request to execute a model.
///
/// The option map is opaque to the scheduler except for the forbidden keys
/// checked by [`RunRequest::validate`]; everything else is passed through to
/// the model process verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RunRequest {
    /// The digest of the model to run.
    pub model_digest: String,

    /// The model name, as known to the model catalog.
    #[serde(default)]
    pub model_name: String,

    /// An optional caller-chosen run stamp; generated when absent.
    #[serde(default)]
    pub run_stamp: Option<String>,

    /// The working directory for the model process.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Model options, e.g. `-OpenM.Threads` or `-Parameter.Ratio`.
    #[serde(default)]
    pub opts: BTreeMap<String, String>,

    /// Extra environment variables for the model process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// The number of modelling threads per process.
    #[serde(default)]
    pub threads: u32,

    /// Whether the run spans multiple processes over MPI.
    #[serde(default)]
    pub is_mpi: bool,

    /// The number of MPI processes; an MPI job is characterized by a value
    /// greater than zero.
    #[serde(default)]
    pub mpi_np: u32,

    /// Whether MPI worker ranks may be placed on the root (leader) host.
    #[serde(default = "default_true")]
    pub mpi_on_root: bool,

    /// The launch template name; resolved against the templates directory
    /// when absent.
    #[serde(default)]
    pub template: Option<String>,

    /// Output tables to retain; when non-empty the scheduler generates an ini
    /// file with a `[Tables] Retain` entry.
    #[serde(default)]
    pub tables: Vec<String>,

    /// An opaque microdata selection, passed through to the data layer.
    #[serde(default)]
    pub microdata: Option<serde_json::Value>,

    /// Run notes in markdown, keyed by language code.
    #[serde(default)]
    pub run_notes: BTreeMap<String, String>,
}

/// Returns `true`; serde default for `mpi_on_root`.
fn default_true() -> bool {
    true
}

impl RunRequest {
    /// Validates the request shape: forbidden option keys and an expressible
    /// resource envelope.
    ///
    /// Returns [`JobError::BadArgument`] without any side effect on failure.
    pub fn validate(&self) -> Result<()> {
        if self.model_digest.is_empty() {
            return Err(JobError::BadArgument("model digest is empty".into()));
        }

        if let Some(key) = self.opts.keys().find(|k| is_forbidden_option(k)) {
            return Err(JobError::BadArgument(format!(
                "option key `{key}` is reserved for the scheduler"
            )));
        }

        if self.is_mpi && self.mpi_np == 0 {
            return Err(JobError::BadArgument(
                "an MPI run requires a process count greater than zero".into(),
            ));
        }

        if let Some(stamp) = &self.run_stamp
            && crate::stamp::to_millis(stamp).is_none()
        {
            return Err(JobError::BadArgument(format!(
                "run stamp `{stamp}` does not follow the YYYY_MM_DD_hh_mm_ss_SSS format"
            )));
        }

        Ok(())
    }

    /// The effective number of processes: at least one, `mpi_np` for MPI runs.
    pub fn process_count(&self) -> u32 {
        if self.is_mpi { self.mpi_np.max(1) } else { 1 }
    }

    /// The effective number of threads per process: at least one.
    pub fn thread_count(&self) -> u32 {
        self.threads.max(1)
    }
}

/// Returns `true` for option keys the scheduler refuses to accept from
/// clients.
///
/// Keys are compared after stripping leading dashes and, for model options,
/// the `OpenM.` namespace: `Log*` and `Database` are overridden by the
/// scheduler, and anything under `ImportDb.` would redirect database access.
pub fn is_forbidden_option(key: &str) -> bool {
    let key = key.trim_start_matches('-');

    let rest = key
        .strip_prefix(MODEL_OPTION_PREFIX)
        .or_else(|| {
            // the namespace is matched case-insensitively, as model options are
            key.get(..MODEL_OPTION_PREFIX.len())
                .filter(|p| p.eq_ignore_ascii_case(MODEL_OPTION_PREFIX))
                .map(|_| &key[MODEL_OPTION_PREFIX.len()..])
        })
        .unwrap_or(key);

    let lower = rest.to_ascii_lowercase();
    lower.starts_with("log") || lower == "database" || lower.starts_with("importdb.")
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A minimal valid request for tests.
    fn request() -> RunRequest {
        RunRequest {
            model_digest: "abc123".into(),
            model_name: "RiskPaths".into(),
            ..Default::default()
        }
    }

    #[test]
    fn forbidden_keys() {
        for key in [
            "-OpenM.LogToConsole",
            "-OpenM.LogToFile",
            "-OpenM.LogFilePath",
            "OpenM.Database",
            "-openm.database",
            "-ImportDb.modelOne",
            "ImportDb.Extra.Database",
        ] {
            assert!(is_forbidden_option(key), "{key} should be forbidden");
        }

        for key in ["-OpenM.Threads", "-Parameter.Ratio", "-OpenM.SubValues"] {
            assert!(!is_forbidden_option(key), "{key} should be allowed");
        }
    }

    #[test]
    fn validate_rejects_forbidden_key() {
        let mut req = request();
        req.opts
            .insert("-OpenM.LogToFile".into(), "true".into());
        assert!(matches!(req.validate(), Err(JobError::BadArgument(_))));
    }

    #[test]
    fn validate_rejects_zero_np_mpi() {
        let mut req = request();
        req.is_mpi = true;
        req.mpi_np = 0;
        assert!(matches!(req.validate(), Err(JobError::BadArgument(_))));
    }

    #[test]
    fn validate_rejects_bad_run_stamp() {
        let mut req = request();
        req.run_stamp = Some("not-a-stamp".into());
        assert!(matches!(req.validate(), Err(JobError::BadArgument(_))));
    }

    #[test]
    fn effective_counts() {
        let mut req = request();
        assert_eq!(req.process_count(), 1);
        assert_eq!(req.thread_count(), 1);

        req.is_mpi = true;
        req.mpi_np = 4;
        req.threads = 2;
        assert_eq!(req.process_count(), 4);
        assert_eq!(req.thread_count(), 2);
    }
}
