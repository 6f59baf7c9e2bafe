//! Model catalog: discovery of model databases on disk.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use walkdir::WalkDir;

use crate::db::ModelDb;
use crate::launch::pid_alive;

/// The file extension of model databases.
const MODEL_DB_EXTENSION: &str = "sqlite";

/// Basic facts about a known model, as surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelBasic {
    /// The stable content digest; the preferred lookup key.
    pub digest: String,
    /// The human model name; not guaranteed unique.
    pub name: String,
    /// The model version string.
    pub version: String,
    /// The default language code.
    pub default_lang: String,
    /// The model database file.
    pub db_path: PathBuf,
    /// The directory of the model binary.
    pub bin_dir: PathBuf,
    /// Memory footprint hint: megabytes per model process.
    pub process_mem_mb: u64,
    /// Memory footprint hint: megabytes per modelling thread.
    pub thread_mem_mb: u64,
}

impl ModelBasic {
    /// The expected model executable path: the model name next to its
    /// database.
    pub fn exe_path(&self) -> PathBuf {
        self.bin_dir.join(&self.name)
    }
}

/// An exclusive sidecar lock on a model database.
///
/// Created with `create_new`, so a second instance opening the same database
/// fails fast instead of silently sharing it. The lock body records the pid
/// and instance name; a lock whose pid is dead on this host is reclaimed.
#[derive(Debug)]
struct ModelLock {
    /// The lock file path.
    path: PathBuf,
}

/// The JSON body of a model lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    /// The locking process id.
    pid: u32,
    /// The locking instance name.
    oms: String,
}

impl ModelLock {
    /// Acquires the lock for a database, reclaiming a stale one.
    fn acquire(db_path: &Path, oms: &str) -> Result<Self> {
        let path = db_path.with_extension("sqlite.lock");
        let body = serde_json::to_vec(&LockBody {
            pid: std::process::id(),
            oms: oms.to_string(),
        })?;

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&body)?;
                return Ok(Self { path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to create model lock `{}`", path.display())
                });
            }
        }

        // the lock exists: reclaim it only if its owner is gone
        let holder: Option<LockBody> = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        if let Some(holder) = &holder
            && pid_alive(holder.pid)
        {
            anyhow::bail!(
                "model database `{}` is locked by instance `{}` (pid {})",
                db_path.display(),
                holder.oms,
                holder.pid
            );
        }

        warn!(
            lock = %path.display(),
            "reclaiming stale model lock from a dead process"
        );
        fs::remove_file(&path)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to reclaim model lock `{}`", path.display()))?;
        file.write_all(&body)?;
        Ok(Self { path })
    }
}

impl Drop for ModelLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to remove model lock");
        }
    }
}

/// A known model: its facts, its open database, and its exclusive lock.
#[derive(Debug)]
pub struct ModelEntry {
    /// Client-facing facts.
    pub basic: ModelBasic,
    /// The open database.
    pub db: ModelDb,
    /// Held for the lifetime of the entry.
    _lock: ModelLock,
}

/// The in-memory registry of models discovered under the models root.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    /// Known models, keyed by digest.
    by_digest: HashMap<String, ModelEntry>,
}

impl ModelCatalog {
    /// Walks the models root for `.sqlite` files and opens each exactly once.
    ///
    /// Databases that fail to open, fail their schema check, or are locked by
    /// another instance are logged and skipped. Duplicate digests are skipped
    /// with a log line; the first occurrence wins.
    pub async fn discover(model_dir: &Path, oms: &str) -> Result<Self> {
        let mut catalog = Self::default();

        for entry in WalkDir::new(model_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(MODEL_DB_EXTENSION)
            {
                continue;
            }

            if let Err(e) = catalog.add(path, oms).await {
                warn!(db = %path.display(), error = %e, "skipping model database");
            }
        }

        info!(
            count = catalog.by_digest.len(),
            dir = %model_dir.display(),
            "model discovery complete"
        );

        Ok(catalog)
    }

    /// Opens one model database and registers it.
    pub async fn add(&mut self, db_path: &Path, oms: &str) -> Result<()> {
        let lock = ModelLock::acquire(db_path, oms)?;
        let db = ModelDb::open(db_path).await?;
        let row = db.model_row().await?;

        if self.by_digest.contains_key(&row.digest) {
            db.close().await;
            anyhow::bail!(
                "digest `{}` already known, first occurrence wins",
                row.digest
            );
        }

        let bin_dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        info!(model = %row.name, digest = %row.digest, "model added");

        self.by_digest.insert(
            row.digest.clone(),
            ModelEntry {
                basic: ModelBasic {
                    digest: row.digest,
                    name: row.name,
                    version: row.version,
                    default_lang: row.default_lang,
                    db_path: db_path.to_path_buf(),
                    bin_dir,
                    process_mem_mb: row.process_mem_mb,
                    thread_mem_mb: row.thread_mem_mb,
                },
                db,
                _lock: lock,
            },
        );

        Ok(())
    }

    /// Lists the facts of every known model.
    pub fn list(&self) -> Vec<ModelBasic> {
        let mut out: Vec<ModelBasic> = self.by_digest.values().map(|e| e.basic.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Looks a model up by digest.
    pub fn by_digest(&self, digest: &str) -> Option<&ModelEntry> {
        self.by_digest.get(digest)
    }

    /// Looks a model up by name.
    ///
    /// With duplicate names the result is unspecified; callers should prefer
    /// digests.
    pub fn by_name(&self, name: &str) -> Option<&ModelEntry> {
        self.by_digest.values().find(|e| e.basic.name == name)
    }

    /// Closes one model; subsequent operations through it fail with a clean
    /// not-found.
    pub async fn close(&mut self, digest: &str) -> bool {
        match self.by_digest.remove(digest) {
            Some(entry) => {
                entry.db.close().await;
                info!(digest, "model closed");
                true
            }
            None => false,
        }
    }

    /// Closes every model; used at shutdown.
    pub async fn close_all(&mut self) {
        for (_, entry) in self.by_digest.drain() {
            entry.db.close().await;
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::db::test::create_model_db;

    #[tokio::test]
    async fn discover_dedupes_by_digest() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("nested");
        fs::create_dir_all(&sub).unwrap();

        create_model_db(&tmp.path().join("One.sqlite"), "One", "digest-1").await;
        create_model_db(&sub.join("Two.sqlite"), "Two", "digest-2").await;
        // same digest as One, must be skipped
        create_model_db(&sub.join("Copy.sqlite"), "OneCopy", "digest-1").await;

        let mut catalog = ModelCatalog::discover(tmp.path(), "test").await.unwrap();
        let names: Vec<String> = catalog.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["One", "Two"]);

        assert!(catalog.by_digest("digest-1").is_some());
        assert!(catalog.by_name("Two").is_some());
        assert!(catalog.by_digest("missing").is_none());

        catalog.close_all().await;
    }

    #[tokio::test]
    async fn close_makes_model_unknown() {
        let tmp = TempDir::new().unwrap();
        create_model_db(&tmp.path().join("One.sqlite"), "One", "digest-1").await;

        let mut catalog = ModelCatalog::discover(tmp.path(), "test").await.unwrap();
        assert!(catalog.close("digest-1").await);
        assert!(catalog.by_digest("digest-1").is_none());
        assert!(!catalog.close("digest-1").await);
    }

    #[tokio::test]
    async fn lock_blocks_second_opener() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("One.sqlite");
        create_model_db(&db_path, "One", "digest-1").await;

        let _held = ModelLock::acquire(&db_path, "first").unwrap();
        let second = ModelLock::acquire(&db_path, "second");
        assert!(second.is_err(), "a live lock must not be shareable");
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("One.sqlite");
        create_model_db(&db_path, "One", "digest-1").await;

        // a lock held by a pid that cannot exist
        let lock_path = db_path.with_extension("sqlite.lock");
        fs::write(
            &lock_path,
            serde_json::to_vec(&LockBody {
                pid: u32::MAX - 1,
                oms: "gone".into(),
            })
            .unwrap(),
        )
        .unwrap();

        let reclaimed = ModelLock::acquire(&db_path, "second");
        assert!(reclaimed.is_ok(), "a dead owner's lock must be reclaimable");
    }
}
