//! Narrow model-database contract.
//!
//! The scheduler treats a model database as an opaque store with exactly the
//! operations below: verify the schema version, read the model identity row,
//! and record a run's terminal status. Everything else about the schema
//! belongs to the out-of-scope data layer.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;

use flywheel_jobs::job::RunStatus;
use flywheel_jobs::stamp;

/// The model schema version this server understands, checked against
/// `pragma user_version` on open.
pub const SCHEMA_VERSION: i64 = 102;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Configure a 5-second timeout when the database is locked to ride out
/// transaction contention with the data layer.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// The identity row of a model database.
#[derive(Debug, Clone)]
pub struct ModelRow {
    /// The model name.
    pub name: String,
    /// The stable content digest.
    pub digest: String,
    /// The model version string.
    pub version: String,
    /// The default language code.
    pub default_lang: String,
    /// Memory footprint hint: megabytes per model process.
    pub process_mem_mb: u64,
    /// Memory footprint hint: megabytes per modelling thread.
    pub thread_mem_mb: u64,
}

/// An open model database.
#[derive(Debug, Clone)]
pub struct ModelDb {
    /// The underlying connection pool.
    pool: SqlitePool,
    /// The database file path.
    path: PathBuf,
}

impl ModelDb {
    /// Opens a model database and verifies its schema version.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let url = format!("{SQLITE_CONNECTION_PREFIX}//{}", path.display());

        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database path `{}`", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("failed to open model database `{}`", path.display()))?;

        let db = Self {
            pool,
            path: path.to_path_buf(),
        };

        let version = db.schema_version().await?;
        if version != SCHEMA_VERSION {
            db.close().await;
            bail!(
                "model database `{}` has schema version {version}, expected {SCHEMA_VERSION}",
                path.display()
            );
        }

        Ok(db)
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the schema version from `pragma user_version`.
    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("pragma user_version")
            .fetch_one(&self.pool)
            .await
            .context("failed to read schema version")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Reads the model identity row.
    pub async fn model_row(&self) -> Result<ModelRow> {
        let row = sqlx::query(
            "select model_name, model_digest, model_version, default_lang, \
             process_mem_mb, thread_mem_mb \
             from model_dic limit 1",
        )
        .fetch_optional(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to read model identity from `{}`",
                self.path.display()
            )
        })?;

        let row = row.ok_or_else(|| {
            anyhow::anyhow!("model database `{}` has no model row", self.path.display())
        })?;

        Ok(ModelRow {
            name: row.get("model_name"),
            digest: row.get("model_digest"),
            version: row.get("model_version"),
            default_lang: row.get("default_lang"),
            process_mem_mb: row.get::<i64, _>("process_mem_mb").max(0) as u64,
            thread_mem_mb: row.get::<i64, _>("thread_mem_mb").max(0) as u64,
        })
    }

    /// Records a run's terminal status by run stamp.
    ///
    /// A missing run row is not an error: the model may have exited before
    /// writing it.
    pub async fn update_run_status(&self, run_stamp: &str, status: RunStatus) -> Result<()> {
        sqlx::query("update run_lst set status = ?, update_dt = ? where run_stamp = ?")
            .bind(status.to_string())
            .bind(stamp::now_stamp())
            .bind(run_stamp)
            .execute(&self.pool)
            .await
            .with_context(|| {
                format!(
                    "failed to update run `{run_stamp}` status in `{}`",
                    self.path.display()
                )
            })?;

        Ok(())
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}


#[cfg(test)]
impl ModelDb {
    /// Test-only access to the pool.
    pub(crate) fn pool_for_test(&self) -> &SqlitePool {
        &self.pool
    }
}
