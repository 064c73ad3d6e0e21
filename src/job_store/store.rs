//! Job storage and persistence.
//!
//! Provides SQLite-backed storage for jobs and the per-surface active pointers,
//! namespaced by owner.

use super::models::*;
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use crate::config::StoreSettings;
use crate::error::JobError;
use crate::sqlite_persistence::{migrate_if_needed, read_schema_version};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const JOB_DB_FILE_NAME: &str = "jobs.db";

/// Trait for job storage operations.
///
/// Every method is scoped to one owner; jobs of other owners are never
/// returned or modified. Calls are synchronous and do no network I/O.
pub trait JobStore: Send + Sync {
    // === Whole-set access ===

    /// Load all jobs of an owner, pruning stale terminal jobs first.
    fn load(&self, owner_id: &str) -> Result<Vec<Job>>;

    /// Replace the owner's full job set.
    fn save(&self, owner_id: &str, jobs: &[Job]) -> Result<()>;

    // === Active pointers ===

    fn load_pointer(&self, owner_id: &str, kind: JobKind) -> Result<Option<String>>;

    /// Set or clear (`None`) the active job of a surface.
    fn save_pointer(&self, owner_id: &str, kind: JobKind, job_id: Option<&str>) -> Result<()>;

    // === Record-level access ===

    fn get_job(&self, owner_id: &str, job_id: &str) -> Result<Option<Job>>;

    /// Insert or replace a single job.
    fn upsert_job(&self, owner_id: &str, job: &Job) -> Result<()>;

    /// Atomically read, mutate and write back a job.
    ///
    /// Returns the updated job, or `None` if the owner has no such job. If
    /// `mutate` fails nothing is written and its error is returned.
    fn update_job(
        &self,
        owner_id: &str,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Option<Job>>;

    /// Delete every job of a surface and clear its pointer. Returns the number deleted.
    fn delete_jobs(&self, owner_id: &str, kind: JobKind) -> Result<usize>;

    /// Delete terminal jobs older than the configured age. Returns the number deleted.
    fn prune_stale(&self, owner_id: &str, now: i64) -> Result<usize>;
}

/// SQLite implementation of [`JobStore`].
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    stale_after_secs: i64,
}

impl SqliteJobStore {
    /// Create a new SqliteJobStore.
    ///
    /// Opens an existing database or creates a new one with the current schema.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `settings` - Store settings (staleness window)
    pub fn new<P: AsRef<Path>>(db_path: P, settings: &StoreSettings) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            JOB_STORE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new job database at {:?}", db_path.as_ref());
            conn
        };

        let version = read_schema_version(&conn, JOB_STORE_VERSIONED_SCHEMAS)
            .with_context(|| format!("Unusable job database at {:?}", db_path.as_ref()))?;

        JOB_STORE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        migrate_if_needed(&conn, JOB_STORE_VERSIONED_SCHEMAS, version)?;

        Ok(Self::from_connection(conn, settings))
    }

    /// Open `jobs.db` inside `db_dir`, creating the directory if needed.
    pub fn open_in_dir<P: AsRef<Path>>(db_dir: P, settings: &StoreSettings) -> Result<Self> {
        std::fs::create_dir_all(db_dir.as_ref())
            .with_context(|| format!("Failed to create db dir {:?}", db_dir.as_ref()))?;
        Self::new(db_dir.as_ref().join(JOB_DB_FILE_NAME), settings)
    }

    /// Create an in-memory store, for tests and ephemeral use.
    pub fn in_memory(settings: &StoreSettings) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_STORE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(Self::from_connection(conn, settings))
    }

    fn from_connection(conn: Connection, settings: &StoreSettings) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            stale_after_secs: settings.stale_after_secs(),
        }
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        Ok(Job {
            job_id: row.get("job_id")?,
            owner_id: row.get("owner_id")?,
            kind: JobKind::from_str(&kind).ok_or_else(|| invalid_text("kind", kind.clone()))?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| invalid_text("status", status.clone()))?,
            paused: row.get::<_, i64>("paused")? != 0,
            created_at: row.get("created_at")?,
            last_updated_at: row.get("last_updated_at")?,
            ended_at: row.get("ended_at")?,
            progress: json_column(row, "progress")?.unwrap_or_default(),
            message: row.get("message")?,
            pause_reason: row.get("pause_reason")?,
            resume_context: json_column(row, "resume_context")?,
        })
    }

    fn write_job(tx: &Transaction, owner_id: &str, job: &Job) -> Result<()> {
        if job.owner_id != owner_id {
            return Err(JobError::OwnershipViolation {
                job_id: job.job_id.clone(),
                owner_id: owner_id.to_string(),
            }
            .into());
        }
        let existing_owner: Option<String> = tx
            .query_row(
                "SELECT owner_id FROM jobs WHERE job_id = ?1",
                params![job.job_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_owner) = existing_owner {
            if existing_owner != owner_id {
                return Err(JobError::OwnershipViolation {
                    job_id: job.job_id.clone(),
                    owner_id: owner_id.to_string(),
                }
                .into());
            }
        }

        let progress = serde_json::to_string(&job.progress)?;
        let resume_context = job
            .resume_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT OR REPLACE INTO jobs (job_id, owner_id, kind, status, paused, created_at,
                last_updated_at, ended_at, progress, message, pause_reason, resume_context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.job_id,
                job.owner_id,
                job.kind.as_str(),
                job.status.as_str(),
                job.paused as i64,
                job.created_at,
                job.last_updated_at,
                job.ended_at,
                progress,
                job.message,
                job.pause_reason,
                resume_context,
            ],
        )?;
        Ok(())
    }

    fn query_job(conn: &Connection, owner_id: &str, job_id: &str) -> Result<Option<Job>> {
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE owner_id = ?1 AND job_id = ?2",
                params![owner_id, job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn prune_locked(&self, conn: &Connection, owner_id: &str, now: i64) -> Result<usize> {
        let cutoff = now.saturating_sub(self.stale_after_secs);
        let deleted = conn.execute(
            "DELETE FROM jobs
             WHERE owner_id = ?1 AND status != ?2 AND paused = 0
               AND COALESCE(ended_at, created_at) < ?3",
            params![owner_id, JobStatus::Running.as_str(), cutoff],
        )?;
        if deleted > 0 {
            // pointers to pruned jobs would dangle
            conn.execute(
                "DELETE FROM active_pointers
                 WHERE owner_id = ?1 AND job_id NOT IN (SELECT job_id FROM jobs)",
                params![owner_id],
            )?;
            info!("Pruned {} stale jobs for owner {}", deleted, owner_id);
        }
        Ok(deleted)
    }
}

fn invalid_text(column: &str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {} value '{}'", column, value).into(),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(column)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

impl JobStore for SqliteJobStore {
    fn load(&self, owner_id: &str) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        self.prune_locked(&conn, owner_id, unix_now())?;

        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE owner_id = ?1 ORDER BY created_at, job_id")?;
        let jobs = stmt
            .query_map(params![owner_id], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<Job>>>()?;

        Ok(jobs
            .into_iter()
            .filter(|job| {
                let owned = job.owner_id == owner_id;
                if !owned {
                    warn!(
                        "Dropping job {} of owner {} from load of owner {}",
                        job.job_id, job.owner_id, owner_id
                    );
                }
                owned
            })
            .collect())
    }

    fn save(&self, owner_id: &str, jobs: &[Job]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobs WHERE owner_id = ?1", params![owner_id])?;
        for job in jobs {
            Self::write_job(&tx, owner_id, job)?;
        }
        tx.commit()?;
        debug!("Saved {} jobs for owner {}", jobs.len(), owner_id);
        Ok(())
    }

    fn load_pointer(&self, owner_id: &str, kind: JobKind) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let job_id = conn
            .query_row(
                "SELECT job_id FROM active_pointers WHERE owner_id = ?1 AND kind = ?2",
                params![owner_id, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(job_id)
    }

    fn save_pointer(&self, owner_id: &str, kind: JobKind, job_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match job_id {
            Some(job_id) => {
                conn.execute(
                    "INSERT INTO active_pointers (owner_id, kind, job_id, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(owner_id, kind) DO UPDATE SET
                        job_id = excluded.job_id, updated_at = excluded.updated_at",
                    params![
                        owner_id,
                        kind.as_str(),
                        job_id,
                        unix_now()
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM active_pointers WHERE owner_id = ?1 AND kind = ?2",
                    params![owner_id, kind.as_str()],
                )?;
            }
        }
        Ok(())
    }

    fn get_job(&self, owner_id: &str, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::query_job(&conn, owner_id, job_id)
    }

    fn upsert_job(&self, owner_id: &str, job: &Job) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::write_job(&tx, owner_id, job)?;
        tx.commit()?;
        Ok(())
    }

    fn update_job(
        &self,
        owner_id: &str,
        job_id: &str,
        mutate: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let Some(mut job) = Self::query_job(&tx, owner_id, job_id)? else {
            return Ok(None);
        };
        mutate(&mut job)?;
        if job.job_id != job_id {
            bail!("Job id cannot change from {} to {}", job_id, job.job_id);
        }
        Self::write_job(&tx, owner_id, &job)?;
        tx.commit()?;
        Ok(Some(job))
    }

    fn delete_jobs(&self, owner_id: &str, kind: JobKind) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM jobs WHERE owner_id = ?1 AND kind = ?2",
            params![owner_id, kind.as_str()],
        )?;
        tx.execute(
            "DELETE FROM active_pointers WHERE owner_id = ?1 AND kind = ?2",
            params![owner_id, kind.as_str()],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn prune_stale(&self, owner_id: &str, now: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        self.prune_locked(&conn, owner_id, now)
    }
}
