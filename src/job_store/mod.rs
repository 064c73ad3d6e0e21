//! Persisted, owner-namespaced job store.

mod models;
mod schema;
mod store;

pub use models::{unix_now, Job, JobKind, JobProgress, JobStatus, ResumeContext, SubProgress};
pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use store::{JobStore, SqliteJobStore, JOB_DB_FILE_NAME};
