//! Formjobs Library
//!
//! Lifecycle and polling of remote form-automation jobs: persisted job state,
//! the HTTP client for the automation service, per-job polling loops with a
//! silence-based completion heuristic, and the controller tying them together.

pub mod config;
pub mod controller;
pub mod error;
pub mod heuristic;
pub mod job_store;
pub mod poller;
pub mod remote;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use controller::JobController;
pub use error::JobError;
pub use heuristic::{CompletionHeuristic, Decision};
pub use job_store::{Job, JobKind, JobStatus, JobStore, SqliteJobStore};
pub use poller::{JobListener, JobSnapshot, LoggingListener, Poller};
pub use remote::{HttpRemoteJobClient, RemoteJobClient};
