//! Per-job polling loops.
//!
//! The [`Poller`] owns one tokio task per polled job. Each task queries the
//! remote status endpoint on a fixed tick, runs the completion heuristic on its
//! own deadline, writes results to the job store and notifies a [`JobListener`].

mod listener;
mod manager;
mod poll_loop;
mod registry;
mod timing;

pub use listener::{JobListener, JobSnapshot, LoggingListener};
pub use manager::Poller;
