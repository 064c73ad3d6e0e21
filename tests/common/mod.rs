//! Common test infrastructure
//!
//! Builds a [`JobController`] over an in-memory job store, a scripted remote
//! service and a listener that records every callback.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{Harness, OWNER_A};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_start() {
//!     let harness = Harness::for_owner(OWNER_A);
//!     let job = harness.controller.start_single("https://example.com", Default::default()).await.unwrap();
//!     assert!(harness.controller.poller().is_active(&job.job_id));
//! }
//! ```

mod fixtures;
mod listener;
mod remote;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use listener::{ErrorEvent, RecordingListener};
#[allow(unused_imports)]
pub use remote::ScriptedRemote;
