//! Public control surface of the job lifecycle subsystem.

mod lifecycle;

pub use lifecycle::JobController;
