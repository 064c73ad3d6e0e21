use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::listener::JobListener;
use super::timing::PollTiming;

/// Loop registry keyed by job id. At most one entry, and so at most one live
/// loop, per job.
pub(crate) type Registry = Arc<Mutex<HashMap<String, LoopEntry>>>;

/// A spawned polling task.
pub(crate) struct ActiveLoop {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl ActiveLoop {
    /// Cancel the task and wait until it can no longer write or call back.
    ///
    /// When called from a callback of the same loop the wait is skipped; the
    /// loop sees the cancelled token as soon as the callback returns.
    pub fn halt(self, gate: &Mutex<()>) {
        self.cancel.cancel();
        let reentrant = tokio::task::try_id() == Some(self.handle.id());
        self.handle.abort();
        if !reentrant {
            drop(gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

pub(crate) enum LoopState {
    Active(ActiveLoop),
    Paused,
}

pub(crate) struct LoopEntry {
    pub owner_id: String,
    pub listener: Arc<dyn JobListener>,
    /// Shared with the task; kept across pause/resume.
    pub timing: Arc<Mutex<PollTiming>>,
    /// Held by the task while it writes the store and calls the listener.
    pub gate: Arc<Mutex<()>>,
    pub state: LoopState,
}

impl LoopEntry {
    pub fn new(owner_id: &str, listener: Arc<dyn JobListener>, timing: PollTiming) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            listener,
            timing: Arc::new(Mutex::new(timing)),
            gate: Arc::new(Mutex::new(())),
            state: LoopState::Paused,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LoopState::Active(_))
    }
}
