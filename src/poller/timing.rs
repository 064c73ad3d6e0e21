use std::time::Duration;

use tokio::time::Instant;

use crate::heuristic::Decision;
use crate::remote::RemoteStatus;

/// Clocks and last-seen values of one polling loop.
///
/// Survives pause/resume: while paused the clocks are frozen by shifting every
/// instant forward by the paused duration on resume.
#[derive(Debug, Clone)]
pub(crate) struct PollTiming {
    pub started_at: Instant,
    /// Last time message or status changed; `None` until the first successful poll.
    pub last_change_at: Option<Instant>,
    /// Next completion-heuristic check. Starts at the end of the grace period.
    pub next_check_at: Instant,
    pub paused_at: Option<Instant>,
    pub last_status: Option<RemoteStatus>,
    pub last_message: Option<String>,
    pub consecutive_failures: u32,
    pub last_decision: Option<Decision>,
}

impl PollTiming {
    pub fn new(now: Instant, grace: Duration) -> Self {
        Self {
            started_at: now,
            last_change_at: None,
            next_check_at: now + grace,
            paused_at: None,
            last_status: None,
            last_message: None,
            consecutive_failures: 0,
            last_decision: None,
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            let paused_for = now.saturating_duration_since(paused_at);
            self.started_at += paused_for;
            self.next_check_at += paused_for;
            if let Some(changed) = self.last_change_at.as_mut() {
                *changed += paused_for;
            }
        }
    }

    /// Record a successful poll. Returns true if message or status changed.
    pub fn observe(&mut self, status: RemoteStatus, message: Option<&str>, now: Instant) -> bool {
        self.consecutive_failures = 0;
        let changed = self.last_change_at.is_none()
            || self.last_status != Some(status)
            || self.last_message.as_deref() != message;
        if changed {
            self.last_change_at = Some(now);
            self.last_status = Some(status);
            self.last_message = message.map(str::to_string);
        }
        changed
    }

    pub fn since_start(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn since_change(&self, now: Instant) -> Option<Duration> {
        self.last_change_at
            .map(|changed| now.saturating_duration_since(changed))
    }
}
