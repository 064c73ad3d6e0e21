//! Completion heuristic for jobs whose remote side goes quiet.
//!
//! The automation service does not always report a terminal status before it
//! stops answering with new information. The heuristic looks at the latest
//! status message and at how long it has been unchanged, and decides whether
//! the job should be treated as completed.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::HeuristicSettings;

/// Slack added to the silence deadline so the check lands just past it.
const DEADLINE_SLACK: Duration = Duration::from_millis(1);

/// Why a job is still considered alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveReason {
    /// Message or status changed within the recent-change window.
    RecentChange,
    /// The message matches an active pattern (the source text of the pattern).
    MatchedPattern(String),
}

/// Outcome of one heuristic evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Still inside the grace period after start; nothing is inferred.
    Warmup,
    Active(ActiveReason),
    /// Quiet and not recognizably busy; completes once `remaining` runs out.
    Idle { remaining: Duration },
    /// Silent for longer than the threshold; treat the job as completed.
    ForceComplete,
}

/// Time/message-based completion inference.
#[derive(Debug, Clone)]
pub struct CompletionHeuristic {
    /// No inference before this much (unpaused) time since start.
    pub grace: Duration,
    /// A change within this window means the job is active.
    pub recent_change: Duration,
    /// Unchanged for longer than this means the job is done.
    pub silence: Duration,
    /// Cadence of checks after the grace period.
    pub check_interval: Duration,
    active_patterns: Vec<Regex>,
}

impl CompletionHeuristic {
    /// Create a new CompletionHeuristic from configuration settings.
    ///
    /// Fails if an active pattern is not a valid regular expression.
    pub fn new(settings: &HeuristicSettings) -> Result<Self> {
        let active_patterns = settings
            .active_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid active message pattern: {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            grace: Duration::from_secs(settings.grace_secs),
            recent_change: Duration::from_secs(settings.recent_change_secs),
            silence: Duration::from_secs(settings.silence_secs),
            check_interval: Duration::from_secs(settings.check_interval_secs),
            active_patterns,
        })
    }

    /// Classify a running, unpaused job.
    ///
    /// # Arguments
    /// * `message` - Latest status message, if any
    /// * `since_start` - Unpaused time since the polling loop started
    /// * `since_change` - Unpaused time since message or status last changed
    pub fn classify(
        &self,
        message: Option<&str>,
        since_start: Duration,
        since_change: Duration,
    ) -> Decision {
        if since_start < self.grace {
            return Decision::Warmup;
        }
        // silence wins even over an active-looking message: "closing browser"
        // followed by nothing is the usual way a job ends
        if since_change >= self.silence {
            return Decision::ForceComplete;
        }
        if since_change < self.recent_change {
            return Decision::Active(ActiveReason::RecentChange);
        }
        if let Some(pattern) = message.and_then(|m| self.matching_pattern(m)) {
            return Decision::Active(ActiveReason::MatchedPattern(pattern.as_str().to_string()));
        }
        Decision::Idle {
            remaining: self.silence - since_change,
        }
    }

    /// Delay until the next evaluation after a non-terminal decision.
    ///
    /// Normally `check_interval`, shortened so the silence deadline is never overshot.
    pub fn next_check_in(&self, since_change: Duration) -> Duration {
        match self.silence.checked_sub(since_change) {
            Some(remaining) => self
                .check_interval
                .min(remaining + DEADLINE_SLACK)
                .max(DEADLINE_SLACK),
            None => DEADLINE_SLACK,
        }
    }

    /// True if `message` looks like the job is busy.
    pub fn is_active_message(&self, message: &str) -> bool {
        self.matching_pattern(message).is_some()
    }

    fn matching_pattern(&self, message: &str) -> Option<&Regex> {
        self.active_patterns.iter().find(|re| re.is_match(message))
    }
}
