//! Restart policy bookkeeping: attempt budgets and exponential backoff.

use std::time::Duration;

use berth_common::config::OrchestratorConfig;
use berth_common::types::RestartPolicy;

/// Exponential backoff that doubles up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// Starts at `initial`, never exceeding `ceiling`.
    #[must_use]
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            next: initial.min(ceiling),
            ceiling,
        }
    }

    /// Returns the next delay and doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.ceiling);
        delay
    }
}

/// Decides whether a failed bring-up attempt is retried.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    budget: Option<u32>,
    used: u32,
    backoff: Backoff,
}

impl RetryPlan {
    /// Builds the plan for a service's restart policy.
    #[must_use]
    pub fn new(policy: RestartPolicy, config: &OrchestratorConfig) -> Self {
        Self {
            budget: policy.attempt_budget(config.on_failure_attempts),
            used: 0,
            backoff: Backoff::new(config.backoff_initial, config.backoff_ceiling),
        }
    }

    /// Records one failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the
    /// budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.used = self.used.saturating_add(1);
        match self.budget {
            Some(budget) if self.used >= budget => None,
            _ => Some(self.backoff.next_delay()),
        }
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }
}
