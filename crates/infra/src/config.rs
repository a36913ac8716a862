//! Runtime knobs for the orchestrator and the status sweeper.

use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pending attempts younger than this are never abandoned.
    pub reconciliation_timeout: Duration,
    /// Re-read/re-evaluate rounds before a lost CAS surfaces as `Conflict`.
    pub max_cas_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconciliation_timeout: Duration::from_secs(900),
            max_cas_retries: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_reconciliation_timeout(mut self, timeout: Duration) -> Self {
        self.reconciliation_timeout = timeout;
        self
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    pub(crate) fn reconciliation_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reconciliation_timeout).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Minimum spacing of decision polls for one submitted registration.
    pub poll_interval: Duration,
    /// Backoff between sweeper-driven retries of a failed step.
    pub retry_policy: RetryPolicy,
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(900),
            retry_policy: RetryPolicy::exponential(8, Duration::from_secs(30), Duration::from_secs(3600)),
            name: "status-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
