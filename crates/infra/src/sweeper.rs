//! Background status sweeper.
//!
//! Each pass, across all tenants:
//! - reconciles attempts left pending past the reconciliation timeout,
//! - polls `submitted` registrations for the upstream decision, at most once
//!   per poll interval,
//! - re-drives `brand_pending` / `campaign_pending` registrations whose last
//!   call failed retriably, once their backoff has elapsed.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use dialtone_compliance::{
    A2pRegistration, AttemptErrorKind, AttemptStatus, AttemptType, ComplianceAttempt,
    RegistrationStatus,
};

use crate::config::SweeperConfig;
use crate::error::{ComplianceError, ComplianceResult};
use crate::orchestrator::{CAMPAIGN_POLL_PREFIX, Orchestrator};
use crate::reconcile::Reconciliation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reconciled: usize,
    pub polled: usize,
    pub retried: usize,
    pub failures: usize,
}

pub struct StatusSweeper {
    orchestrator: Arc<Orchestrator>,
    config: SweeperConfig,
}

/// Handle to stop a spawned sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Request shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "status sweeper task ended abnormally");
        }
    }
}

impl StatusSweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, config: SweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(sweeper = %self.config.name, interval = ?self.config.interval, "status sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(report) => tracing::debug!(sweeper = %self.config.name, ?report, "sweep finished"),
                            Err(err) => tracing::warn!(sweeper = %self.config.name, error = %err, "sweep failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(sweeper = %self.config.name, "status sweeper stopped");
        });
        SweeperHandle { shutdown, join }
    }

    /// One full pass. Per-registration failures are logged and counted, not returned.
    pub async fn sweep_once(&self) -> ComplianceResult<SweepReport> {
        let mut report = SweepReport::default();
        let orchestrator = &self.orchestrator;

        for attempt in orchestrator.attempts.list_pending(None).await? {
            if !orchestrator.reconciler.is_expired(&attempt) {
                continue;
            }
            let key = attempt.id.key();
            match orchestrator.reconciler.reconcile(attempt).await {
                Ok(Reconciliation::Resolved(resolved)) => {
                    report.reconciled += 1;
                    if let Err(err) = orchestrator.absorb(&resolved).await {
                        report.failures += 1;
                        tracing::warn!(attempt_id = %key, error = %err, "failed to apply reconciled attempt");
                    }
                }
                Ok(Reconciliation::Abandoned(_)) => report.reconciled += 1,
                Ok(Reconciliation::StillPending(_)) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(attempt_id = %key, error = %err, "reconciliation failed");
                }
            }
        }

        let registrations = orchestrator.registrations.list(None).await?;
        for registration in registrations.iter().filter(|r| r.is_active() && !r.is_terminal()) {
            let due = match registration.status {
                RegistrationStatus::Submitted => self.poll_due(registration).await?,
                RegistrationStatus::BrandPending | RegistrationStatus::CampaignPending => {
                    self.retry_due(registration).await?
                }
                RegistrationStatus::Draft
                | RegistrationStatus::Approved
                | RegistrationStatus::Rejected => false,
            };
            if !due {
                continue;
            }

            let result = orchestrator.advance(registration.tenant_id, registration.id).await;
            match (registration.status, result) {
                (RegistrationStatus::Submitted, Ok(_)) => report.polled += 1,
                (_, Ok(_)) => report.retried += 1,
                (_, Err(ComplianceError::ReconciliationRequired { attempt_id })) => {
                    tracing::debug!(registration_id = %registration.id, attempt_id, "waiting on pending attempt");
                }
                (_, Err(err)) => {
                    report.failures += 1;
                    tracing::warn!(registration_id = %registration.id, error = %err, "sweeper advance failed");
                }
            }
        }

        Ok(report)
    }

    /// Whether the last campaign decision poll is older than the poll interval.
    async fn poll_due(&self, registration: &A2pRegistration) -> ComplianceResult<bool> {
        let attempts = self
            .orchestrator
            .attempts
            .list_attempts(registration.tenant_id, registration.id)
            .await?;
        let last_poll = attempts
            .iter()
            .filter(|a| is_decision_poll(a))
            .map(|a| a.created_at)
            .max();
        let Some(last_poll) = last_poll else {
            return Ok(true);
        };
        let interval = chrono::Duration::from_std(self.config.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self.orchestrator.clock.now() >= last_poll + interval)
    }

    /// Whether the registration's last submission failed retriably and its backoff elapsed.
    async fn retry_due(&self, registration: &A2pRegistration) -> ComplianceResult<bool> {
        let attempts = self
            .orchestrator
            .attempts
            .list_attempts(registration.tenant_id, registration.id)
            .await?;
        let stage: &[AttemptType] = match registration.status {
            RegistrationStatus::BrandPending => &[AttemptType::BrandRegistration],
            _ => &[AttemptType::CampaignRegistration, AttemptType::PhoneAssignment],
        };
        let submissions: Vec<&ComplianceAttempt> = attempts
            .iter()
            .filter(|a| stage.contains(&a.attempt_type()))
            .collect();

        let failures = submissions
            .iter()
            .rev()
            .take_while(|a| is_retry_candidate(a))
            .count() as u32;
        let Some(latest) = submissions.last() else {
            return Ok(false);
        };
        if failures == 0 {
            return Ok(false);
        }

        let policy = &self.config.retry_policy;
        if !policy.should_retry(failures) {
            tracing::debug!(registration_id = %registration.id, failures, "retry budget exhausted");
            return Ok(false);
        }
        let delay = chrono::Duration::from_std(policy.delay_for_attempt(failures))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let failed_at = latest.completed_at.unwrap_or(latest.created_at);
        Ok(self.orchestrator.clock.now() >= failed_at + delay)
    }
}

fn is_decision_poll(attempt: &ComplianceAttempt) -> bool {
    attempt.attempt_type() == AttemptType::StatusCheck
        && attempt
            .id
            .slot
            .subject
            .as_deref()
            .is_some_and(|s| s.starts_with(CAMPAIGN_POLL_PREFIX))
}

fn is_retry_candidate(attempt: &ComplianceAttempt) -> bool {
    attempt.status == AttemptStatus::Error
        && matches!(
            attempt.error_kind,
            Some(AttemptErrorKind::Retriable) | Some(AttemptErrorKind::Abandoned)
        )
}
