//! Resolving pending attempts, and the open/dispatch/finalize cycle around them.
//!
//! A pending attempt means a call may or may not have reached upstream. Before
//! anything else is dispatched on its slot, it is looked up by idempotency key:
//!
//! | Upstream answer | Attempt age | Result |
//! |-----------------|-------------|--------|
//! | accepted / rejected | any | finalize with that record |
//! | not found | >= timeout | finalize as abandoned, dispatch fresh |
//! | not found | < timeout | leave pending (`ReconciliationRequired`) |
//! | lookup failed | any | leave pending (`ReconciliationRequired`) |
//!
//! Status-check attempts are read-only, so one that outlives the timeout is
//! abandoned without asking upstream.

use std::sync::Arc;

use dialtone_compliance::{
    AttemptResolution, AttemptSlot, AttemptType, ComplianceAttempt, GatewayOutcome,
};
use dialtone_core::Clock;

use crate::attempt_log::{AttemptLog, AttemptLogError, AttemptStart};
use crate::error::{ComplianceError, ComplianceResult};
use crate::gateway::{ComplianceGateway, GatewayResponse, StatusQuery};

const MAX_OPEN_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Finalized with the upstream record.
    Resolved(ComplianceAttempt),
    /// Finalized as abandoned; the slot is free for a fresh attempt.
    Abandoned(ComplianceAttempt),
    /// Still undecided.
    StillPending(ComplianceAttempt),
}

/// Result of opening an attempt on a slot.
#[derive(Debug)]
pub enum Opened {
    /// A new pending attempt; the caller dispatches it.
    Fresh(ComplianceAttempt),
    /// An earlier attempt on the slot turned out to have reached upstream.
    Settled(ComplianceAttempt),
}

pub struct Reconciler {
    attempts: Arc<dyn AttemptLog>,
    gateway: Arc<dyn ComplianceGateway>,
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        attempts: Arc<dyn AttemptLog>,
        gateway: Arc<dyn ComplianceGateway>,
        clock: Arc<dyn Clock>,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            attempts,
            gateway,
            clock,
            timeout,
        }
    }

    pub fn is_expired(&self, attempt: &ComplianceAttempt) -> bool {
        attempt.age(self.clock.now()) >= self.timeout
    }

    pub async fn reconcile(&self, pending: ComplianceAttempt) -> ComplianceResult<Reconciliation> {
        if !pending.is_pending() {
            return Ok(Reconciliation::Resolved(pending));
        }

        if pending.attempt_type() == AttemptType::StatusCheck {
            if !self.is_expired(&pending) {
                return Ok(Reconciliation::StillPending(pending));
            }
            return self.abandon(pending, "orphaned status check").await;
        }

        let start = AttemptStart {
            tenant_id: pending.tenant_id,
            slot: AttemptSlot::status_check(pending.registration_id(), pending.id.key()),
            request: serde_json::json!({
                "query": "idempotency_key",
                "target_attempt": pending.id.key(),
                "idempotency_key": pending.idempotency_key,
            }),
        };
        let check = match self.attempts.record_attempt_start(start).await {
            Ok(check) => check,
            Err(AttemptLogError::InFlight(other)) => {
                // Another actor is reconciling this attempt right now.
                if self.is_expired(&other) {
                    self.abandon(*other, "orphaned status check").await?;
                }
                return Ok(Reconciliation::StillPending(pending));
            }
            Err(err) => return Err(err.into()),
        };

        let query = StatusQuery::IdempotencyKey(pending.idempotency_key.clone());
        let response = self.gateway.check_status(&query, &check.idempotency_key).await;
        self.finalize(&check, response.clone()).await?;

        match &response.outcome {
            GatewayOutcome::Accepted { .. } | GatewayOutcome::Rejected { .. } => {
                tracing::info!(
                    attempt_id = %pending.id,
                    outcome = ?response.outcome,
                    "pending attempt found upstream"
                );
                let resolved = self.finalize(&pending, response).await?;
                Ok(Reconciliation::Resolved(resolved))
            }
            GatewayOutcome::NotFound if self.is_expired(&pending) => {
                self.abandon(pending, "no upstream record within the reconciliation timeout")
                    .await
            }
            GatewayOutcome::NotFound | GatewayOutcome::Retriable { .. } => {
                tracing::debug!(attempt_id = %pending.id, "pending attempt still undecided");
                Ok(Reconciliation::StillPending(pending))
            }
        }
    }

    /// Open a fresh attempt on a slot, reconciling a pending head first.
    pub async fn open(&self, start: AttemptStart) -> ComplianceResult<Opened> {
        for _ in 0..MAX_OPEN_ROUNDS {
            match self.attempts.record_attempt_start(start.clone()).await {
                Ok(attempt) => return Ok(Opened::Fresh(attempt)),
                Err(AttemptLogError::InFlight(existing)) => match self.reconcile(*existing).await? {
                    Reconciliation::Resolved(attempt) => return Ok(Opened::Settled(attempt)),
                    Reconciliation::Abandoned(_) => continue,
                    Reconciliation::StillPending(attempt) => {
                        return Err(ComplianceError::ReconciliationRequired {
                            attempt_id: attempt.id.to_string(),
                        });
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
        Err(ComplianceError::conflict(format!(
            "slot {} kept changing while opening an attempt",
            start.slot
        )))
    }

    /// Record the call's outcome on `attempt`.
    ///
    /// If someone else finalized it first, their version is returned.
    pub async fn finalize(
        &self,
        attempt: &ComplianceAttempt,
        response: GatewayResponse,
    ) -> ComplianceResult<ComplianceAttempt> {
        let resolution = AttemptResolution::Outcome {
            outcome: response.outcome,
            response: response.payload,
        };
        self.settle(attempt, resolution).await
    }

    async fn abandon(
        &self,
        attempt: ComplianceAttempt,
        reason: &str,
    ) -> ComplianceResult<Reconciliation> {
        tracing::warn!(attempt_id = %attempt.id, reason, "abandoning pending attempt");
        let resolution = AttemptResolution::Abandoned {
            reason: reason.to_string(),
        };
        let settled = self.settle(&attempt, resolution).await?;
        if settled.error_kind == Some(dialtone_compliance::AttemptErrorKind::Abandoned) {
            Ok(Reconciliation::Abandoned(settled))
        } else {
            Ok(Reconciliation::Resolved(settled))
        }
    }

    async fn settle(
        &self,
        attempt: &ComplianceAttempt,
        resolution: AttemptResolution,
    ) -> ComplianceResult<ComplianceAttempt> {
        match self.attempts.record_attempt_end(&attempt.id, resolution).await {
            Ok(done) => Ok(done),
            Err(AttemptLogError::AlreadyFinalized(id)) => self
                .attempts
                .get(&id)
                .await?
                .ok_or_else(|| ComplianceError::not_found(format!("attempt {id}"))),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt_log::DocumentAttemptLog;
    use crate::gateway::{CallKind, SandboxGateway};
    use crate::store::InMemoryDocumentStore;
    use dialtone_compliance::{AttemptErrorKind, AttemptStatus, PhoneNumber};
    use dialtone_core::{ManualClock, RegistrationId, TenantId};

    struct Fixture {
        log: Arc<DocumentAttemptLog>,
        sandbox: Arc<SandboxGateway>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let log = Arc::new(DocumentAttemptLog::new(
            Arc::new(InMemoryDocumentStore::new()),
            clock.clone(),
        ));
        let sandbox = Arc::new(SandboxGateway::new());
        let reconciler = Reconciler::new(
            log.clone(),
            sandbox.clone(),
            clock.clone(),
            chrono::Duration::minutes(15),
        );
        Fixture {
            log,
            sandbox,
            clock,
            reconciler,
        }
    }

    fn phone_start(reg: RegistrationId, tenant: TenantId) -> AttemptStart {
        let n = PhoneNumber::parse("+15551234567").unwrap();
        AttemptStart {
            tenant_id: tenant,
            slot: AttemptSlot::phone(reg, &n),
            request: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn resolves_attempt_that_reached_upstream() {
        let f = fixture();
        let (reg, tenant) = (RegistrationId::new(), TenantId::new());
        let pending = f.log.record_attempt_start(phone_start(reg, tenant)).await.unwrap();

        // The call went out but the process died before finalizing.
        let n = PhoneNumber::parse("+15551234567").unwrap();
        f.sandbox.assign_number(&n, "CM1", &pending.idempotency_key).await;

        match f.reconciler.reconcile(pending).await.unwrap() {
            Reconciliation::Resolved(a) => {
                assert_eq!(a.status, AttemptStatus::Success);
                assert!(a.upstream_ref.is_some());
            }
            other => panic!("expected resolved, got {other:?}"),
        }
        assert_eq!(f.sandbox.submissions(CallKind::Number), 1);
    }

    #[tokio::test]
    async fn young_unknown_attempts_stay_pending_old_ones_are_abandoned() {
        let f = fixture();
        let (reg, tenant) = (RegistrationId::new(), TenantId::new());
        let pending = f.log.record_attempt_start(phone_start(reg, tenant)).await.unwrap();

        assert!(matches!(
            f.reconciler.reconcile(pending.clone()).await.unwrap(),
            Reconciliation::StillPending(_)
        ));

        f.clock.advance(chrono::Duration::minutes(16));
        match f.reconciler.reconcile(pending).await.unwrap() {
            Reconciliation::Abandoned(a) => {
                assert_eq!(a.error_kind, Some(AttemptErrorKind::Abandoned));
            }
            other => panic!("expected abandoned, got {other:?}"),
        }

        // Both lookups were recorded as status_check attempts.
        let checks = f
            .log
            .list_attempts(tenant, reg)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.attempt_type() == AttemptType::StatusCheck)
            .count();
        assert_eq!(checks, 2);
    }

    #[tokio::test]
    async fn open_dispatches_fresh_after_abandoning() {
        let f = fixture();
        let (reg, tenant) = (RegistrationId::new(), TenantId::new());
        let stale = f.log.record_attempt_start(phone_start(reg, tenant)).await.unwrap();

        assert!(matches!(
            f.reconciler.open(phone_start(reg, tenant)).await,
            Err(ComplianceError::ReconciliationRequired { .. })
        ));

        f.clock.advance(chrono::Duration::hours(1));
        match f.reconciler.open(phone_start(reg, tenant)).await.unwrap() {
            Opened::Fresh(a) => {
                assert_eq!(a.id.sequence, stale.id.sequence + 1);
                assert_ne!(a.idempotency_key, stale.idempotency_key);
            }
            Opened::Settled(_) => panic!("expected a fresh attempt"),
        }
    }

    #[tokio::test]
    async fn orphaned_status_checks_are_abandoned_without_lookup() {
        let f = fixture();
        let (reg, tenant) = (RegistrationId::new(), TenantId::new());
        let orphan = f
            .log
            .record_attempt_start(AttemptStart {
                tenant_id: tenant,
                slot: AttemptSlot::status_check(reg, "campaign:CM1"),
                request: serde_json::Value::Null,
            })
            .await
            .unwrap();

        // Its poller may still be running.
        assert!(matches!(
            f.reconciler.reconcile(orphan.clone()).await.unwrap(),
            Reconciliation::StillPending(_)
        ));

        f.clock.advance(chrono::Duration::minutes(20));
        assert!(matches!(
            f.reconciler.reconcile(orphan).await.unwrap(),
            Reconciliation::Abandoned(_)
        ));
        assert_eq!(f.sandbox.calls(CallKind::Status), 0);
    }
}
