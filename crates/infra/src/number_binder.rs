//! Binding phone numbers to a registration and assigning them upstream.
//!
//! Ownership lives in one global [`NumberBinding`] document per number. Claims
//! are conditional writes: two registrations racing for the same number both
//! read, both write, and exactly one write lands. The loser re-reads and sees
//! the number held by an active registration.

use std::sync::Arc;

use serde::Serialize;

use dialtone_compliance::{
    A2pRegistration, AttemptSlot, ComplianceAttempt, GatewayOutcome, NumberBinding,
    NumberBindingStatus, PhoneNumber,
};
use dialtone_core::{Clock, DomainResult, RegistrationId};

use crate::attempt_log::AttemptStart;
use crate::error::{ComplianceError, ComplianceResult};
use crate::gateway::{ComplianceGateway, NumberAssignment};
use crate::inventory::NumberInventory;
use crate::reconcile::{Opened, Reconciler};
use crate::repository::Repository;
use crate::store::StoreError;

const MAX_CLAIM_ROUNDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedNumber {
    pub number: PhoneNumber,
    pub reason: String,
    pub fatal: bool,
}

/// Per-number result of one binding pass. Partial success is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindReport {
    pub registered: Vec<PhoneNumber>,
    pub failed: Vec<FailedNumber>,
    /// Numbers whose previous assignment attempt is still unresolved.
    pub pending: Vec<PhoneNumber>,
}

impl BindReport {
    pub fn is_complete(&self) -> bool {
        !self.registered.is_empty() && self.failed.is_empty() && self.pending.is_empty()
    }

    pub fn unresolved(&self) -> usize {
        self.failed.len() + self.pending.len()
    }
}

pub struct NumberBinder {
    registrations: Repository<A2pRegistration>,
    bindings: Repository<NumberBinding>,
    inventory: Arc<dyn NumberInventory>,
    gateway: Arc<dyn ComplianceGateway>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
}

impl NumberBinder {
    pub fn new(
        registrations: Repository<A2pRegistration>,
        bindings: Repository<NumberBinding>,
        inventory: Arc<dyn NumberInventory>,
        gateway: Arc<dyn ComplianceGateway>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registrations,
            bindings,
            inventory,
            gateway,
            reconciler,
            clock,
        }
    }

    pub async fn binding(&self, number: &PhoneNumber) -> ComplianceResult<Option<NumberBinding>> {
        Ok(self.bindings.load_any(number.as_str()).await?)
    }

    /// The active registration holding `number`, if any.
    pub async fn active_holder(&self, number: &PhoneNumber) -> ComplianceResult<Option<RegistrationId>> {
        match self.binding(number).await? {
            Some(binding) if self.holder_is_active(&binding).await? => Ok(Some(binding.registration_id)),
            _ => Ok(None),
        }
    }

    /// Take ownership of `number` for `registration`.
    ///
    /// Fails with `Conflict` when an active registration already holds it.
    pub async fn claim_number(
        &self,
        registration: &A2pRegistration,
        number: &PhoneNumber,
    ) -> ComplianceResult<NumberBinding> {
        if !self.inventory.owns(registration.tenant_id, number).await? {
            return Err(ComplianceError::validation(format!(
                "{number} is not in the tenant's phone number inventory"
            )));
        }

        for _ in 0..MAX_CLAIM_ROUNDS {
            let now = self.clock.now();
            let write = match self.binding(number).await? {
                None => {
                    let mut binding = NumberBinding::selected(
                        number.clone(),
                        registration.tenant_id,
                        registration.id,
                        now,
                    );
                    self.bindings.insert(&mut binding).await.map(|_| binding)
                }
                Some(binding) if binding.is_held_by(registration.id) => return Ok(binding),
                Some(mut binding) => {
                    if self.holder_is_active(&binding).await? {
                        return Err(already_bound(number, &binding));
                    }
                    tracing::info!(
                        number = %number,
                        previous = %binding.registration_id,
                        registration_id = %registration.id,
                        "taking over number from inactive registration"
                    );
                    binding.reassign_to(registration.tenant_id, registration.id, now);
                    self.bindings.save(&mut binding).await.map(|_| binding)
                }
            };

            match write {
                Ok(binding) => return Ok(binding),
                // Lost the race; re-read and re-evaluate.
                Err(StoreError::Conflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(ComplianceError::conflict(format!("{number} kept changing while being claimed")))
    }

    /// Give a number back. No-op if the registration does not hold it.
    pub async fn release_number(
        &self,
        registration: &A2pRegistration,
        number: &PhoneNumber,
    ) -> ComplianceResult<()> {
        let registration_id = registration.id;
        self.update_binding(number, |b| {
            if !b.is_held_by(registration_id) {
                return Ok(false);
            }
            b.release(self.clock.now()).map(|_| true)
        })
        .await
        .map(|_| ())
    }

    /// Assign every selected number to the campaign upstream.
    #[tracing::instrument(skip_all, fields(registration_id = %registration.id), err)]
    pub async fn bind_numbers(
        &self,
        registration: &A2pRegistration,
        campaign_ref: &str,
    ) -> ComplianceResult<BindReport> {
        let mut report = BindReport::default();

        for number in &registration.phone_numbers {
            let binding = match self.claim_number(registration, number).await {
                Ok(binding) => binding,
                Err(ComplianceError::Conflict(reason)) | Err(ComplianceError::Validation(reason)) => {
                    report.failed.push(FailedNumber {
                        number: number.clone(),
                        reason,
                        fatal: true,
                    });
                    continue;
                }
                Err(other) => return Err(other),
            };

            if !binding.needs_dispatch() {
                record(&mut report, &binding);
                continue;
            }

            match self.assign(registration, &binding, campaign_ref).await {
                Ok(binding) => record(&mut report, &binding),
                Err(ComplianceError::ReconciliationRequired { attempt_id }) => {
                    tracing::debug!(number = %number, attempt_id, "number assignment still pending");
                    report.pending.push(number.clone());
                }
                Err(other) => return Err(other),
            }
        }

        tracing::info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            "number binding pass finished"
        );
        Ok(report)
    }

    /// Apply a finalized phone-assignment attempt to its binding.
    pub async fn absorb(&self, attempt: &ComplianceAttempt) -> ComplianceResult<Option<NumberBinding>> {
        let Some(subject) = attempt.subject() else {
            return Ok(None);
        };
        let number = PhoneNumber::parse(subject)?;
        let registration_id = attempt.registration_id();
        let outcome = attempt.outcome.clone();
        let message = attempt.error.clone();
        let now = self.clock.now();

        self.update_binding(&number, |b| {
            if !b.is_held_by(registration_id) || b.status == NumberBindingStatus::Registered {
                return Ok(false);
            }
            match &outcome {
                Some(GatewayOutcome::Accepted { upstream_ref, .. }) => {
                    b.mark_registered(upstream_ref.clone(), now).map(|_| true)
                }
                Some(GatewayOutcome::Rejected { reason }) => {
                    b.mark_failed(reason.clone(), true, now).map(|_| true)
                }
                Some(GatewayOutcome::Retriable { reason }) => {
                    b.mark_failed(reason.clone(), false, now).map(|_| true)
                }
                Some(GatewayOutcome::NotFound) | None => b
                    .mark_failed(message.clone().unwrap_or_else(|| "no upstream record".into()), false, now)
                    .map(|_| true),
            }
        })
        .await
    }

    async fn assign(
        &self,
        registration: &A2pRegistration,
        binding: &NumberBinding,
        campaign_ref: &str,
    ) -> ComplianceResult<NumberBinding> {
        let number = &binding.number;
        let start = AttemptStart {
            tenant_id: registration.tenant_id,
            slot: AttemptSlot::phone(registration.id, number),
            request: serde_json::to_value(NumberAssignment {
                number: number.clone(),
                campaign_ref: campaign_ref.to_string(),
            })?,
        };

        let attempt = match self.reconciler.open(start).await? {
            Opened::Fresh(attempt) => {
                let registration_id = registration.id;
                self.update_binding(number, |b| {
                    if !b.is_held_by(registration_id) || b.status == NumberBindingStatus::Submitted {
                        return Ok(false);
                    }
                    b.mark_submitted(self.clock.now()).map(|_| true)
                })
                .await?;

                let response = self
                    .gateway
                    .assign_number(number, campaign_ref, &attempt.idempotency_key)
                    .await;
                self.reconciler.finalize(&attempt, response).await?
            }
            Opened::Settled(attempt) => attempt,
        };

        self.absorb(&attempt)
            .await?
            .ok_or_else(|| ComplianceError::not_found(format!("binding for {number}")))
    }

    async fn holder_is_active(&self, binding: &NumberBinding) -> ComplianceResult<bool> {
        if binding.is_released() {
            return Ok(false);
        }
        let holder = self
            .registrations
            .load_any(&binding.registration_id.to_string())
            .await?;
        Ok(holder.is_some_and(|r| r.is_active()))
    }

    async fn update_binding<F>(
        &self,
        number: &PhoneNumber,
        mut f: F,
    ) -> ComplianceResult<Option<NumberBinding>>
    where
        F: FnMut(&mut NumberBinding) -> DomainResult<bool> + Send,
    {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let Some(mut binding) = self.binding(number).await? else {
                return Ok(None);
            };
            if !f(&mut binding)? {
                return Ok(Some(binding));
            }
            match self.bindings.save(&mut binding).await {
                Ok(()) => return Ok(Some(binding)),
                Err(StoreError::Conflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(ComplianceError::conflict(format!("{number} kept changing concurrently")))
    }
}

fn already_bound(number: &PhoneNumber, binding: &NumberBinding) -> ComplianceError {
    ComplianceError::conflict(format!(
        "{number} is already bound to registration {}",
        binding.registration_id
    ))
}

fn record(report: &mut BindReport, binding: &NumberBinding) {
    match binding.status {
        NumberBindingStatus::Registered => report.registered.push(binding.number.clone()),
        NumberBindingStatus::Failed => {
            let failure = binding.failure.clone();
            report.failed.push(FailedNumber {
                number: binding.number.clone(),
                reason: failure
                    .as_ref()
                    .map(|f| f.reason.clone())
                    .unwrap_or_default(),
                fatal: failure.is_some_and(|f| f.fatal),
            });
        }
        NumberBindingStatus::Selected | NumberBindingStatus::Submitted => {
            report.pending.push(binding.number.clone())
        }
    }
}
