//! Wizard-facing commands: one call per step, each re-validated server side.

use std::collections::BTreeSet;

use serde::Serialize;

use dialtone_compliance::{
    A2pRegistration, BrandForm, BrandStatus, CampaignForm, CampaignStatus, ComplianceAttestations,
    NumberBindingStatus, PhoneNumber, RegistrationStatus,
};
use dialtone_core::{DomainError, RegistrationId, TenantId, UserId};

use crate::error::{ComplianceError, ComplianceResult};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedNumber {
    pub input: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionReport {
    pub registration: A2pRegistration,
    pub accepted: Vec<PhoneNumber>,
    pub rejected: Vec<RejectedNumber>,
}

impl Orchestrator {
    pub async fn create_registration(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> ComplianceResult<A2pRegistration> {
        let mut registration =
            A2pRegistration::new(RegistrationId::new(), tenant_id, user_id, self.clock.now());
        self.registrations.insert(&mut registration).await?;
        tracing::info!(registration_id = %registration.id, %tenant_id, "registration created");
        Ok(registration)
    }

    pub async fn list_registrations(&self, tenant_id: TenantId) -> ComplianceResult<Vec<A2pRegistration>> {
        let mut registrations = self.registrations.list(Some(tenant_id)).await?;
        registrations.sort_by_key(|r| r.created_at);
        Ok(registrations)
    }

    pub async fn save_brand_form(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        form: BrandForm,
    ) -> ComplianceResult<A2pRegistration> {
        self.update_registration(tenant_id, registration_id, |r| {
            r.save_brand_form(form.clone(), self.clock.now()).map(|_| true)
        })
        .await
    }

    pub async fn save_campaign_form(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        form: CampaignForm,
    ) -> ComplianceResult<A2pRegistration> {
        self.update_registration(tenant_id, registration_id, |r| {
            r.save_campaign_form(form.clone(), self.clock.now()).map(|_| true)
        })
        .await
    }

    /// Replace the selection with `inputs`.
    ///
    /// Each number is parsed and claimed individually; numbers that are invalid,
    /// not owned, or held by another active registration are reported back and
    /// left out. Numbers dropped from the previous selection are released. If
    /// the selection cannot be saved, the numbers claimed by this call are
    /// released again.
    pub async fn select_phone_numbers(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        inputs: Vec<String>,
    ) -> ComplianceResult<SelectionReport> {
        let current = self.get_registration(tenant_id, registration_id).await?;
        ensure_selection_editable(&current)?;

        let mut requested = BTreeSet::new();
        let mut parsed = Vec::new();
        let mut rejected = Vec::new();
        for input in &inputs {
            match PhoneNumber::parse(input) {
                Ok(number) => {
                    if requested.insert(number.clone()) {
                        parsed.push((input, number));
                    }
                }
                Err(err) => rejected.push(RejectedNumber {
                    input: input.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        // Registered numbers stay put; refuse before anything is claimed.
        for number in current.phone_numbers.difference(&requested) {
            self.ensure_not_registered(&current, number).await?;
        }

        let mut accepted = BTreeSet::new();
        for (input, number) in parsed {
            match self.binder.claim_number(&current, &number).await {
                Ok(_) => {
                    accepted.insert(number);
                }
                Err(ComplianceError::Conflict(reason)) | Err(ComplianceError::Validation(reason)) => {
                    rejected.push(RejectedNumber {
                        input: input.clone(),
                        reason,
                    });
                }
                Err(other) => {
                    self.release_fresh_claims(&current, &accepted).await;
                    return Err(other);
                }
            }
        }

        let dropped: Vec<PhoneNumber> = current.phone_numbers.difference(&accepted).cloned().collect();
        let saved = self.save_selection(&current, &dropped, &accepted, &inputs).await;
        let registration = match saved {
            Ok(registration) => registration,
            Err(err) => {
                self.release_fresh_claims(&current, &accepted).await;
                return Err(err);
            }
        };
        for number in &dropped {
            self.binder.release_number(&registration, number).await?;
        }

        Ok(SelectionReport {
            registration,
            accepted: accepted.into_iter().collect(),
            rejected,
        })
    }

    async fn save_selection(
        &self,
        current: &A2pRegistration,
        dropped: &[PhoneNumber],
        accepted: &BTreeSet<PhoneNumber>,
        inputs: &[String],
    ) -> ComplianceResult<A2pRegistration> {
        for number in dropped {
            self.ensure_not_registered(current, number).await?;
        }
        self.update_registration(current.tenant_id, current.id, |r| {
            r.set_phone_numbers(accepted.clone(), inputs.to_vec(), self.clock.now())
                .map(|_| true)
        })
        .await
    }

    /// Undo the claims of a selection that was not saved.
    async fn release_fresh_claims(&self, current: &A2pRegistration, accepted: &BTreeSet<PhoneNumber>) {
        for number in accepted.difference(&current.phone_numbers) {
            if let Err(err) = self.binder.release_number(current, number).await {
                tracing::warn!(
                    registration_id = %current.id,
                    number = %number,
                    error = %err,
                    "failed to release claim of an unsaved selection"
                );
            }
        }
    }

    pub async fn remove_phone_number(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        input: &str,
    ) -> ComplianceResult<A2pRegistration> {
        let number = PhoneNumber::parse(input)?;
        let current = self.get_registration(tenant_id, registration_id).await?;
        ensure_selection_editable(&current)?;
        self.ensure_not_registered(&current, &number).await?;

        let mut removed = false;
        let registration = self
            .update_registration(tenant_id, registration_id, |r| {
                removed = r.remove_phone_number(&number, self.clock.now())?;
                Ok(removed)
            })
            .await?;
        if !removed {
            return Err(ComplianceError::not_found(format!(
                "{number} is not selected on registration {registration_id}"
            )));
        }
        self.binder.release_number(&registration, &number).await?;
        Ok(registration)
    }

    pub async fn save_attestations(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        user_id: UserId,
        attestations: ComplianceAttestations,
    ) -> ComplianceResult<A2pRegistration> {
        self.update_registration(tenant_id, registration_id, |r| {
            let now = self.clock.now();
            let attested = ComplianceAttestations {
                accepted_by: Some(user_id),
                accepted_at: Some(now),
                ..attestations.clone()
            };
            r.save_attestations(attested, now).map(|_| true)
        })
        .await
    }

    /// Abandon an unsubmitted draft and release its numbers.
    pub async fn abandon(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<A2pRegistration> {
        let registration = self
            .update_registration(tenant_id, registration_id, |r| {
                r.abandon(self.clock.now()).map(|_| true)
            })
            .await?;
        for number in &registration.phone_numbers {
            self.binder.release_number(&registration, number).await?;
        }
        tracing::info!(%registration_id, "registration abandoned");
        Ok(registration)
    }

    /// Start a new registration that supersedes a rejected one.
    ///
    /// The successor is written first; if marking the predecessor superseded
    /// loses a race the successor is abandoned, so at most one successor stays
    /// active.
    pub async fn resubmit(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        user_id: UserId,
    ) -> ComplianceResult<A2pRegistration> {
        let predecessor = self.get_registration(tenant_id, registration_id).await?;
        if let Some(successor) = predecessor.superseded_by {
            return Err(ComplianceError::conflict(format!(
                "registration already superseded by {successor}"
            )));
        }
        if predecessor.abandoned_at.is_some() {
            return Err(ComplianceError::InvariantViolation(
                "abandoned registrations cannot be resubmitted".into(),
            ));
        }
        if !self.is_rejected(&predecessor).await? {
            return Err(ComplianceError::InvariantViolation(format!(
                "only rejected registrations can be resubmitted (status: {})",
                predecessor.status
            )));
        }

        let mut successor = A2pRegistration::resubmission(
            RegistrationId::new(),
            &predecessor,
            user_id,
            self.clock.now(),
        );
        self.registrations.insert(&mut successor).await?;

        let successor_id = successor.id;
        let superseded = self
            .update_registration(tenant_id, registration_id, |r| {
                r.mark_superseded(successor_id, self.clock.now()).map(|_| true)
            })
            .await;
        if let Err(err) = superseded {
            tracing::warn!(%registration_id, %successor_id, error = %err, "resubmission lost, abandoning successor");
            self.update_registration(tenant_id, successor_id, |r| {
                r.abandon(self.clock.now()).map(|_| true)
            })
            .await?;
            return Err(err);
        }

        tracing::info!(%registration_id, %successor_id, "registration resubmitted");
        Ok(successor)
    }

    async fn is_rejected(&self, registration: &A2pRegistration) -> ComplianceResult<bool> {
        if registration.status == RegistrationStatus::Rejected {
            return Ok(true);
        }
        let brand_rejected = self
            .registrar
            .load_brand(registration)
            .await?
            .is_some_and(|b| b.status == BrandStatus::Rejected);
        let campaign_rejected = self
            .registrar
            .load_campaign(registration)
            .await?
            .is_some_and(|c| c.status == CampaignStatus::Rejected);
        Ok(brand_rejected || campaign_rejected)
    }

    async fn ensure_not_registered(
        &self,
        registration: &A2pRegistration,
        number: &PhoneNumber,
    ) -> ComplianceResult<()> {
        let registered = self.binder.binding(number).await?.is_some_and(|b| {
            b.is_held_by(registration.id) && b.status == NumberBindingStatus::Registered
        });
        if registered {
            return Err(ComplianceError::InvariantViolation(format!(
                "{number} is already registered to the campaign"
            )));
        }
        Ok(())
    }
}

fn ensure_selection_editable(registration: &A2pRegistration) -> Result<(), DomainError> {
    if !registration.is_active() {
        return Err(DomainError::invariant(format!(
            "registration {} is no longer active",
            registration.id
        )));
    }
    if registration.status.rank() >= RegistrationStatus::Submitted.rank() {
        return Err(DomainError::invariant("phone numbers cannot change after submission"));
    }
    Ok(())
}
