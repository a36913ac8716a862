//! Read-side operations, operator reconciliation and upstream callbacks.

use serde::Serialize;

use dialtone_compliance::{
    A2pRegistration, ComplianceAttempt, LastError, NumberBindingStatus, NumberStatusView,
    PhoneNumber, RegistrationStatus, RegistrationStatusView, UpstreamStatusUpdate,
};
use dialtone_core::{RegistrationId, TenantId};

use crate::error::{ComplianceError, ComplianceResult};
use crate::orchestrator::Orchestrator;
use crate::reconcile::Reconciliation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub resolved: Vec<String>,
    pub abandoned: Vec<String>,
    pub still_pending: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.abandoned.is_empty() && self.still_pending.is_empty()
    }

    fn record(&mut self, outcome: &Reconciliation) {
        match outcome {
            Reconciliation::Resolved(a) => self.resolved.push(a.id.key()),
            Reconciliation::Abandoned(a) => self.abandoned.push(a.id.key()),
            Reconciliation::StillPending(a) => self.still_pending.push(a.id.key()),
        }
    }
}

impl Orchestrator {
    pub async fn get_registration_status(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<RegistrationStatusView> {
        let registration = self.get_registration(tenant_id, registration_id).await?;
        let brand = self.registrar.load_brand(&registration).await?;
        let campaign = self.registrar.load_campaign(&registration).await?;
        let attempts = self.attempts.list_attempts(tenant_id, registration_id).await?;

        let mut per_number_status = Vec::with_capacity(registration.phone_numbers.len());
        for number in &registration.phone_numbers {
            per_number_status.push(self.number_status(&registration, number).await?);
        }

        Ok(RegistrationStatusView {
            registration_id,
            status: registration.status,
            current_step: registration.current_step,
            brand_status: brand.map(|b| b.status),
            campaign_status: campaign.map(|c| c.status),
            per_number_status,
            last_error: LastError::from_attempts(&attempts),
            abandoned: registration.abandoned_at.is_some(),
            superseded_by: registration.superseded_by,
        })
    }

    /// Audit trail of every outbound call, oldest first.
    pub async fn list_attempts(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<Vec<ComplianceAttempt>> {
        self.get_registration(tenant_id, registration_id).await?;
        Ok(self.attempts.list_attempts(tenant_id, registration_id).await?)
    }

    /// Resolve every pending attempt of a registration now.
    ///
    /// Uses the regular rules: young attempts without an upstream record stay
    /// pending. Resolved outcomes are applied to their sub-entity or binding.
    #[tracing::instrument(skip(self), err)]
    pub async fn force_reconcile(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<ReconcileReport> {
        self.get_registration(tenant_id, registration_id).await?;
        let pending: Vec<ComplianceAttempt> = self
            .attempts
            .list_attempts(tenant_id, registration_id)
            .await?
            .into_iter()
            .filter(ComplianceAttempt::is_pending)
            .collect();

        let mut report = ReconcileReport::default();
        for attempt in pending {
            let outcome = self.reconciler.reconcile(attempt).await?;
            if let Reconciliation::Resolved(resolved) = &outcome {
                self.absorb(resolved).await?;
            }
            report.record(&outcome);
        }
        tracing::info!(
            resolved = report.resolved.len(),
            abandoned = report.abandoned.len(),
            still_pending = report.still_pending.len(),
            "forced reconciliation finished"
        );
        Ok(report)
    }

    /// Apply an upstream status callback for a brand or campaign reference.
    ///
    /// Returns the owning registration after any resulting transition.
    #[tracing::instrument(skip(self, update), fields(upstream_ref = %update.upstream_ref), err)]
    pub async fn apply_upstream_status(
        &self,
        update: &UpstreamStatusUpdate,
    ) -> ComplianceResult<A2pRegistration> {
        let reference = update.upstream_ref.as_str();

        let brand = self
            .brands
            .list(None)
            .await?
            .into_iter()
            .find(|b| b.upstream_ref.as_deref() == Some(reference));
        let registration = if let Some(brand) = brand {
            let registration = self.owning_registration(brand.registration_id).await?;
            self.registrar.apply_brand_status(&registration, update).await?;
            registration
        } else {
            let campaign = self
                .campaigns
                .list(None)
                .await?
                .into_iter()
                .find(|c| c.upstream_ref.as_deref() == Some(reference))
                .ok_or_else(|| ComplianceError::not_found(format!("upstream reference {reference}")))?;
            let registration = self.owning_registration(campaign.registration_id).await?;
            self.registrar.apply_campaign_status(&registration, update).await?;
            registration
        };

        if registration.status == RegistrationStatus::Submitted {
            return self.settle_decision(&registration).await;
        }
        self.get_registration(registration.tenant_id, registration.id).await
    }

    /// Owned numbers that no other active registration holds.
    pub async fn list_available_numbers(&self, tenant_id: TenantId) -> ComplianceResult<Vec<PhoneNumber>> {
        let owned = self.inventory.list_available_numbers(tenant_id).await?;
        let mut available = Vec::with_capacity(owned.len());
        for number in owned {
            if self.binder.active_holder(&number).await?.is_none() {
                available.push(number);
            }
        }
        Ok(available)
    }

    async fn owning_registration(&self, registration_id: RegistrationId) -> ComplianceResult<A2pRegistration> {
        self.registrations
            .load_any(&registration_id.to_string())
            .await?
            .ok_or_else(|| ComplianceError::not_found(format!("registration {registration_id}")))
    }

    async fn number_status(
        &self,
        registration: &A2pRegistration,
        number: &PhoneNumber,
    ) -> ComplianceResult<NumberStatusView> {
        let view = match self.binder.binding(number).await? {
            Some(binding) if binding.is_held_by(registration.id) => NumberStatusView {
                number: number.clone(),
                status: binding.status,
                error: binding.failure.map(|f| f.reason),
            },
            Some(binding) if !binding.is_released() => NumberStatusView {
                number: number.clone(),
                status: NumberBindingStatus::Failed,
                error: Some("already bound to another registration".into()),
            },
            _ => NumberStatusView {
                number: number.clone(),
                status: NumberBindingStatus::Selected,
                error: None,
            },
        };
        Ok(view)
    }
}
