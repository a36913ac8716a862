//! Brand and campaign submission.
//!
//! The registrar is the only writer of brand/campaign status and upstream
//! references. Each submission goes through the attempt cycle: open (which
//! reconciles any pending attempt of the same slot), dispatch, finalize, then
//! apply the finalized outcome to the sub-entity.

use std::sync::Arc;

use dialtone_compliance::{
    A2pBrand, A2pCampaign, A2pRegistration, AttemptSlot, AttemptType, ComplianceAttempt,
    GatewayOutcome, ReviewState, UpstreamStatus, UpstreamStatusUpdate,
};
use dialtone_core::{Clock, DomainResult};

use crate::attempt_log::AttemptStart;
use crate::error::{ComplianceError, ComplianceResult};
use crate::gateway::{BrandSubmission, CampaignSubmission, ComplianceGateway};
use crate::reconcile::{Opened, Reconciler};
use crate::repository::Repository;
use crate::store::StoreError;

const MAX_ENTITY_CAS_ROUNDS: usize = 5;

pub struct Registrar {
    registrations: Repository<A2pRegistration>,
    brands: Repository<A2pBrand>,
    campaigns: Repository<A2pCampaign>,
    gateway: Arc<dyn ComplianceGateway>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
}

impl Registrar {
    pub fn new(
        registrations: Repository<A2pRegistration>,
        brands: Repository<A2pBrand>,
        campaigns: Repository<A2pCampaign>,
        gateway: Arc<dyn ComplianceGateway>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registrations,
            brands,
            campaigns,
            gateway,
            reconciler,
            clock,
        }
    }

    pub async fn load_brand(&self, registration: &A2pRegistration) -> ComplianceResult<Option<A2pBrand>> {
        Ok(self
            .brands
            .load(registration.tenant_id, &registration.id.to_string())
            .await?)
    }

    pub async fn load_campaign(
        &self,
        registration: &A2pRegistration,
    ) -> ComplianceResult<Option<A2pCampaign>> {
        Ok(self
            .campaigns
            .load(registration.tenant_id, &registration.id.to_string())
            .await?)
    }

    /// Make sure the registration's brand exists upstream.
    ///
    /// Returns the brand once it holds an upstream reference.
    #[tracing::instrument(skip_all, fields(registration_id = %registration.id), err)]
    pub async fn submit_brand(&self, registration: &A2pRegistration) -> ComplianceResult<A2pBrand> {
        let brand = self.ensure_brand(registration).await?;
        if let Some(done) = settled_brand(&brand)? {
            return Ok(done);
        }

        let submission = BrandSubmission {
            tenant_id: registration.tenant_id,
            registration_id: registration.id,
            form: brand.form.clone(),
        };
        let start = AttemptStart {
            tenant_id: registration.tenant_id,
            slot: AttemptSlot::brand(registration.id),
            request: serde_json::to_value(&submission)?,
        };

        let attempt = match self.reconciler.open(start).await? {
            Opened::Fresh(attempt) => {
                tracing::info!(attempt_id = %attempt.id, "submitting brand");
                let response = self
                    .gateway
                    .register_brand(&submission, &attempt.idempotency_key)
                    .await;
                self.reconciler.finalize(&attempt, response).await?
            }
            Opened::Settled(attempt) => attempt,
        };

        let brand = self.absorb_brand(registration, &attempt).await?;
        outcome_result(&attempt, brand)
    }

    /// Make sure the registration's campaign exists upstream under `brand`.
    #[tracing::instrument(skip_all, fields(registration_id = %registration.id), err)]
    pub async fn submit_campaign(
        &self,
        registration: &A2pRegistration,
        brand: &A2pBrand,
    ) -> ComplianceResult<A2pCampaign> {
        let campaign = self.ensure_campaign(registration, brand).await?;
        if let Some(done) = settled_campaign(&campaign)? {
            return Ok(done);
        }

        let submission = CampaignSubmission {
            tenant_id: registration.tenant_id,
            registration_id: registration.id,
            brand_ref: campaign.brand_upstream_ref.clone(),
            form: campaign.form.clone(),
        };
        let start = AttemptStart {
            tenant_id: registration.tenant_id,
            slot: AttemptSlot::campaign(registration.id),
            request: serde_json::to_value(&submission)?,
        };

        let attempt = match self.reconciler.open(start).await? {
            Opened::Fresh(attempt) => {
                tracing::info!(attempt_id = %attempt.id, "submitting campaign");
                let response = self
                    .gateway
                    .register_campaign(&submission, &attempt.idempotency_key)
                    .await;
                self.reconciler.finalize(&attempt, response).await?
            }
            Opened::Settled(attempt) => attempt,
        };

        let campaign = self.absorb_campaign(registration, &attempt).await?;
        outcome_result(&attempt, campaign)
    }

    /// Apply a finalized brand or campaign attempt to its sub-entity.
    pub async fn absorb(
        &self,
        registration: &A2pRegistration,
        attempt: &ComplianceAttempt,
    ) -> ComplianceResult<()> {
        match attempt.attempt_type() {
            AttemptType::BrandRegistration => {
                self.absorb_brand(registration, attempt).await?;
            }
            AttemptType::CampaignRegistration => {
                self.absorb_campaign(registration, attempt).await?;
            }
            AttemptType::PhoneAssignment | AttemptType::StatusCheck => {}
        }
        Ok(())
    }

    /// Apply an upstream decision (poll or webhook) to the brand.
    pub async fn apply_brand_status(
        &self,
        registration: &A2pRegistration,
        update: &UpstreamStatusUpdate,
    ) -> ComplianceResult<Option<A2pBrand>> {
        let now = self.clock.now();
        self.update_brand(registration, |brand| apply_decision_to_brand(brand, update, now))
            .await
    }

    /// Apply an upstream decision to the campaign. Approval also approves the brand.
    pub async fn apply_campaign_status(
        &self,
        registration: &A2pRegistration,
        update: &UpstreamStatusUpdate,
    ) -> ComplianceResult<Option<A2pCampaign>> {
        let now = self.clock.now();
        let campaign = self
            .update_campaign(registration, |campaign| {
                if campaign.upstream_ref.as_deref() != Some(update.upstream_ref.as_str()) {
                    return Ok(false);
                }
                match update.status {
                    UpstreamStatus::InReview => Ok(false),
                    _ if campaign.is_terminal() => Ok(false),
                    UpstreamStatus::Approved => campaign.mark_approved(now).map(|_| true),
                    UpstreamStatus::Rejected => campaign
                        .reject(update.reason.clone().unwrap_or_else(|| "rejected upstream".into()), now)
                        .map(|_| true),
                }
            })
            .await?;

        if update.status == UpstreamStatus::Approved {
            self.update_brand(registration, |brand| {
                if brand.is_terminal() || brand.upstream_ref.is_none() {
                    return Ok(false);
                }
                brand.mark_approved(now).map(|_| true)
            })
            .await?;
        }
        Ok(campaign)
    }

    /// Create the brand record without dispatching it: validates the form and the
    /// one-active-brand rule.
    pub async fn prepare_brand(&self, registration: &A2pRegistration) -> ComplianceResult<A2pBrand> {
        self.ensure_brand(registration).await
    }

    async fn ensure_brand(&self, registration: &A2pRegistration) -> ComplianceResult<A2pBrand> {
        if let Some(brand) = self.load_brand(registration).await? {
            return Ok(brand);
        }

        let Some(form) = registration.forms.brand.clone() else {
            return Err(ComplianceError::validation("brand details are required"));
        };
        form.validate()?;
        self.ensure_no_other_active_brand(registration).await?;

        let brand_id = registration.brand_id.unwrap_or_default();
        let mut brand = A2pBrand::new(
            brand_id,
            registration.tenant_id,
            registration.id,
            form,
            self.clock.now(),
        )?;
        match self.brands.insert(&mut brand).await {
            Ok(()) => Ok(brand),
            // A concurrent advance created it first.
            Err(StoreError::Conflict(_)) => self
                .load_brand(registration)
                .await?
                .ok_or_else(|| ComplianceError::conflict("brand vanished after a create race")),
            Err(other) => Err(other.into()),
        }
    }

    /// A tenant holds at most one active brand across its active registrations.
    async fn ensure_no_other_active_brand(&self, registration: &A2pRegistration) -> ComplianceResult<()> {
        let brands = self.brands.list(Some(registration.tenant_id)).await?;
        for brand in brands.into_iter().filter(|b| b.registration_id != registration.id && b.is_active()) {
            let owner = self
                .registrations
                .load_any(&brand.registration_id.to_string())
                .await?;
            if owner.is_some_and(|r| r.is_active()) {
                return Err(ComplianceError::conflict(format!(
                    "tenant already has an active brand ({}) on registration {}",
                    brand.id, brand.registration_id
                )));
            }
        }
        Ok(())
    }

    async fn ensure_campaign(
        &self,
        registration: &A2pRegistration,
        brand: &A2pBrand,
    ) -> ComplianceResult<A2pCampaign> {
        if let Some(campaign) = self.load_campaign(registration).await? {
            return Ok(campaign);
        }

        let Some(form) = registration.forms.campaign.clone() else {
            return Err(ComplianceError::validation("campaign details are required"));
        };
        let campaign_id = registration.campaign_id.unwrap_or_default();
        let mut campaign = A2pCampaign::new(campaign_id, brand, form, self.clock.now())?;
        match self.campaigns.insert(&mut campaign).await {
            Ok(()) => Ok(campaign),
            Err(StoreError::Conflict(_)) => self
                .load_campaign(registration)
                .await?
                .ok_or_else(|| ComplianceError::conflict("campaign vanished after a create race")),
            Err(other) => Err(other.into()),
        }
    }

    async fn absorb_brand(
        &self,
        registration: &A2pRegistration,
        attempt: &ComplianceAttempt,
    ) -> ComplianceResult<A2pBrand> {
        let now = self.clock.now();
        let outcome = attempt.outcome.clone();
        self.update_brand(registration, |brand| match &outcome {
            Some(GatewayOutcome::Accepted { upstream_ref, review }) => {
                if !acceptance_changes(brand.is_terminal(), brand.upstream_ref.as_deref(), upstream_ref, *review) {
                    return Ok(false);
                }
                brand.record_acceptance(upstream_ref.clone(), *review, now).map(|_| true)
            }
            Some(GatewayOutcome::Rejected { reason }) if !brand.is_terminal() => {
                brand.reject(reason.clone(), now).map(|_| true)
            }
            _ => Ok(false),
        })
        .await?
        .ok_or_else(|| ComplianceError::not_found(format!("brand of registration {}", registration.id)))
    }

    async fn absorb_campaign(
        &self,
        registration: &A2pRegistration,
        attempt: &ComplianceAttempt,
    ) -> ComplianceResult<A2pCampaign> {
        let now = self.clock.now();
        let outcome = attempt.outcome.clone();
        self.update_campaign(registration, |campaign| match &outcome {
            Some(GatewayOutcome::Accepted { upstream_ref, review }) => {
                if !acceptance_changes(campaign.is_terminal(), campaign.upstream_ref.as_deref(), upstream_ref, *review) {
                    return Ok(false);
                }
                campaign.record_acceptance(upstream_ref.clone(), *review, now).map(|_| true)
            }
            Some(GatewayOutcome::Rejected { reason }) if !campaign.is_terminal() => {
                campaign.reject(reason.clone(), now).map(|_| true)
            }
            _ => Ok(false),
        })
        .await?
        .ok_or_else(|| {
            ComplianceError::not_found(format!("campaign of registration {}", registration.id))
        })
    }

    /// Load, mutate and CAS the brand. `f` returns whether it changed anything.
    async fn update_brand<F>(
        &self,
        registration: &A2pRegistration,
        mut f: F,
    ) -> ComplianceResult<Option<A2pBrand>>
    where
        F: FnMut(&mut A2pBrand) -> DomainResult<bool> + Send,
    {
        for _ in 0..MAX_ENTITY_CAS_ROUNDS {
            let Some(mut brand) = self.load_brand(registration).await? else {
                return Ok(None);
            };
            if !f(&mut brand)? {
                return Ok(Some(brand));
            }
            match self.brands.save(&mut brand).await {
                Ok(()) => return Ok(Some(brand)),
                Err(StoreError::Conflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(ComplianceError::conflict("brand kept changing concurrently"))
    }

    async fn update_campaign<F>(
        &self,
        registration: &A2pRegistration,
        mut f: F,
    ) -> ComplianceResult<Option<A2pCampaign>>
    where
        F: FnMut(&mut A2pCampaign) -> DomainResult<bool> + Send,
    {
        for _ in 0..MAX_ENTITY_CAS_ROUNDS {
            let Some(mut campaign) = self.load_campaign(registration).await? else {
                return Ok(None);
            };
            if !f(&mut campaign)? {
                return Ok(Some(campaign));
            }
            match self.campaigns.save(&mut campaign).await {
                Ok(()) => return Ok(Some(campaign)),
                Err(StoreError::Conflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(ComplianceError::conflict("campaign kept changing concurrently"))
    }
}

/// Whether an acceptance carries anything the sub-entity does not know yet.
fn acceptance_changes(terminal: bool, current: Option<&str>, upstream_ref: &str, review: ReviewState) -> bool {
    !terminal && !(current == Some(upstream_ref) && review == ReviewState::InReview)
}

fn apply_decision_to_brand(
    brand: &mut A2pBrand,
    update: &UpstreamStatusUpdate,
    now: chrono::DateTime<chrono::Utc>,
) -> DomainResult<bool> {
    if brand.upstream_ref.as_deref() != Some(update.upstream_ref.as_str()) || brand.is_terminal() {
        return Ok(false);
    }
    match update.status {
        UpstreamStatus::InReview => Ok(false),
        UpstreamStatus::Approved => brand.mark_approved(now).map(|_| true),
        UpstreamStatus::Rejected => brand
            .reject(update.reason.clone().unwrap_or_else(|| "rejected upstream".into()), now)
            .map(|_| true),
    }
}

/// Nothing to dispatch: the brand already has a reference, or was rejected.
fn settled_brand(brand: &A2pBrand) -> ComplianceResult<Option<A2pBrand>> {
    if !brand.is_active() {
        return Err(ComplianceError::fatal(
            AttemptType::BrandRegistration,
            brand
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "brand rejected".into()),
        ));
    }
    Ok(brand.has_confirmed_ref().then(|| brand.clone()))
}

fn settled_campaign(campaign: &A2pCampaign) -> ComplianceResult<Option<A2pCampaign>> {
    if !campaign.is_active() {
        return Err(ComplianceError::fatal(
            AttemptType::CampaignRegistration,
            campaign
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "campaign rejected".into()),
        ));
    }
    Ok(campaign.has_confirmed_ref().then(|| campaign.clone()))
}

/// Translate the finalized attempt into the caller-facing result.
fn outcome_result<T>(attempt: &ComplianceAttempt, entity: T) -> ComplianceResult<T> {
    match &attempt.outcome {
        Some(GatewayOutcome::Accepted { .. }) => Ok(entity),
        Some(GatewayOutcome::Rejected { reason }) => {
            Err(ComplianceError::fatal(attempt.attempt_type(), reason.clone()))
        }
        Some(GatewayOutcome::Retriable { reason }) => {
            Err(ComplianceError::retriable(attempt.attempt_type(), reason.clone()))
        }
        Some(GatewayOutcome::NotFound) | None => Err(ComplianceError::retriable(
            attempt.attempt_type(),
            attempt
                .error
                .clone()
                .unwrap_or_else(|| "no upstream record".into()),
        )),
    }
}
