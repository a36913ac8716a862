//! The registration workflow driver.
//!
//! `advance` performs exactly the next outstanding unit of work for a
//! registration and persists it before returning:
//!
//! | Status | Unit of work |
//! |--------|--------------|
//! | `draft` | validate and create the brand, move to `brand_pending`, submit the brand |
//! | `brand_pending` | submit (or reconcile) the brand; on a reference move to `campaign_pending` |
//! | `campaign_pending` | submit the campaign, or once it has a reference, bind numbers and move to `submitted` |
//! | `submitted` | poll the campaign decision and move to `approved` / `rejected` |
//!
//! Concurrent triggers (user, sweeper, webhook) are serialized per document by
//! compare-and-swap, and per upstream call by the attempt log.

use std::sync::Arc;

use serde::Serialize;

use dialtone_compliance::{
    A2pBrand, A2pCampaign, A2pRegistration, AttemptSlot, AttemptType, BrandStatus, CampaignStatus,
    ComplianceAttempt, GatewayOutcome, NumberBinding, RegistrationStatus, TransitionEvidence,
    UpstreamStatusUpdate,
};
use dialtone_core::{Clock, DomainResult, RegistrationId, TenantId};

use crate::attempt_log::{AttemptLog, AttemptStart, DocumentAttemptLog};
use crate::config::OrchestratorConfig;
use crate::error::{ComplianceError, ComplianceResult};
use crate::gateway::{ComplianceGateway, StatusQuery};
use crate::inventory::NumberInventory;
use crate::number_binder::{BindReport, NumberBinder};
use crate::reconcile::{Opened, Reconciler};
use crate::registrar::Registrar;
use crate::repository::Repository;
use crate::store::{DocumentStore, StoreError};

/// Subject prefix of the status-check slot that polls a campaign decision.
pub(crate) const CAMPAIGN_POLL_PREFIX: &str = "campaign:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceAction {
    /// Nothing to do (terminal, frozen, or waiting on upstream).
    None,
    BrandSubmitted,
    CampaignSubmitted,
    NumbersBound,
    StatusChecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub registration_id: RegistrationId,
    pub from: RegistrationStatus,
    pub to: RegistrationStatus,
    pub action: AdvanceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<BindReport>,
}

struct Step {
    registration: A2pRegistration,
    action: AdvanceAction,
    binding: Option<BindReport>,
}

impl Step {
    fn new(registration: A2pRegistration, action: AdvanceAction) -> Self {
        Self {
            registration,
            action,
            binding: None,
        }
    }
}

pub struct Orchestrator {
    pub(crate) registrations: Repository<A2pRegistration>,
    pub(crate) brands: Repository<A2pBrand>,
    pub(crate) campaigns: Repository<A2pCampaign>,
    pub(crate) attempts: Arc<dyn AttemptLog>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) registrar: Registrar,
    pub(crate) binder: NumberBinder,
    pub(crate) inventory: Arc<dyn NumberInventory>,
    pub(crate) gateway: Arc<dyn ComplianceGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn ComplianceGateway>,
        inventory: Arc<dyn NumberInventory>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let registrations = Repository::<A2pRegistration>::new(store.clone());
        let brands = Repository::<A2pBrand>::new(store.clone());
        let campaigns = Repository::<A2pCampaign>::new(store.clone());
        let bindings = Repository::<NumberBinding>::new(store.clone());
        let attempts: Arc<dyn AttemptLog> = Arc::new(DocumentAttemptLog::new(store, clock.clone()));
        let reconciler = Arc::new(Reconciler::new(
            attempts.clone(),
            gateway.clone(),
            clock.clone(),
            config.reconciliation_timeout_chrono(),
        ));

        let registrar = Registrar::new(
            registrations.clone(),
            brands.clone(),
            campaigns.clone(),
            gateway.clone(),
            reconciler.clone(),
            clock.clone(),
        );
        let binder = NumberBinder::new(
            registrations.clone(),
            bindings,
            inventory.clone(),
            gateway.clone(),
            reconciler.clone(),
            clock.clone(),
        );

        Self {
            registrations,
            brands,
            campaigns,
            attempts,
            reconciler,
            registrar,
            binder,
            inventory,
            gateway,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn attempt_log(&self) -> Arc<dyn AttemptLog> {
        self.attempts.clone()
    }

    pub async fn get_registration(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<A2pRegistration> {
        self.registrations
            .load(tenant_id, &registration_id.to_string())
            .await?
            .ok_or_else(|| ComplianceError::not_found(format!("registration {registration_id}")))
    }

    /// Run the next outstanding unit of work. Safe to call repeatedly and concurrently.
    #[tracing::instrument(skip(self), err)]
    pub async fn advance(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> ComplianceResult<AdvanceReport> {
        let registration = self.get_registration(tenant_id, registration_id).await?;
        let from = registration.status;

        let step = if registration.is_frozen() || registration.is_terminal() {
            Step::new(registration, AdvanceAction::None)
        } else {
            match from {
                RegistrationStatus::Draft => {
                    // A refused brand leaves the registration a draft, still abandonable.
                    self.registrar.prepare_brand(&registration).await?;
                    let registration = self
                        .move_to(&registration, RegistrationStatus::BrandPending, TransitionEvidence::none())
                        .await?;
                    self.advance_brand(registration).await?
                }
                RegistrationStatus::BrandPending => self.advance_brand(registration).await?,
                RegistrationStatus::CampaignPending => self.advance_campaign(registration).await?,
                RegistrationStatus::Submitted => self.poll_decision(registration).await?,
                RegistrationStatus::Approved | RegistrationStatus::Rejected => {
                    Step::new(registration, AdvanceAction::None)
                }
            }
        };

        if step.registration.status != from {
            tracing::info!(
                %registration_id,
                from = %from,
                to = %step.registration.status,
                "registration advanced"
            );
        }
        Ok(AdvanceReport {
            registration_id,
            from,
            to: step.registration.status,
            action: step.action,
            binding: step.binding,
        })
    }

    async fn advance_brand(&self, registration: A2pRegistration) -> ComplianceResult<Step> {
        let brand = self.registrar.submit_brand(&registration).await?;
        let brand_ref = brand.upstream_ref.clone().ok_or_else(|| {
            ComplianceError::InvariantViolation("accepted brand has no upstream reference".into())
        })?;
        let brand_id = brand.id;

        let registration = self
            .update_registration(registration.tenant_id, registration.id, |r| {
                let now = self.clock.now();
                let linked = r.brand_id.is_none();
                r.link_brand(brand_id, now)?;
                if r.status.rank() >= RegistrationStatus::CampaignPending.rank() {
                    return Ok(linked);
                }
                r.transition_to(
                    RegistrationStatus::CampaignPending,
                    &TransitionEvidence::brand(brand_ref.clone()),
                    now,
                )?;
                Ok(true)
            })
            .await?;
        Ok(Step::new(registration, AdvanceAction::BrandSubmitted))
    }

    async fn advance_campaign(&self, registration: A2pRegistration) -> ComplianceResult<Step> {
        let campaign = match self.registrar.load_campaign(&registration).await? {
            Some(campaign) if campaign.upstream_ref.is_some() => campaign,
            _ => return self.submit_campaign(registration).await,
        };
        if !campaign.is_active() {
            return Err(ComplianceError::fatal(
                AttemptType::CampaignRegistration,
                campaign
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "campaign rejected".into()),
            ));
        }
        if registration.phone_numbers.is_empty() {
            return Err(ComplianceError::validation(
                "select at least one phone number before submitting",
            ));
        }

        let campaign_ref = campaign.upstream_ref.clone().unwrap_or_default();
        let report = self.binder.bind_numbers(&registration, &campaign_ref).await?;
        let registered = report.registered.len();
        let unresolved = report.unresolved();
        let bound = registration.phone_numbers.clone();
        let campaign_id = campaign.id;

        let registration = self
            .update_registration(registration.tenant_id, registration.id, |r| {
                let now = self.clock.now();
                let linked = r.campaign_id.is_none();
                r.link_campaign(campaign_id, now)?;
                // The selection changed while binding; the next pass re-binds.
                if !report.is_complete() || r.phone_numbers != bound {
                    return Ok(linked);
                }
                if r.status.rank() >= RegistrationStatus::Submitted.rank() {
                    return Ok(linked);
                }
                r.transition_to(
                    RegistrationStatus::Submitted,
                    &TransitionEvidence::numbers(campaign_ref.clone(), registered, unresolved),
                    now,
                )?;
                Ok(true)
            })
            .await?;

        Ok(Step {
            registration,
            action: AdvanceAction::NumbersBound,
            binding: Some(report),
        })
    }

    async fn submit_campaign(&self, registration: A2pRegistration) -> ComplianceResult<Step> {
        if !registration.has_valid_attestations() {
            return Err(ComplianceError::validation(
                "compliance attestations are required before the campaign is submitted",
            ));
        }
        let brand = self.registrar.load_brand(&registration).await?.ok_or_else(|| {
            ComplianceError::InvariantViolation(format!(
                "registration {} has no brand",
                registration.id
            ))
        })?;
        let campaign = self.registrar.submit_campaign(&registration, &brand).await?;
        let campaign_id = campaign.id;

        let registration = self
            .update_registration(registration.tenant_id, registration.id, |r| {
                let linked = r.campaign_id.is_none();
                r.link_campaign(campaign_id, self.clock.now())?;
                Ok(linked)
            })
            .await?;
        Ok(Step::new(registration, AdvanceAction::CampaignSubmitted))
    }

    /// Ask upstream for the campaign decision and apply it.
    async fn poll_decision(&self, registration: A2pRegistration) -> ComplianceResult<Step> {
        let campaign = self.registrar.load_campaign(&registration).await?.ok_or_else(|| {
            ComplianceError::InvariantViolation(format!(
                "submitted registration {} has no campaign",
                registration.id
            ))
        })?;

        if campaign.status == CampaignStatus::Pending {
            let campaign_ref = campaign.upstream_ref.clone().ok_or_else(|| {
                ComplianceError::InvariantViolation("submitted campaign has no upstream reference".into())
            })?;
            let attempt = self.check_campaign_status(&registration, &campaign_ref).await?;
            match &attempt.outcome {
                Some(GatewayOutcome::Retriable { reason }) => {
                    return Err(ComplianceError::retriable(AttemptType::StatusCheck, reason.clone()));
                }
                Some(GatewayOutcome::NotFound) => {
                    tracing::warn!(%campaign_ref, "upstream has no record of the submitted campaign");
                }
                _ => {}
            }
            if let Some(update) = attempt
                .outcome
                .as_ref()
                .and_then(|o| UpstreamStatusUpdate::from_outcome(&campaign_ref, o))
            {
                self.registrar.apply_campaign_status(&registration, &update).await?;
            }
        }

        let registration = self.settle_decision(&registration).await?;
        Ok(Step::new(registration, AdvanceAction::StatusChecked))
    }

    async fn check_campaign_status(
        &self,
        registration: &A2pRegistration,
        campaign_ref: &str,
    ) -> ComplianceResult<ComplianceAttempt> {
        let start = AttemptStart {
            tenant_id: registration.tenant_id,
            slot: AttemptSlot::status_check(registration.id, format!("{CAMPAIGN_POLL_PREFIX}{campaign_ref}")),
            request: serde_json::json!({ "query": "reference", "upstream_ref": campaign_ref }),
        };
        match self.reconciler.open(start).await? {
            Opened::Fresh(attempt) => {
                let query = StatusQuery::Reference(campaign_ref.to_string());
                let response = self.gateway.check_status(&query, &attempt.idempotency_key).await;
                self.reconciler.finalize(&attempt, response).await
            }
            Opened::Settled(attempt) => Ok(attempt),
        }
    }

    /// Move a submitted registration to its terminal state once the sub-entities decided.
    pub(crate) async fn settle_decision(
        &self,
        registration: &A2pRegistration,
    ) -> ComplianceResult<A2pRegistration> {
        let brand = self.registrar.load_brand(registration).await?;
        let campaign = self.registrar.load_campaign(registration).await?;

        let decision = match (&brand, &campaign) {
            (Some(b), _) if b.status == BrandStatus::Rejected => {
                Some((RegistrationStatus::Rejected, b.rejection_reason.clone()))
            }
            (_, Some(c)) if c.status == CampaignStatus::Rejected => {
                Some((RegistrationStatus::Rejected, c.rejection_reason.clone()))
            }
            (_, Some(c)) if c.status == CampaignStatus::Approved => {
                Some((RegistrationStatus::Approved, None))
            }
            _ => None,
        };
        let Some((next, reason)) = decision else {
            return Ok(registration.clone());
        };

        self.update_registration(registration.tenant_id, registration.id, |r| {
            if r.status != RegistrationStatus::Submitted || r.is_frozen() {
                return Ok(false);
            }
            r.transition_to(next, &TransitionEvidence::decision(reason.clone()), self.clock.now())?;
            Ok(true)
        })
        .await
    }

    async fn move_to(
        &self,
        registration: &A2pRegistration,
        next: RegistrationStatus,
        evidence: TransitionEvidence,
    ) -> ComplianceResult<A2pRegistration> {
        self.update_registration(registration.tenant_id, registration.id, |r| {
            if r.status.rank() >= next.rank() {
                return Ok(false);
            }
            r.transition_to(next, &evidence, self.clock.now())?;
            Ok(true)
        })
        .await
    }

    /// Read, mutate and compare-and-swap a registration.
    ///
    /// `f` returns whether it changed anything; it is re-run against a fresh read
    /// after every lost race, up to `max_cas_retries` times.
    pub(crate) async fn update_registration<F>(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        mut f: F,
    ) -> ComplianceResult<A2pRegistration>
    where
        F: FnMut(&mut A2pRegistration) -> DomainResult<bool> + Send,
    {
        let rounds = self.config.max_cas_retries.max(1);
        for round in 0..rounds {
            let mut registration = self.get_registration(tenant_id, registration_id).await?;
            if !f(&mut registration)? {
                return Ok(registration);
            }
            match self.registrations.save(&mut registration).await {
                Ok(()) => return Ok(registration),
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(%registration_id, round, "registration write lost a race, retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(ComplianceError::conflict(format!(
            "registration {registration_id} kept changing concurrently"
        )))
    }

    pub(crate) async fn absorb(&self, attempt: &ComplianceAttempt) -> ComplianceResult<()> {
        match attempt.attempt_type() {
            AttemptType::PhoneAssignment => {
                self.binder.absorb(attempt).await?;
            }
            AttemptType::BrandRegistration | AttemptType::CampaignRegistration => {
                let registration = self
                    .registrations
                    .load_any(&attempt.registration_id().to_string())
                    .await?
                    .ok_or_else(|| {
                        ComplianceError::not_found(format!(
                            "registration {}",
                            attempt.registration_id()
                        ))
                    })?;
                self.registrar.absorb(&registration, attempt).await?;
            }
            AttemptType::StatusCheck => {}
        }
        Ok(())
    }
}
