//! Registration aggregate: the tenant's end-to-end 10DLC registration.
//!
//! ```text
//! draft -> brand_pending -> campaign_pending -> submitted -> approved
//!                                                         \-> rejected
//! ```
//!
//! Status moves forward one step at a time. Each pending step requires evidence
//! from its sub-entity (see [`TransitionEvidence`]); the aggregate itself does
//! no IO and trusts the orchestrator to gather that evidence from the store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_core::{
    AggregateRoot, BrandId, CampaignId, DomainError, DomainResult, RegistrationId, TenantId,
    UserId,
};

use crate::brand::BrandForm;
use crate::campaign::CampaignForm;
use crate::phone::PhoneNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Draft,
    BrandPending,
    CampaignPending,
    Submitted,
    Approved,
    Rejected,
}

impl RegistrationStatus {
    pub const ALL: [RegistrationStatus; 6] = [
        RegistrationStatus::Draft,
        RegistrationStatus::BrandPending,
        RegistrationStatus::CampaignPending,
        RegistrationStatus::Submitted,
        RegistrationStatus::Approved,
        RegistrationStatus::Rejected,
    ];

    /// Position in the lifecycle. Both terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            RegistrationStatus::Draft => 0,
            RegistrationStatus::BrandPending => 1,
            RegistrationStatus::CampaignPending => 2,
            RegistrationStatus::Submitted => 3,
            RegistrationStatus::Approved | RegistrationStatus::Rejected => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RegistrationStatus::Approved | RegistrationStatus::Rejected)
    }

    pub fn can_transition_to(self, next: RegistrationStatus) -> bool {
        !self.is_terminal() && next.rank() == self.rank() + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Draft => "draft",
            RegistrationStatus::BrandPending => "brand_pending",
            RegistrationStatus::CampaignPending => "campaign_pending",
            RegistrationStatus::Submitted => "submitted",
            RegistrationStatus::Approved => "approved",
            RegistrationStatus::Rejected => "rejected",
        }
    }
}

impl core::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wizard steps in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    Brand,
    Campaign,
    PhoneNumbers,
    Attestations,
    Review,
}

impl WizardStep {
    pub fn ordinal(self) -> u8 {
        match self {
            WizardStep::Brand => 1,
            WizardStep::Campaign => 2,
            WizardStep::PhoneNumbers => 3,
            WizardStep::Attestations => 4,
            WizardStep::Review => 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceAttestations {
    pub opt_in_consent: bool,
    pub terms_accepted: bool,
    #[serde(default)]
    pub accepted_by: Option<UserId>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl ComplianceAttestations {
    pub fn validate(&self) -> DomainResult<()> {
        let mut problems = Vec::new();
        if !self.opt_in_consent {
            problems.push("opt-in consent must be attested");
        }
        if !self.terms_accepted {
            problems.push("terms must be accepted");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DomainError::validation(problems.join("; ")))
        }
    }
}

/// Raw per-step wizard payloads, persisted with the aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationForms {
    pub brand: Option<BrandForm>,
    pub campaign: Option<CampaignForm>,
    #[serde(default)]
    pub phone_selection: Vec<String>,
    pub attestations: Option<ComplianceAttestations>,
}

/// Facts gathered from sub-entities that justify a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionEvidence {
    pub brand_ref: Option<String>,
    pub campaign_ref: Option<String>,
    pub registered_numbers: usize,
    pub unresolved_numbers: usize,
    /// Upstream explanation for a rejection.
    pub reason: Option<String>,
}

impl TransitionEvidence {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn brand(brand_ref: impl Into<String>) -> Self {
        Self {
            brand_ref: Some(brand_ref.into()),
            ..Self::default()
        }
    }

    pub fn numbers(
        campaign_ref: impl Into<String>,
        registered_numbers: usize,
        unresolved_numbers: usize,
    ) -> Self {
        Self {
            campaign_ref: Some(campaign_ref.into()),
            registered_numbers,
            unresolved_numbers,
            ..Self::default()
        }
    }

    pub fn decision(reason: Option<String>) -> Self {
        Self {
            reason,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct A2pRegistration {
    pub id: RegistrationId,
    pub tenant_id: TenantId,
    pub status: RegistrationStatus,
    pub current_step: u8,
    pub brand_id: Option<BrandId>,
    pub campaign_id: Option<CampaignId>,
    pub phone_numbers: BTreeSet<PhoneNumber>,
    pub forms: RegistrationForms,
    pub completed_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub resubmission_of: Option<RegistrationId>,
    pub superseded_by: Option<RegistrationId>,
    #[serde(skip)]
    pub version: u64,
}

impl A2pRegistration {
    pub fn new(
        id: RegistrationId,
        tenant_id: TenantId,
        completed_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            status: RegistrationStatus::Draft,
            current_step: WizardStep::Brand.ordinal(),
            brand_id: None,
            campaign_id: None,
            phone_numbers: BTreeSet::new(),
            forms: RegistrationForms::default(),
            completed_by,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            approved_at: None,
            rejected_at: None,
            rejection_reason: None,
            abandoned_at: None,
            resubmission_of: None,
            superseded_by: None,
            version: 0,
        }
    }

    /// Fresh draft carrying over the predecessor's brand and campaign forms.
    ///
    /// Numbers are not carried over: they must be claimed again.
    pub fn resubmission(
        id: RegistrationId,
        predecessor: &A2pRegistration,
        completed_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = Self::new(id, predecessor.tenant_id, completed_by, now);
        next.forms.brand = predecessor.forms.brand.clone();
        next.forms.campaign = predecessor.forms.campaign.clone();
        if next.forms.brand.is_some() {
            next.record_step(WizardStep::Brand);
        }
        if next.forms.campaign.is_some() {
            next.record_step(WizardStep::Campaign);
        }
        next.resubmission_of = Some(predecessor.id);
        next
    }

    pub fn is_frozen(&self) -> bool {
        self.abandoned_at.is_some() || self.superseded_by.is_some()
    }

    /// Active registrations may hold numbers and a brand.
    pub fn is_active(&self) -> bool {
        !self.is_frozen() && self.status != RegistrationStatus::Rejected
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_valid_attestations(&self) -> bool {
        self.forms
            .attestations
            .as_ref()
            .is_some_and(|a| a.validate().is_ok())
    }

    pub fn record_step(&mut self, step: WizardStep) {
        let next = (step.ordinal() + 1).min(WizardStep::Review.ordinal());
        self.current_step = self.current_step.max(next);
    }

    pub fn save_brand_form(&mut self, form: BrandForm, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_frozen()?;
        if self.status != RegistrationStatus::Draft {
            return Err(DomainError::invariant(
                "brand details can only be edited while the registration is a draft",
            ));
        }
        form.validate()?;
        self.forms.brand = Some(form);
        self.record_step(WizardStep::Brand);
        self.updated_at = now;
        Ok(())
    }

    pub fn save_campaign_form(
        &mut self,
        form: CampaignForm,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_not_frozen()?;
        if self.campaign_id.is_some() || self.status.rank() > RegistrationStatus::CampaignPending.rank() {
            return Err(DomainError::invariant(
                "campaign details cannot change once the campaign has been created",
            ));
        }
        form.validate()?;
        self.forms.campaign = Some(form);
        self.record_step(WizardStep::Campaign);
        self.updated_at = now;
        Ok(())
    }

    /// Replace the selection. `raw` is the wizard payload as submitted.
    pub fn set_phone_numbers(
        &mut self,
        numbers: BTreeSet<PhoneNumber>,
        raw: Vec<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_before_submission("phone numbers")?;
        self.phone_numbers = numbers;
        self.forms.phone_selection = raw;
        self.record_step(WizardStep::PhoneNumbers);
        self.updated_at = now;
        Ok(())
    }

    /// Returns whether the number was part of the selection.
    pub fn remove_phone_number(
        &mut self,
        number: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        self.ensure_before_submission("phone numbers")?;
        let removed = self.phone_numbers.remove(number);
        if removed {
            self.forms
                .phone_selection
                .retain(|raw| PhoneNumber::parse(raw).map_or(true, |n| &n != number));
            self.updated_at = now;
        }
        Ok(removed)
    }

    pub fn save_attestations(
        &mut self,
        attestations: ComplianceAttestations,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_before_submission("attestations")?;
        attestations.validate()?;
        self.forms.attestations = Some(attestations);
        self.record_step(WizardStep::Attestations);
        self.updated_at = now;
        Ok(())
    }

    pub fn link_brand(&mut self, brand_id: BrandId, now: DateTime<Utc>) -> DomainResult<()> {
        match self.brand_id {
            Some(existing) if existing != brand_id => Err(DomainError::invariant(format!(
                "registration already linked to brand {existing}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.brand_id = Some(brand_id);
                self.updated_at = now;
                Ok(())
            }
        }
    }

    pub fn link_campaign(&mut self, campaign_id: CampaignId, now: DateTime<Utc>) -> DomainResult<()> {
        match self.campaign_id {
            Some(existing) if existing != campaign_id => Err(DomainError::invariant(format!(
                "registration already linked to campaign {existing}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.campaign_id = Some(campaign_id);
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// Move to `next`, checking ordering and evidence.
    pub fn transition_to(
        &mut self,
        next: RegistrationStatus,
        evidence: &TransitionEvidence,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_not_frozen()?;
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "illegal transition {} -> {}",
                self.status, next
            )));
        }

        match next {
            RegistrationStatus::Draft => {}
            RegistrationStatus::BrandPending => match &self.forms.brand {
                Some(form) => form.validate()?,
                None => return Err(DomainError::validation("brand details are required")),
            },
            RegistrationStatus::CampaignPending => {
                if evidence.brand_ref.is_none() || self.brand_id.is_none() {
                    return Err(DomainError::invariant(
                        "campaign_pending requires a brand upstream reference",
                    ));
                }
            }
            RegistrationStatus::Submitted => {
                if evidence.campaign_ref.is_none() || self.campaign_id.is_none() {
                    return Err(DomainError::invariant(
                        "submitted requires a campaign upstream reference",
                    ));
                }
                if evidence.registered_numbers == 0 {
                    return Err(DomainError::invariant(
                        "submitted requires at least one registered number",
                    ));
                }
                if evidence.unresolved_numbers > 0 {
                    return Err(DomainError::invariant(format!(
                        "{} selected numbers are not registered yet",
                        evidence.unresolved_numbers
                    )));
                }
                self.submitted_at = Some(now);
            }
            RegistrationStatus::Approved => {
                self.approved_at = Some(now);
            }
            RegistrationStatus::Rejected => {
                self.rejected_at = Some(now);
                self.rejection_reason = evidence.reason.clone();
            }
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Abandon an unsubmitted draft.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_frozen()?;
        if self.status != RegistrationStatus::Draft {
            return Err(DomainError::invariant(format!(
                "only draft registrations can be abandoned (status: {})",
                self.status
            )));
        }
        self.abandoned_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_superseded(
        &mut self,
        successor: RegistrationId,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if let Some(existing) = self.superseded_by {
            return Err(DomainError::conflict(format!(
                "registration already superseded by {existing}"
            )));
        }
        if self.abandoned_at.is_some() {
            return Err(DomainError::invariant("abandoned registrations cannot be resubmitted"));
        }
        self.superseded_by = Some(successor);
        self.updated_at = now;
        Ok(())
    }

    fn ensure_not_frozen(&self) -> DomainResult<()> {
        if let Some(successor) = self.superseded_by {
            return Err(DomainError::invariant(format!(
                "registration was superseded by {successor}"
            )));
        }
        if self.abandoned_at.is_some() {
            return Err(DomainError::invariant("registration was abandoned"));
        }
        Ok(())
    }

    fn ensure_before_submission(&self, what: &str) -> DomainResult<()> {
        self.ensure_not_frozen()?;
        if self.status.rank() >= RegistrationStatus::Submitted.rank() {
            return Err(DomainError::invariant(format!(
                "{what} cannot change after submission"
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for A2pRegistration {
    type Id = RegistrationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
