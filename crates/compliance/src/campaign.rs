//! Campaign sub-entity: the messaging use case registered under a brand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_core::{
    AggregateRoot, BrandId, CampaignId, DomainError, DomainResult, RegistrationId, TenantId,
};

use crate::brand::A2pBrand;
use crate::outcome::ReviewState;

const MAX_SAMPLE_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignForm {
    pub name: String,
    pub description: String,
    pub use_case: String,
    pub vertical: String,
    pub traffic_type: String,
    #[serde(default)]
    pub sample_messages: Vec<String>,
    #[serde(default)]
    pub sample_urls: Vec<String>,
    /// How end users opt in to receive messages.
    #[serde(default)]
    pub message_flow: String,
}

impl CampaignForm {
    pub fn validate(&self) -> DomainResult<()> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("name", &self.name),
            ("description", &self.description),
            ("use_case", &self.use_case),
            ("vertical", &self.vertical),
            ("traffic_type", &self.traffic_type),
            ("message_flow", &self.message_flow),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{name} is required"));
            }
        }

        if self.sample_messages.iter().all(|m| m.trim().is_empty()) {
            problems.push("at least one sample message is required".to_string());
        }
        if let Some(i) = self
            .sample_messages
            .iter()
            .position(|m| m.chars().count() > MAX_SAMPLE_MESSAGE_LEN)
        {
            problems.push(format!(
                "sample_messages[{i}] exceeds {MAX_SAMPLE_MESSAGE_LEN} characters"
            ));
        }
        for url in &self.sample_urls {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                problems.push(format!("sample url '{url}' must be an http(s) URL"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DomainError::validation(problems.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct A2pCampaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub registration_id: RegistrationId,
    pub brand_id: BrandId,
    pub brand_upstream_ref: String,
    pub form: CampaignForm,
    pub status: CampaignStatus,
    pub upstream_ref: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl A2pCampaign {
    /// Create a campaign under `brand`.
    ///
    /// The brand must be pending or approved and hold a confirmed upstream reference.
    pub fn new(
        id: CampaignId,
        brand: &A2pBrand,
        form: CampaignForm,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let Some(brand_ref) = brand.upstream_ref.clone().filter(|_| brand.is_active()) else {
            return Err(DomainError::invariant(
                "campaign requires an active brand with an upstream reference",
            ));
        };
        form.validate()?;

        Ok(Self {
            id,
            tenant_id: brand.tenant_id,
            registration_id: brand.registration_id,
            brand_id: brand.id,
            brand_upstream_ref: brand_ref,
            form,
            status: CampaignStatus::Pending,
            upstream_ref: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status != CampaignStatus::Rejected
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, CampaignStatus::Approved | CampaignStatus::Rejected)
    }

    pub fn has_confirmed_ref(&self) -> bool {
        self.is_active() && self.upstream_ref.is_some()
    }

    pub fn record_acceptance(
        &mut self,
        upstream_ref: impl Into<String>,
        review: ReviewState,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_mutable()?;
        let upstream_ref = upstream_ref.into();
        if let Some(existing) = &self.upstream_ref {
            if existing != &upstream_ref {
                return Err(DomainError::invariant(format!(
                    "campaign already holds upstream reference {existing}"
                )));
            }
        }
        self.upstream_ref = Some(upstream_ref);
        if review == ReviewState::Approved {
            self.status = CampaignStatus::Approved;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_approved(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_mutable()?;
        if self.upstream_ref.is_none() {
            return Err(DomainError::invariant(
                "campaign cannot be approved without an upstream reference",
            ));
        }
        self.status = CampaignStatus::Approved;
        self.updated_at = now;
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_mutable()?;
        self.status = CampaignStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    fn ensure_mutable(&self) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "campaign {} is {:?} and can no longer change",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for A2pCampaign {
    type Id = CampaignId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
pub(crate) fn valid_campaign_form() -> CampaignForm {
    CampaignForm {
        name: "Appointment reminders".into(),
        description: "Reminders for booked appointments".into(),
        use_case: "account_notification".into(),
        vertical: "healthcare".into(),
        traffic_type: "low_volume_mixed".into(),
        sample_messages: vec!["Hi Sam, your appointment is tomorrow at 3pm. Reply STOP to opt out.".into()],
        sample_urls: vec!["https://acme.example/appointments".into()],
        message_flow: "Customers opt in on the booking form checkbox".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::valid_brand_form;

    fn brand() -> A2pBrand {
        A2pBrand::new(
            BrandId::new(),
            TenantId::new(),
            RegistrationId::new(),
            valid_brand_form(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn requires_brand_reference() {
        let b = brand();
        let err = A2pCampaign::new(CampaignId::new(), &b, valid_campaign_form(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn rejected_brand_cannot_host_campaign() {
        let mut b = brand();
        b.record_acceptance("BN1", ReviewState::InReview, Utc::now())
            .unwrap();
        b.reject("upstream vetting failed", Utc::now()).unwrap();
        assert!(A2pCampaign::new(CampaignId::new(), &b, valid_campaign_form(), Utc::now()).is_err());
    }

    #[test]
    fn created_under_pending_brand_with_ref() {
        let mut b = brand();
        b.record_acceptance("BN1", ReviewState::InReview, Utc::now())
            .unwrap();
        let c = A2pCampaign::new(CampaignId::new(), &b, valid_campaign_form(), Utc::now()).unwrap();
        assert_eq!(c.brand_upstream_ref, "BN1");
        assert_eq!(c.registration_id, b.registration_id);
        assert_eq!(c.status, CampaignStatus::Pending);
    }

    #[test]
    fn sample_messages_are_checked() {
        let mut form = valid_campaign_form();
        form.sample_messages = vec!["x".repeat(MAX_SAMPLE_MESSAGE_LEN + 1)];
        form.sample_urls = vec!["ftp://nope".into()];
        let DomainError::Validation(msg) = form.validate().unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(msg.contains("sample_messages[0]"));
        assert!(msg.contains("ftp://nope"));
    }
}
