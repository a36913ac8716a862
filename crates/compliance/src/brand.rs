//! Brand sub-entity: the legal business identity registered upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_core::{AggregateRoot, BrandId, DomainError, DomainResult, RegistrationId, TenantId};

use crate::outcome::ReviewState;
use crate::phone::PhoneNumber;

/// Raw brand step payload as submitted by the wizard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandForm {
    pub company_name: String,
    pub website: String,
    pub support_email: String,
    pub support_phone: String,
    pub tax_id: String,
    pub business_type: String,
    pub industry_vertical: String,
}

impl BrandForm {
    /// Local completeness checks. All problems are reported in one message.
    pub fn validate(&self) -> DomainResult<()> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("company_name", &self.company_name),
            ("tax_id", &self.tax_id),
            ("business_type", &self.business_type),
            ("industry_vertical", &self.industry_vertical),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{name} is required"));
            }
        }

        let website = self.website.trim();
        if !(website.starts_with("https://") || website.starts_with("http://")) {
            problems.push("website must be an http(s) URL".to_string());
        }

        let email = self.support_email.trim();
        match email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && domain.contains('.') => {}
            _ => problems.push("support_email must be an email address".to_string()),
        }

        if let Err(err) = PhoneNumber::parse(&self.support_phone) {
            problems.push(match err {
                DomainError::Validation(msg) => msg,
                other => other.to_string(),
            });
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
pub enum BrandStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct A2pBrand {
    pub id: BrandId,
    pub tenant_id: TenantId,
    pub registration_id: RegistrationId,
    pub form: BrandForm,
    pub status: BrandStatus,
    pub upstream_ref: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl A2pBrand {
    pub fn new(
        id: BrandId,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        form: BrandForm,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        form.validate()?;
        Ok(Self {
            id,
            tenant_id,
            registration_id,
            form,
            status: BrandStatus::Pending,
            upstream_ref: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// Active = not rejected. A tenant holds at most one active brand.
    pub fn is_active(&self) -> bool {
        self.status != BrandStatus::Rejected
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BrandStatus::Approved | BrandStatus::Rejected)
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
                    "brand already holds upstream reference {existing}"
                )));
            }
        }
        self.upstream_ref = Some(upstream_ref);
        if review == ReviewState::Approved {
            self.status = BrandStatus::Approved;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_approved(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_mutable()?;
        if self.upstream_ref.is_none() {
            return Err(DomainError::invariant(
                "brand cannot be approved without an upstream reference",
            ));
        }
        self.status = BrandStatus::Approved;
        self.updated_at = now;
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_mutable()?;
        self.status = BrandStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    fn ensure_mutable(&self) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "brand {} is {:?} and can no longer change",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for A2pBrand {
    type Id = BrandId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
pub(crate) fn valid_brand_form() -> BrandForm {
    BrandForm {
        company_name: "Acme Voice LLC".into(),
        website: "https://acme.example".into(),
        support_email: "support@acme.example".into(),
        support_phone: "+1 555 010 0000".into(),
        tax_id: "12-3456789".into(),
        business_type: "private_profit".into(),
        industry_vertical: "technology".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn validate_reports_every_problem() {
        let form = BrandForm {
            website: "acme.example".into(),
            ..Default::default()
        };
        let err = form.validate().unwrap_err();
        let DomainError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(msg.contains("company_name"));
        assert!(msg.contains("website"));
        assert!(msg.contains("support_email"));
        assert!(msg.contains("E.164"));
    }

    #[test]
    fn in_review_acceptance_keeps_pending() {
        let mut b = brand();
        b.record_acceptance("BN1", ReviewState::InReview, Utc::now())
            .unwrap();
        assert_eq!(b.status, BrandStatus::Pending);
        assert!(b.has_confirmed_ref());

        b.mark_approved(Utc::now()).unwrap();
        assert_eq!(b.status, BrandStatus::Approved);
    }

    #[test]
    fn terminal_brand_is_immutable() {
        let mut b = brand();
        b.reject("tax id mismatch", Utc::now()).unwrap();
        assert!(!b.is_active());

        match b.record_acceptance("BN1", ReviewState::Approved, Utc::now()) {
            Err(DomainError::InvariantViolation(_)) => {}
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn approval_requires_reference() {
        let mut b = brand();
        assert!(b.mark_approved(Utc::now()).is_err());
    }
}
