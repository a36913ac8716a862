//! Per-number ownership document.
//!
//! One binding exists per E.164 number, globally. It names the registration
//! currently holding the number and the number's assignment state. Claims and
//! takeovers go through conditional writes in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_core::{AggregateRoot, DomainError, DomainResult, RegistrationId, TenantId};

use crate::phone::PhoneNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberBindingStatus {
    Selected,
    Submitted,
    Registered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberFailure {
    pub reason: String,
    /// Fatal failures are not retried by later advances.
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberBinding {
    pub number: PhoneNumber,
    pub tenant_id: TenantId,
    pub registration_id: RegistrationId,
    pub status: NumberBindingStatus,
    pub upstream_ref: Option<String>,
    pub failure: Option<NumberFailure>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl NumberBinding {
    pub fn selected(
        number: PhoneNumber,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            tenant_id,
            registration_id,
            status: NumberBindingStatus::Selected,
            upstream_ref: None,
            failure: None,
            released_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Hand the number to another registration, resetting assignment state.
    ///
    /// Callers only do this once the current owner is released or inactive.
    pub fn reassign_to(
        &mut self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        now: DateTime<Utc>,
    ) {
        self.tenant_id = tenant_id;
        self.registration_id = registration_id;
        self.status = NumberBindingStatus::Selected;
        self.upstream_ref = None;
        self.failure = None;
        self.released_at = None;
        self.updated_at = now;
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    pub fn is_held_by(&self, registration_id: RegistrationId) -> bool {
        !self.is_released() && self.registration_id == registration_id
    }

    /// True when the binder still has to (re)submit this number.
    pub fn needs_dispatch(&self) -> bool {
        match self.status {
            NumberBindingStatus::Selected | NumberBindingStatus::Submitted => true,
            NumberBindingStatus::Failed => !self.failure.as_ref().is_some_and(|f| f.fatal),
            NumberBindingStatus::Registered => false,
        }
    }

    pub fn is_fatally_failed(&self) -> bool {
        self.status == NumberBindingStatus::Failed && self.failure.as_ref().is_some_and(|f| f.fatal)
    }

    pub fn mark_submitted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_registered()?;
        self.status = NumberBindingStatus::Submitted;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_registered(
        &mut self,
        upstream_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.is_released() {
            return Err(DomainError::invariant(format!(
                "number {} was released",
                self.number
            )));
        }
        self.status = NumberBindingStatus::Registered;
        self.upstream_ref = Some(upstream_ref.into());
        self.failure = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        fatal: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_not_registered()?;
        self.status = NumberBindingStatus::Failed;
        self.failure = Some(NumberFailure {
            reason: reason.into(),
            fatal,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Give the number back. A registered number stays with its campaign.
    pub fn release(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_registered()?;
        self.released_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn ensure_not_registered(&self) -> DomainResult<()> {
        if self.status == NumberBindingStatus::Registered {
            return Err(DomainError::invariant(format!(
                "number {} is already registered to a campaign",
                self.number
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for NumberBinding {
    type Id = PhoneNumber;

    fn id(&self) -> &Self::Id {
        &self.number
    }

    fn version(&self) -> u64 {
        self.version
    }
}
