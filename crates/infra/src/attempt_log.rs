//! Append-only log of outbound compliance calls.
//!
//! The only writer of [`ComplianceAttempt`] documents. Starting an attempt is a
//! create-if-absent write on the next sequence number of its slot, so two
//! concurrent starters cannot both open an attempt: the loser re-reads, sees
//! the winner's pending head and gets [`AttemptLogError::InFlight`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use dialtone_compliance::{
    AttemptId, AttemptResolution, AttemptSlot, AttemptType, ComplianceAttempt,
};
use dialtone_core::{Clock, DomainError, RegistrationId, TenantId};

use crate::repository::Repository;
use crate::store::{DocumentStore, StoreError};

/// Slots are retried this many times when a concurrent starter takes the next sequence.
const MAX_START_RACES: usize = 8;

#[derive(Debug, Clone)]
pub struct AttemptStart {
    pub tenant_id: TenantId,
    pub slot: AttemptSlot,
    pub request: JsonValue,
}

#[derive(Debug, Error)]
pub enum AttemptLogError {
    /// The slot already has a pending attempt.
    #[error("attempt {} is still in flight", .0.id)]
    InFlight(Box<ComplianceAttempt>),

    #[error("attempt {0} already finalized")]
    AlreadyFinalized(AttemptId),

    #[error("attempt {0} not found")]
    NotFound(String),

    #[error("attempt log inconsistent: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn record_attempt_start(
        &self,
        start: AttemptStart,
    ) -> Result<ComplianceAttempt, AttemptLogError>;

    async fn record_attempt_end(
        &self,
        attempt_id: &AttemptId,
        resolution: AttemptResolution,
    ) -> Result<ComplianceAttempt, AttemptLogError>;

    async fn find_pending_attempt(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        attempt_type: AttemptType,
        subject: Option<&str>,
    ) -> Result<Option<ComplianceAttempt>, AttemptLogError>;

    async fn get(&self, attempt_id: &AttemptId) -> Result<Option<ComplianceAttempt>, AttemptLogError>;

    /// Every attempt of a registration, oldest first.
    async fn list_attempts(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> Result<Vec<ComplianceAttempt>, AttemptLogError>;

    async fn list_pending(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<ComplianceAttempt>, AttemptLogError>;
}

/// [`AttemptLog`] over the shared document store.
pub struct DocumentAttemptLog {
    attempts: Repository<ComplianceAttempt>,
    clock: Arc<dyn Clock>,
}

impl DocumentAttemptLog {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: Repository::new(store),
            clock,
        }
    }

    async fn slot_attempts(
        &self,
        tenant_id: TenantId,
        slot: &AttemptSlot,
    ) -> Result<Vec<ComplianceAttempt>, AttemptLogError> {
        // Keys are `{slot}#{sequence}`; the trailing `#` keeps sibling slots out.
        let mut attempts: Vec<_> = self
            .attempts
            .list_prefix(Some(tenant_id), &format!("{slot}#"))
            .await?
            .into_iter()
            .filter(|a| &a.id.slot == slot)
            .collect();
        attempts.sort_by_key(|a| a.id.sequence);
        Ok(attempts)
    }
}

#[async_trait]
impl AttemptLog for DocumentAttemptLog {
    async fn record_attempt_start(
        &self,
        start: AttemptStart,
    ) -> Result<ComplianceAttempt, AttemptLogError> {
        for _ in 0..MAX_START_RACES {
            let existing = self.slot_attempts(start.tenant_id, &start.slot).await?;
            let head = existing.last();

            if let Some(head) = head.filter(|h| h.is_pending()) {
                return Err(AttemptLogError::InFlight(Box::new(head.clone())));
            }

            let sequence = head.map(|h| h.id.sequence).unwrap_or(0) + 1;
            let mut attempt = ComplianceAttempt::start(
                start.tenant_id,
                AttemptId::new(start.slot.clone(), sequence),
                start.request.clone(),
                self.clock.now(),
            );

            match self.attempts.insert(&mut attempt).await {
                Ok(()) => {
                    tracing::debug!(
                        attempt_id = %attempt.id,
                        idempotency_key = %attempt.idempotency_key,
                        "attempt started"
                    );
                    return Ok(attempt);
                }
                // Someone else took this sequence number; re-read the slot.
                Err(StoreError::Conflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        Err(AttemptLogError::Corrupt(format!(
            "slot {} kept changing while starting an attempt",
            start.slot
        )))
    }

    async fn record_attempt_end(
        &self,
        attempt_id: &AttemptId,
        resolution: AttemptResolution,
    ) -> Result<ComplianceAttempt, AttemptLogError> {
        let key = attempt_id.key();
        let Some(mut attempt) = self.attempts.load_any(&key).await? else {
            return Err(AttemptLogError::NotFound(key));
        };

        match attempt.finish(resolution, self.clock.now()) {
            Ok(()) => {}
            Err(DomainError::Conflict(_)) => {
                return Err(AttemptLogError::AlreadyFinalized(attempt_id.clone()));
            }
            Err(other) => return Err(AttemptLogError::Corrupt(other.to_string())),
        }

        match self.attempts.save(&mut attempt).await {
            Ok(()) => {
                tracing::debug!(
                    attempt_id = %attempt.id,
                    status = ?attempt.status,
                    error_kind = ?attempt.error_kind,
                    "attempt finalized"
                );
                Ok(attempt)
            }
            // The only other writer of an attempt is another finalizer.
            Err(StoreError::Conflict(_)) => Err(AttemptLogError::AlreadyFinalized(attempt_id.clone())),
            Err(other) => Err(other.into()),
        }
    }

    async fn find_pending_attempt(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
        attempt_type: AttemptType,
        subject: Option<&str>,
    ) -> Result<Option<ComplianceAttempt>, AttemptLogError> {
        let slot = AttemptSlot::new(registration_id, attempt_type, subject.map(str::to_string));
        Ok(self
            .slot_attempts(tenant_id, &slot)
            .await?
            .pop()
            .filter(|a| a.is_pending()))
    }

    async fn get(&self, attempt_id: &AttemptId) -> Result<Option<ComplianceAttempt>, AttemptLogError> {
        Ok(self.attempts.load_any(&attempt_id.key()).await?)
    }

    async fn list_attempts(
        &self,
        tenant_id: TenantId,
        registration_id: RegistrationId,
    ) -> Result<Vec<ComplianceAttempt>, AttemptLogError> {
        let mut attempts: Vec<_> = self
            .attempts
            .list_prefix(Some(tenant_id), &format!("{registration_id}/"))
            .await?
            .into_iter()
            .filter(|a| a.registration_id() == registration_id)
            .collect();
        attempts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.key().cmp(&b.id.key()))
        });
        Ok(attempts)
    }

    async fn list_pending(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<ComplianceAttempt>, AttemptLogError> {
        Ok(self
            .attempts
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|a| a.is_pending())
            .collect())
    }
}
