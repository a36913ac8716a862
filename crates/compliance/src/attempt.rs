//! Append-only audit record of external compliance calls.
//!
//! Every outbound call is represented by exactly one [`ComplianceAttempt`]:
//!
//! - created `pending` **before** the call is dispatched
//! - finalized to `success` or `error` exactly once, right after the call resolves
//! - never deleted
//!
//! Attempts are grouped into [`AttemptSlot`]s (registration + type + subject).
//! Within a slot, attempts carry a monotonically increasing sequence number and
//! at most one attempt may be pending at a time; the storage layer enforces this
//! with a create-if-absent write on the next sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use dialtone_core::{AggregateRoot, DomainError, DomainResult, RegistrationId, TenantId};

use crate::outcome::GatewayOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    BrandRegistration,
    CampaignRegistration,
    PhoneAssignment,
    StatusCheck,
}

impl AttemptType {
    pub const ALL: [AttemptType; 4] = [
        AttemptType::BrandRegistration,
        AttemptType::CampaignRegistration,
        AttemptType::PhoneAssignment,
        AttemptType::StatusCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptType::BrandRegistration => "brand_registration",
            AttemptType::CampaignRegistration => "campaign_registration",
            AttemptType::PhoneAssignment => "phone_assignment",
            AttemptType::StatusCheck => "status_check",
        }
    }
}

impl core::fmt::Display for AttemptType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Success,
    Error,
}

/// Why an attempt ended in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// Network/timeout/5xx; the step may be retried.
    Retriable,
    /// Upstream explicitly rejected the submission.
    Fatal,
    /// Pending past the reconciliation timeout with no upstream record.
    Abandoned,
}

/// The unit of mutual exclusion for in-flight calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptSlot {
    pub registration_id: RegistrationId,
    pub attempt_type: AttemptType,
    /// Phone number for `phone_assignment`, lookup target for `status_check`.
    pub subject: Option<String>,
}

impl AttemptSlot {
    pub fn new(
        registration_id: RegistrationId,
        attempt_type: AttemptType,
        subject: Option<String>,
    ) -> Self {
        Self {
            registration_id,
            attempt_type,
            subject,
        }
    }

    pub fn brand(registration_id: RegistrationId) -> Self {
        Self::new(registration_id, AttemptType::BrandRegistration, None)
    }

    pub fn campaign(registration_id: RegistrationId) -> Self {
        Self::new(registration_id, AttemptType::CampaignRegistration, None)
    }

    pub fn phone(registration_id: RegistrationId, number: &crate::PhoneNumber) -> Self {
        Self::new(
            registration_id,
            AttemptType::PhoneAssignment,
            Some(number.to_string()),
        )
    }

    pub fn status_check(registration_id: RegistrationId, target: impl Into<String>) -> Self {
        Self::new(registration_id, AttemptType::StatusCheck, Some(target.into()))
    }
}

impl core::fmt::Display for AttemptSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.registration_id,
            self.attempt_type,
            self.subject.as_deref().unwrap_or("-")
        )
    }
}

/// Attempt identifier: slot + per-slot sequence number (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    pub slot: AttemptSlot,
    pub sequence: u32,
}

impl AttemptId {
    pub fn new(slot: AttemptSlot, sequence: u32) -> Self {
        Self { slot, sequence }
    }

    /// Storage key; zero-padded so keys sort by sequence within a slot.
    pub fn key(&self) -> String {
        format!("{}#{:06}", self.slot, self.sequence)
    }
}

impl core::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Stable idempotency token sent with every outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from the attempt id (`dt-` + first 32 hex chars of sha256).
    pub fn for_attempt(id: &AttemptId) -> Self {
        let digest = Sha256::digest(id.key().as_bytes());
        let hex = hex::encode(digest);
        Self(format!("dt-{}", &hex[..32]))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a pending attempt is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResolution {
    /// The call resolved with an outcome and a raw response snapshot.
    Outcome {
        outcome: GatewayOutcome,
        response: JsonValue,
    },
    /// Reconciliation gave up on the attempt (no upstream record past the timeout).
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceAttempt {
    pub id: AttemptId,
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub request: JsonValue,
    pub response: Option<JsonValue>,
    pub outcome: Option<GatewayOutcome>,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub error_kind: Option<AttemptErrorKind>,
    pub upstream_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

impl ComplianceAttempt {
    pub fn start(
        tenant_id: TenantId,
        id: AttemptId,
        request: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        let idempotency_key = IdempotencyKey::for_attempt(&id);
        Self {
            id,
            tenant_id,
            idempotency_key,
            request,
            response: None,
            outcome: None,
            status: AttemptStatus::Pending,
            error: None,
            error_kind: None,
            upstream_ref: None,
            created_at: now,
            completed_at: None,
            version: 0,
        }
    }

    pub fn registration_id(&self) -> RegistrationId {
        self.id.slot.registration_id
    }

    pub fn attempt_type(&self) -> AttemptType {
        self.id.slot.attempt_type
    }

    pub fn subject(&self) -> Option<&str> {
        self.id.slot.subject.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == AttemptStatus::Pending
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Finalize the attempt. Only legal once, from `pending`.
    pub fn finish(&mut self, resolution: AttemptResolution, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_pending() {
            return Err(DomainError::conflict(format!(
                "attempt {} already finalized",
                self.id
            )));
        }

        match resolution {
            AttemptResolution::Outcome { outcome, response } => {
                let lookup = self.attempt_type() == AttemptType::StatusCheck;
                match &outcome {
                    GatewayOutcome::Accepted { upstream_ref, .. } => {
                        self.status = AttemptStatus::Success;
                        self.upstream_ref = Some(upstream_ref.clone());
                    }
                    GatewayOutcome::Rejected { .. } | GatewayOutcome::NotFound if lookup => {
                        // The lookup itself succeeded; the answer is in `outcome`.
                        self.status = AttemptStatus::Success;
                    }
                    GatewayOutcome::Rejected { reason } => {
                        self.status = AttemptStatus::Error;
                        self.error = Some(reason.clone());
                        self.error_kind = Some(AttemptErrorKind::Fatal);
                    }
                    GatewayOutcome::Retriable { reason } => {
                        self.status = AttemptStatus::Error;
                        self.error = Some(reason.clone());
                        self.error_kind = Some(AttemptErrorKind::Retriable);
                    }
                    GatewayOutcome::NotFound => {
                        self.status = AttemptStatus::Error;
                        self.error = Some("upstream returned not_found for a submission".into());
                        self.error_kind = Some(AttemptErrorKind::Retriable);
                    }
                }
                self.response = Some(response);
                self.outcome = Some(outcome);
            }
            AttemptResolution::Abandoned { reason } => {
                self.status = AttemptStatus::Error;
                self.error = Some(reason);
                self.error_kind = Some(AttemptErrorKind::Abandoned);
            }
        }

        self.completed_at = Some(now);
        Ok(())
    }
}

impl AggregateRoot for ComplianceAttempt {
    type Id = AttemptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ReviewState;

    fn pending(attempt_type: AttemptType) -> ComplianceAttempt {
        let slot = AttemptSlot::new(RegistrationId::new(), attempt_type, None);
        ComplianceAttempt::start(TenantId::new(), AttemptId::new(slot, 1), JsonValue::Null, Utc::now())
    }

    #[test]
    fn idempotency_key_is_stable_per_attempt() {
        let slot = AttemptSlot::brand(RegistrationId::new());
        let a = AttemptId::new(slot.clone(), 1);
        let b = AttemptId::new(slot, 2);
        assert_eq!(IdempotencyKey::for_attempt(&a), IdempotencyKey::for_attempt(&a));
        assert_ne!(IdempotencyKey::for_attempt(&a), IdempotencyKey::for_attempt(&b));
        assert_eq!(IdempotencyKey::for_attempt(&a).as_str().len(), 35);
    }

    #[test]
    fn accepted_outcome_finalizes_success_with_ref() {
        let mut attempt = pending(AttemptType::BrandRegistration);
        attempt
            .finish(
                AttemptResolution::Outcome {
                    outcome: GatewayOutcome::accepted("BN1", ReviewState::InReview),
                    response: serde_json::json!({"reference": "BN1"}),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert_eq!(attempt.upstream_ref.as_deref(), Some("BN1"));
        assert!(attempt.completed_at.is_some());
    }

    #[test]
    fn rejection_is_fatal_for_submissions_but_success_for_lookups() {
        let mut submit = pending(AttemptType::CampaignRegistration);
        submit
            .finish(
                AttemptResolution::Outcome {
                    outcome: GatewayOutcome::rejected("bad sample"),
                    response: JsonValue::Null,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(submit.status, AttemptStatus::Error);
        assert_eq!(submit.error_kind, Some(AttemptErrorKind::Fatal));

        let mut lookup = pending(AttemptType::StatusCheck);
        lookup
            .finish(
                AttemptResolution::Outcome {
                    outcome: GatewayOutcome::rejected("bad sample"),
                    response: JsonValue::Null,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(lookup.status, AttemptStatus::Success);
    }

    #[test]
    fn finalization_happens_once() {
        let mut attempt = pending(AttemptType::PhoneAssignment);
        attempt
            .finish(
                AttemptResolution::Abandoned {
                    reason: "no upstream record".into(),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(attempt.error_kind, Some(AttemptErrorKind::Abandoned));

        let err = attempt
            .finish(
                AttemptResolution::Outcome {
                    outcome: GatewayOutcome::accepted("X", ReviewState::Approved),
                    response: JsonValue::Null,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(attempt.status, AttemptStatus::Error);
    }

    #[test]
    fn keys_sort_by_sequence() {
        let slot = AttemptSlot::brand(RegistrationId::new());
        let k9 = AttemptId::new(slot.clone(), 9).key();
        let k10 = AttemptId::new(slot, 10).key();
        assert!(k9 < k10);
    }
}
