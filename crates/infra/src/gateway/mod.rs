//! Client boundary to the upstream carrier-compliance API.
//!
//! Every call carries an [`IdempotencyKey`] derived from its attempt, and every
//! call resolves to a typed [`GatewayOutcome`]: transport failures are folded
//! into `Retriable` so callers never see a raw transport error.

pub mod http;
pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dialtone_compliance::{BrandForm, CampaignForm, GatewayOutcome, IdempotencyKey, PhoneNumber};
use dialtone_core::{RegistrationId, TenantId};

pub use http::{GatewayError, HttpComplianceGateway, HttpGatewayConfig};
pub use sandbox::{CallKind, SandboxGateway};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandSubmission {
    pub tenant_id: TenantId,
    pub registration_id: RegistrationId,
    #[serde(flatten)]
    pub form: BrandForm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSubmission {
    pub tenant_id: TenantId,
    pub registration_id: RegistrationId,
    pub brand_ref: String,
    #[serde(flatten)]
    pub form: CampaignForm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberAssignment {
    pub number: PhoneNumber,
    pub campaign_ref: String,
}

/// What a status check looks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum StatusQuery {
    /// A known upstream record.
    Reference(String),
    /// Whatever upstream stored under the idempotency key of an earlier call.
    IdempotencyKey(IdempotencyKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub outcome: GatewayOutcome,
    /// Raw response snapshot for the attempt log.
    pub payload: JsonValue,
}

impl GatewayResponse {
    pub fn new(outcome: GatewayOutcome, payload: JsonValue) -> Self {
        Self { outcome, payload }
    }

    /// Response for a call that never produced a body.
    pub fn retriable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let payload = serde_json::json!({ "transport_error": reason });
        Self {
            outcome: GatewayOutcome::retriable(reason),
            payload,
        }
    }
}

#[async_trait]
pub trait ComplianceGateway: Send + Sync {
    async fn register_brand(
        &self,
        submission: &BrandSubmission,
        key: &IdempotencyKey,
    ) -> GatewayResponse;

    async fn register_campaign(
        &self,
        submission: &CampaignSubmission,
        key: &IdempotencyKey,
    ) -> GatewayResponse;

    async fn assign_number(
        &self,
        number: &PhoneNumber,
        campaign_ref: &str,
        key: &IdempotencyKey,
    ) -> GatewayResponse;

    /// Look up an upstream record. `NotFound` means upstream has none.
    async fn check_status(&self, query: &StatusQuery, key: &IdempotencyKey) -> GatewayResponse;
}
