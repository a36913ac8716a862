//! Read-side projection returned to the wizard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dialtone_core::RegistrationId;

use crate::attempt::{AttemptErrorKind, AttemptStatus, AttemptType, ComplianceAttempt};
use crate::binding::NumberBindingStatus;
use crate::brand::BrandStatus;
use crate::campaign::CampaignStatus;
use crate::phone::PhoneNumber;
use crate::registration::RegistrationStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberStatusView {
    pub number: PhoneNumber,
    pub status: NumberBindingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub attempt_type: AttemptType,
    pub message: String,
    pub kind: Option<AttemptErrorKind>,
    pub at: DateTime<Utc>,
}

impl LastError {
    /// Most recent error among the latest attempt of each slot.
    ///
    /// A slot whose latest attempt succeeded contributes nothing, so an error
    /// that was later retried successfully disappears from the view.
    pub fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a ComplianceAttempt>) -> Option<Self> {
        let mut latest: std::collections::HashMap<String, &ComplianceAttempt> =
            std::collections::HashMap::new();
        for attempt in attempts {
            let slot = attempt.id.slot.to_string();
            match latest.get(&slot) {
                Some(existing) if existing.id.sequence >= attempt.id.sequence => {}
                _ => {
                    latest.insert(slot, attempt);
                }
            }
        }

        latest
            .into_values()
            .filter(|a| a.status == AttemptStatus::Error)
            .max_by_key(|a| a.completed_at.unwrap_or(a.created_at))
            .map(|a| LastError {
                attempt_type: a.attempt_type(),
                message: a.error.clone().unwrap_or_default(),
                kind: a.error_kind,
                at: a.completed_at.unwrap_or(a.created_at),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatusView {
    pub registration_id: RegistrationId,
    pub status: RegistrationStatus,
    pub current_step: u8,
    pub brand_status: Option<BrandStatus>,
    pub campaign_status: Option<CampaignStatus>,
    pub per_number_status: Vec<NumberStatusView>,
    pub last_error: Option<LastError>,
    pub abandoned: bool,
    pub superseded_by: Option<RegistrationId>,
}
