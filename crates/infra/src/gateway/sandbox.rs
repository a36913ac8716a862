//! In-process stand-in for the upstream compliance API.
//!
//! Keeps upstream's idempotency contract: a repeated call with the same key
//! returns the record created by the first call instead of creating another.
//! Tests script outcomes per call kind and read back how many submissions
//! actually reached "upstream".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use dialtone_compliance::{GatewayOutcome, IdempotencyKey, PhoneNumber, ReviewState};

use super::{BrandSubmission, CampaignSubmission, ComplianceGateway, GatewayResponse, StatusQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Brand,
    Campaign,
    Number,
    Status,
}

impl CallKind {
    fn prefix(self) -> &'static str {
        match self {
            CallKind::Brand => "BN",
            CallKind::Campaign => "CM",
            CallKind::Number => "PN",
            CallKind::Status => "ST",
        }
    }
}

#[derive(Debug, Clone)]
struct SandboxRecord {
    kind: CallKind,
    reference: Option<String>,
    review: ReviewState,
    rejection: Option<String>,
}

impl SandboxRecord {
    fn outcome(&self) -> GatewayOutcome {
        match (&self.rejection, &self.reference) {
            (Some(reason), _) => GatewayOutcome::rejected(reason.clone()),
            (None, Some(reference)) => GatewayOutcome::accepted(reference.clone(), self.review),
            (None, None) => GatewayOutcome::NotFound,
        }
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    /// Upstream records by the idempotency key that created them.
    records: HashMap<String, SandboxRecord>,
    scripted: HashMap<CallKind, VecDeque<GatewayOutcome>>,
    calls: HashMap<CallKind, u32>,
    submissions: HashMap<CallKind, u32>,
    next_ref: u64,
    auto_approve: bool,
}

#[derive(Debug, Default)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept brands and campaigns as approved instead of in review.
    pub fn auto_approving() -> Self {
        let gateway = Self::default();
        if let Ok(mut state) = gateway.state.lock() {
            state.auto_approve = true;
        }
        gateway
    }

    /// Queue outcomes for the next calls of `kind`, in order.
    pub fn script(&self, kind: CallKind, outcomes: impl IntoIterator<Item = GatewayOutcome>) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted.entry(kind).or_default().extend(outcomes);
        }
    }

    /// Calls received for `kind`, including replays and scripted failures.
    pub fn calls(&self, kind: CallKind) -> u32 {
        self.state
            .lock()
            .map(|s| s.calls.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Distinct upstream records created for `kind`.
    pub fn submissions(&self, kind: CallKind) -> u32 {
        self.state
            .lock()
            .map(|s| s.submissions.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Simulate the upstream review decision for `reference`.
    pub fn decide(&self, reference: &str, decision: Result<ReviewState, String>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(record) = state
            .records
            .values_mut()
            .find(|r| r.reference.as_deref() == Some(reference))
        else {
            return false;
        };
        match decision {
            Ok(review) => {
                record.review = review;
                record.rejection = None;
            }
            Err(reason) => record.rejection = Some(reason),
        }
        true
    }

    fn submit(&self, kind: CallKind, key: &IdempotencyKey, request: serde_json::Value) -> GatewayResponse {
        let Ok(mut state) = self.state.lock() else {
            return GatewayResponse::retriable("sandbox state poisoned");
        };
        *state.calls.entry(kind).or_default() += 1;

        if let Some(record) = state.records.get(key.as_str()) {
            let outcome = record.outcome();
            return GatewayResponse::new(outcome, json!({ "replayed": true, "reference": record.reference }));
        }

        let scripted = state.scripted.get_mut(&kind).and_then(VecDeque::pop_front);
        let record = match scripted {
            // Retriable outcomes never reach upstream storage.
            Some(outcome @ GatewayOutcome::Retriable { .. }) | Some(outcome @ GatewayOutcome::NotFound) => {
                return GatewayResponse::new(outcome, json!({ "error": "sandbox scripted failure" }));
            }
            Some(GatewayOutcome::Rejected { reason }) => SandboxRecord {
                kind,
                reference: None,
                review: ReviewState::InReview,
                rejection: Some(reason),
            },
            Some(GatewayOutcome::Accepted { upstream_ref, review }) => SandboxRecord {
                kind,
                reference: Some(upstream_ref),
                review,
                rejection: None,
            },
            None => {
                state.next_ref += 1;
                let review = if kind == CallKind::Number || state.auto_approve {
                    ReviewState::Approved
                } else {
                    ReviewState::InReview
                };
                SandboxRecord {
                    kind,
                    reference: Some(format!("{}{:06}", kind.prefix(), state.next_ref)),
                    review,
                    rejection: None,
                }
            }
        };

        *state.submissions.entry(kind).or_default() += 1;
        let outcome = record.outcome();
        state.records.insert(key.as_str().to_string(), record);
        GatewayResponse::new(outcome, json!({ "request": request, "kind": format!("{kind:?}") }))
    }

    fn lookup(&self, query: &StatusQuery) -> GatewayResponse {
        let Ok(mut state) = self.state.lock() else {
            return GatewayResponse::retriable("sandbox state poisoned");
        };
        *state.calls.entry(CallKind::Status).or_default() += 1;

        if let Some(outcome) = state
            .scripted
            .get_mut(&CallKind::Status)
            .and_then(VecDeque::pop_front)
        {
            return GatewayResponse::new(outcome, json!({ "scripted": true }));
        }

        let record = match query {
            StatusQuery::IdempotencyKey(key) => state.records.get(key.as_str()),
            StatusQuery::Reference(reference) => state
                .records
                .values()
                .find(|r| r.reference.as_deref() == Some(reference.as_str())),
        };
        match record {
            Some(record) => GatewayResponse::new(
                record.outcome(),
                json!({ "reference": record.reference, "kind": format!("{:?}", record.kind) }),
            ),
            None => GatewayResponse::new(GatewayOutcome::NotFound, json!({ "found": false })),
        }
    }
}

#[async_trait]
impl ComplianceGateway for SandboxGateway {
    async fn register_brand(&self, submission: &BrandSubmission, key: &IdempotencyKey) -> GatewayResponse {
        tokio::task::yield_now().await;
        let request = serde_json::to_value(submission).unwrap_or_default();
        self.submit(CallKind::Brand, key, request)
    }

    async fn register_campaign(
        &self,
        submission: &CampaignSubmission,
        key: &IdempotencyKey,
    ) -> GatewayResponse {
        tokio::task::yield_now().await;
        let request = serde_json::to_value(submission).unwrap_or_default();
        self.submit(CallKind::Campaign, key, request)
    }

    async fn assign_number(
        &self,
        number: &PhoneNumber,
        campaign_ref: &str,
        key: &IdempotencyKey,
    ) -> GatewayResponse {
        tokio::task::yield_now().await;
        self.submit(
            CallKind::Number,
            key,
            json!({ "number": number, "campaign_ref": campaign_ref }),
        )
    }

    async fn check_status(&self, query: &StatusQuery, _key: &IdempotencyKey) -> GatewayResponse {
        tokio::task::yield_now().await;
        self.lookup(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialtone_compliance::{AttemptId, AttemptSlot};
    use dialtone_core::RegistrationId;

    fn key(seq: u32) -> IdempotencyKey {
        IdempotencyKey::for_attempt(&AttemptId::new(AttemptSlot::brand(RegistrationId::new()), seq))
    }

    #[tokio::test]
    async fn same_key_replays_record() {
        let sandbox = SandboxGateway::new();
        let k = key(1);
        let first = sandbox.assign_number(&PhoneNumber::parse("+15550001111").unwrap(), "CM1", &k).await;
        let again = sandbox.assign_number(&PhoneNumber::parse("+15550001111").unwrap(), "CM1", &k).await;
        assert_eq!(first.outcome, again.outcome);
        assert_eq!(sandbox.submissions(CallKind::Number), 1);
        assert_eq!(sandbox.calls(CallKind::Number), 2);
    }

    #[tokio::test]
    async fn scripted_failures_leave_no_record() {
        let sandbox = SandboxGateway::new();
        sandbox.script(CallKind::Number, [GatewayOutcome::retriable("503")]);
        let k = key(1);
        let n = PhoneNumber::parse("+15550001111").unwrap();
        let first = sandbox.assign_number(&n, "CM1", &k).await;
        assert!(matches!(first.outcome, GatewayOutcome::Retriable { .. }));

        let lookup = sandbox.check_status(&StatusQuery::IdempotencyKey(k.clone()), &key(2)).await;
        assert_eq!(lookup.outcome, GatewayOutcome::NotFound);
    }

    #[tokio::test]
    async fn decisions_are_visible_to_reference_lookups() {
        let sandbox = SandboxGateway::new();
        let n = PhoneNumber::parse("+15550001111").unwrap();
        let resp = sandbox.assign_number(&n, "CM1", &key(1)).await;
        let reference = resp.outcome.upstream_ref().unwrap().to_string();

        assert!(sandbox.decide(&reference, Err("carrier refused".into())));
        let status = sandbox
            .check_status(&StatusQuery::Reference(reference), &key(2))
            .await;
        assert_eq!(status.outcome, GatewayOutcome::rejected("carrier refused"));
    }
}
