//! Typed results of calls to the upstream compliance API.

use serde::{Deserialize, Serialize};

/// Review state reported alongside an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// Upstream only acknowledged receipt; the decision arrives later.
    InReview,
    /// Upstream confirmed the submission synchronously.
    Approved,
}

/// Outcome of one gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// Upstream holds a record for the submission.
    Accepted {
        upstream_ref: String,
        review: ReviewState,
    },
    /// Upstream explicitly refused the submission (fatal, never retried).
    Rejected { reason: String },
    /// Transport, timeout or 5xx-class failure; safe to retry.
    Retriable { reason: String },
    /// Status lookups only: upstream has no record for the query.
    NotFound,
}

impl GatewayOutcome {
    pub fn accepted(upstream_ref: impl Into<String>, review: ReviewState) -> Self {
        Self::Accepted {
            upstream_ref: upstream_ref.into(),
            review,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn retriable(reason: impl Into<String>) -> Self {
        Self::Retriable {
            reason: reason.into(),
        }
    }

    pub fn upstream_ref(&self) -> Option<&str> {
        match self {
            GatewayOutcome::Accepted { upstream_ref, .. } => Some(upstream_ref),
            _ => None,
        }
    }

    /// True when upstream has a definitive record (accepted or rejected).
    pub fn is_upstream_record(&self) -> bool {
        matches!(
            self,
            GatewayOutcome::Accepted { .. } | GatewayOutcome::Rejected { .. }
        )
    }
}

/// Terminal or intermediate status pushed by upstream (webhook) or read by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    InReview,
    Approved,
    Rejected,
}

/// Webhook callback body `{ upstream_ref, status, reason? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStatusUpdate {
    pub upstream_ref: String,
    pub status: UpstreamStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl UpstreamStatusUpdate {
    /// Read a status-check outcome as a status update for `upstream_ref`.
    ///
    /// Returns `None` when the outcome carries no decision (retriable, not found).
    pub fn from_outcome(upstream_ref: &str, outcome: &GatewayOutcome) -> Option<Self> {
        let (status, reason) = match outcome {
            GatewayOutcome::Accepted {
                review: ReviewState::Approved,
                ..
            } => (UpstreamStatus::Approved, None),
            GatewayOutcome::Accepted {
                review: ReviewState::InReview,
                ..
            } => (UpstreamStatus::InReview, None),
            GatewayOutcome::Rejected { reason } => (UpstreamStatus::Rejected, Some(reason.clone())),
            GatewayOutcome::Retriable { .. } | GatewayOutcome::NotFound => return None,
        };
        Some(Self {
            upstream_ref: upstream_ref.to_string(),
            status,
            reason,
        })
    }
}
