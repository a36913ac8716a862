//! reqwest-backed client for the upstream compliance API.
//!
//! | Call | Request |
//! |------|---------|
//! | register brand | `POST /v1/brands` |
//! | register campaign | `POST /v1/campaigns` |
//! | assign number | `POST /v1/campaigns/{ref}/numbers` |
//! | status by reference | `GET /v1/submissions/{ref}` |
//! | status by idempotency key | `GET /v1/submissions?idempotency_key={key}` |
//!
//! Success bodies look like `{"reference": "...", "status": "approved" | "in_review" | "rejected", "reason": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value as JsonValue;
use thiserror::Error;

use dialtone_compliance::{GatewayOutcome, IdempotencyKey, PhoneNumber, ReviewState};

use super::{
    BrandSubmission, CampaignSubmission, ComplianceGateway, GatewayResponse, NumberAssignment,
    StatusQuery,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid gateway config: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HttpComplianceGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpComplianceGateway {
    pub fn new(config: &HttpGatewayConfig) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| GatewayError::Config(format!("api key is not a valid header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, key: &IdempotencyKey, lookup: bool) -> GatewayResponse {
        let request = request.header(IDEMPOTENCY_HEADER, key.as_str());
        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(error = %err, idempotency_key = %key, "compliance gateway transport error");
                return GatewayResponse::retriable(format!("transport error: {err}"));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(text) if text.is_empty() => JsonValue::Null,
            Ok(text) => serde_json::from_str(&text).unwrap_or(JsonValue::String(text)),
            Err(err) => {
                return GatewayResponse::retriable(format!("failed to read response body: {err}"));
            }
        };

        let outcome = classify(status, &body, lookup);
        tracing::debug!(
            http_status = status.as_u16(),
            outcome = ?outcome,
            idempotency_key = %key,
            "compliance gateway response"
        );
        GatewayResponse::new(
            outcome,
            serde_json::json!({ "http_status": status.as_u16(), "body": body }),
        )
    }
}

/// Map an HTTP response to an outcome.
///
/// `lookup` is set for status checks, where 404 means "no record" rather than rejection.
pub(crate) fn classify(status: StatusCode, body: &JsonValue, lookup: bool) -> GatewayOutcome {
    if status.is_success() {
        return parse_record(body);
    }
    if lookup && status == StatusCode::NOT_FOUND {
        return GatewayOutcome::NotFound;
    }

    let reason = body
        .get("reason")
        .or_else(|| body.get("message"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("upstream returned HTTP {}", status.as_u16()));

    match status.as_u16() {
        408 | 409 | 425 | 429 => GatewayOutcome::retriable(reason),
        s if s >= 500 => GatewayOutcome::retriable(reason),
        _ => GatewayOutcome::rejected(reason),
    }
}

fn parse_record(body: &JsonValue) -> GatewayOutcome {
    let status = body.get("status").and_then(JsonValue::as_str).unwrap_or("in_review");
    if status == "rejected" {
        let reason = body
            .get("reason")
            .and_then(JsonValue::as_str)
            .unwrap_or("rejected upstream");
        return GatewayOutcome::rejected(reason);
    }

    let Some(reference) = body.get("reference").and_then(JsonValue::as_str) else {
        return GatewayOutcome::retriable("success response without a reference");
    };
    let review = if status == "approved" {
        ReviewState::Approved
    } else {
        ReviewState::InReview
    };
    GatewayOutcome::accepted(reference, review)
}

#[async_trait]
impl ComplianceGateway for HttpComplianceGateway {
    async fn register_brand(&self, submission: &BrandSubmission, key: &IdempotencyKey) -> GatewayResponse {
        let request = self.client.post(self.url("/v1/brands")).json(submission);
        self.send(request, key, false).await
    }

    async fn register_campaign(
        &self,
        submission: &CampaignSubmission,
        key: &IdempotencyKey,
    ) -> GatewayResponse {
        let request = self.client.post(self.url("/v1/campaigns")).json(submission);
        self.send(request, key, false).await
    }

    async fn assign_number(
        &self,
        number: &PhoneNumber,
        campaign_ref: &str,
        key: &IdempotencyKey,
    ) -> GatewayResponse {
        let body = NumberAssignment {
            number: number.clone(),
            campaign_ref: campaign_ref.to_string(),
        };
        let request = self
            .client
            .post(self.url(&format!("/v1/campaigns/{campaign_ref}/numbers")))
            .json(&body);
        self.send(request, key, false).await
    }

    async fn check_status(&self, query: &StatusQuery, key: &IdempotencyKey) -> GatewayResponse {
        let request = match query {
            StatusQuery::Reference(reference) => {
                self.client.get(self.url(&format!("/v1/submissions/{reference}")))
            }
            StatusQuery::IdempotencyKey(target) => self
                .client
                .get(self.url("/v1/submissions"))
                .query(&[("idempotency_key", target.as_str())]),
        };
        self.send(request, key, true).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, Method, Uri};
    use dialtone_compliance::{AttemptId, AttemptSlot, BrandForm, CampaignForm};
    use dialtone_core::{RegistrationId, TenantId};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone)]
    struct Seen {
        method: Method,
        path: String,
        query: Option<String>,
        idempotency_key: Option<String>,
        authorization: Option<String>,
        body: String,
    }

    type Recorded = Arc<Mutex<Vec<Seen>>>;

    async fn record(
        State(recorded): State<Recorded>,
        method: Method,
        uri: Uri,
        headers: AxumHeaders,
        body: String,
    ) -> axum::Json<JsonValue> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        recorded.lock().unwrap().push(Seen {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            idempotency_key: header("idempotency-key"),
            authorization: header("authorization"),
            body,
        });
        axum::Json(json!({"reference": "CM-77", "status": "in_review"}))
    }

    async fn upstream() -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new().fallback(record).with_state(recorded.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), recorded)
    }

    fn gateway(base_url: String) -> HttpComplianceGateway {
        HttpComplianceGateway::new(&HttpGatewayConfig {
            base_url,
            api_key: "secret-key".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn key(n: u32) -> IdempotencyKey {
        IdempotencyKey::for_attempt(&AttemptId::new(AttemptSlot::brand(RegistrationId::new()), n))
    }

    #[tokio::test]
    async fn every_call_carries_the_idempotency_key_and_bearer() {
        let (base_url, recorded) = upstream().await;
        let gateway = gateway(base_url);
        let (tenant_id, registration_id) = (TenantId::new(), RegistrationId::new());
        let keys = [key(1), key(2), key(3), key(4)];

        let brand = BrandSubmission {
            tenant_id,
            registration_id,
            form: BrandForm {
                company_name: "Acme Voice LLC".into(),
                ..Default::default()
            },
        };
        let campaign = CampaignSubmission {
            tenant_id,
            registration_id,
            brand_ref: "BN-1".into(),
            form: CampaignForm::default(),
        };
        let number = PhoneNumber::parse("+15551234567").unwrap();
        let looked_up = key(9);

        let responses = [
            gateway.register_brand(&brand, &keys[0]).await,
            gateway.register_campaign(&campaign, &keys[1]).await,
            gateway.assign_number(&number, "CM-77", &keys[2]).await,
            gateway
                .check_status(&StatusQuery::IdempotencyKey(looked_up.clone()), &keys[3])
                .await,
        ];
        for response in &responses {
            assert_eq!(response.outcome, GatewayOutcome::accepted("CM-77", ReviewState::InReview));
            assert_eq!(response.payload["http_status"], 200);
        }

        let seen = recorded.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        let routes: Vec<(Method, &str)> = seen.iter().map(|s| (s.method.clone(), s.path.as_str())).collect();
        assert_eq!(
            routes,
            vec![
                (Method::POST, "/v1/brands"),
                (Method::POST, "/v1/campaigns"),
                (Method::POST, "/v1/campaigns/CM-77/numbers"),
                (Method::GET, "/v1/submissions"),
            ]
        );
        for (request, key) in seen.iter().zip(&keys) {
            assert_eq!(request.idempotency_key.as_deref(), Some(key.as_str()));
            assert_eq!(request.authorization.as_deref(), Some("Bearer secret-key"));
        }
        assert!(seen[0].body.contains("Acme Voice LLC"), "{}", seen[0].body);
        assert!(seen[2].body.contains("+15551234567"), "{}", seen[2].body);
        assert_eq!(
            seen[3].query.as_deref(),
            Some(format!("idempotency_key={}", looked_up.as_str()).as_str())
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_retriable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let response = gateway(format!("http://{addr}"))
            .check_status(&StatusQuery::Reference("CM-1".into()), &key(1))
            .await;
        assert!(
            matches!(&response.outcome, GatewayOutcome::Retriable { reason } if reason.contains("transport")),
            "{:?}",
            response.outcome
        );
    }

    #[test]
    fn success_bodies_map_to_records() {
        let approved = classify(StatusCode::OK, &json!({"reference": "BN1", "status": "approved"}), false);
        assert_eq!(approved, GatewayOutcome::accepted("BN1", ReviewState::Approved));

        let pending = classify(StatusCode::CREATED, &json!({"reference": "CM1", "status": "pending"}), false);
        assert_eq!(pending, GatewayOutcome::accepted("CM1", ReviewState::InReview));

        let rejected = classify(StatusCode::OK, &json!({"status": "rejected", "reason": "vetting"}), true);
        assert_eq!(rejected, GatewayOutcome::rejected("vetting"));

        let malformed = classify(StatusCode::OK, &json!({}), false);
        assert!(matches!(malformed, GatewayOutcome::Retriable { .. }));
    }

    #[test]
    fn error_statuses_split_into_retriable_and_fatal() {
        for code in [408, 409, 425, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                matches!(classify(status, &JsonValue::Null, false), GatewayOutcome::Retriable { .. }),
                "{code} should be retriable"
            );
        }
        for code in [400, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                matches!(classify(status, &JsonValue::Null, false), GatewayOutcome::Rejected { .. }),
                "{code} should be fatal"
            );
        }
    }

    #[test]
    fn lookup_404_is_not_found() {
        assert_eq!(
            classify(StatusCode::NOT_FOUND, &JsonValue::Null, true),
            GatewayOutcome::NotFound
        );
        let rejected = classify(StatusCode::UNPROCESSABLE_ENTITY, &json!({"reason": "bad ein"}), false);
        assert_eq!(rejected, GatewayOutcome::rejected("bad ein"));
    }

    #[test]
    fn builds_with_bearer_key() {
        let gateway = HttpComplianceGateway::new(&HttpGatewayConfig {
            base_url: "https://compliance.example/".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(gateway.url("/v1/brands"), "https://compliance.example/v1/brands");
    }
}
