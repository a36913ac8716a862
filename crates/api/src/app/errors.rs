use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use dialtone_core::RegistrationId;
use dialtone_infra::ComplianceError;

pub fn compliance_error_to_response(err: ComplianceError) -> Response {
    match err {
        ComplianceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        ComplianceError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        err @ ComplianceError::ReconciliationRequired { .. } => {
            json_error(StatusCode::CONFLICT, "reconciliation_required", err.to_string())
        }
        err @ ComplianceError::RetriableGateway { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable", err.to_string())
        }
        err @ ComplianceError::FatalGateway { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "upstream_rejected", err.to_string())
        }
        ComplianceError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        ComplianceError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        ComplianceError::TenantIsolation(msg) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", msg)
        }
        ComplianceError::Store(e) => {
            tracing::error!(error = %e, "document store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        ComplianceError::AttemptLog(msg) => {
            tracing::error!(error = %msg, "attempt log failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "attempt_log_error", msg)
        }
        ComplianceError::Serialization(e) => {
            tracing::error!(error = %e, "request snapshot encoding failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", e.to_string())
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn forbidden(message: impl Into<String>) -> Response {
    json_error(StatusCode::FORBIDDEN, "forbidden", message)
}

pub fn parse_registration_id(raw: &str) -> Result<RegistrationId, Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid registration id"))
}
