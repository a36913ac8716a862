//! Upstream status callbacks.
//!
//! Signed with `X-Compliance-Signature: hex(hmac_sha256(secret, body))`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use dialtone_compliance::UpstreamStatusUpdate;

use crate::app::errors::{compliance_error_to_response, json_error};
use crate::app::services::AppServices;

pub const SIGNATURE_HEADER: &str = "x-compliance-signature";

type HmacSha256 = Hmac<Sha256>;

pub async fn compliance_status(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing webhook signature"))?;
    if !verify_signature(&body, signature, &services.webhook_secret) {
        tracing::warn!("rejected compliance webhook with a bad signature");
        return Err(json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid webhook signature"));
    }

    let update: UpstreamStatusUpdate = serde_json::from_slice(&body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()))?;

    let registration = services
        .orchestrator
        .apply_upstream_status(&update)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(serde_json::json!({
        "registration_id": registration.id,
        "status": registration.status,
    }))
    .into_response())
}

pub fn sign(body: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // constant time
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_and_binds_the_body() {
        let body = br#"{"upstream_ref":"cmp_1","status":"approved"}"#;
        let signature = sign(body, "secret").unwrap();

        assert!(verify_signature(body, &signature, "secret"));
        assert!(!verify_signature(body, &signature, "other"));
        assert!(!verify_signature(b"{}", &signature, "secret"));
        assert!(!verify_signature(body, "not-hex", "secret"));
    }
}
