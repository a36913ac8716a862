use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};

use dialtone_compliance::{BrandForm, CampaignForm, ComplianceAttestations};

use crate::app::errors::{compliance_error_to_response, parse_registration_id};
use crate::app::dto;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_registration).get(list_registrations))
        .route("/:id", get(get_registration))
        .route("/:id/brand", put(save_brand_form))
        .route("/:id/campaign", put(save_campaign_form))
        .route("/:id/phone-numbers", put(select_phone_numbers))
        .route("/:id/phone-numbers/:number", delete(remove_phone_number))
        .route("/:id/attestations", put(save_attestations))
        .route("/:id/advance", post(advance))
        .route("/:id/abandon", post(abandon))
        .route("/:id/resubmit", post(resubmit))
        .route("/:id/status", get(get_status))
}

pub async fn create_registration(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Result<Response, Response> {
    let registration = services
        .orchestrator
        .create_registration(tenant.tenant_id(), principal.user_id())
        .await
        .map_err(compliance_error_to_response)?;
    Ok((StatusCode::CREATED, Json(registration)).into_response())
}

pub async fn list_registrations(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Response, Response> {
    let registrations = services
        .orchestrator
        .list_registrations(tenant.tenant_id())
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(dto::RegistrationList { registrations }).into_response())
}

pub async fn get_registration(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .get_registration(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

pub async fn save_brand_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(form): Json<BrandForm>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .save_brand_form(tenant.tenant_id(), id, form)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

pub async fn save_campaign_form(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(form): Json<CampaignForm>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .save_campaign_form(tenant.tenant_id(), id, form)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

/// Replaces the selection. Per-number problems come back in `rejected`, not as an error.
pub async fn select_phone_numbers(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::SelectPhoneNumbersRequest>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let report = services
        .orchestrator
        .select_phone_numbers(tenant.tenant_id(), id, body.phone_numbers)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(report).into_response())
}

pub async fn remove_phone_number(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path((id, number)): Path<(String, String)>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .remove_phone_number(tenant.tenant_id(), id, &number)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

pub async fn save_attestations(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(attestations): Json<ComplianceAttestations>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .save_attestations(tenant.tenant_id(), id, principal.user_id(), attestations)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

pub async fn advance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let report = services
        .orchestrator
        .advance(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(report).into_response())
}

pub async fn abandon(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let registration = services
        .orchestrator
        .abandon(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(registration).into_response())
}

pub async fn resubmit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let successor = services
        .orchestrator
        .resubmit(tenant.tenant_id(), id, principal.user_id())
        .await
        .map_err(compliance_error_to_response)?;
    Ok((StatusCode::CREATED, Json(successor)).into_response())
}

pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    let id = parse_registration_id(&id)?;
    let view = services
        .orchestrator
        .get_registration_status(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(view).into_response())
}
