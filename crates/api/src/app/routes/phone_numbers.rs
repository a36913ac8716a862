use std::sync::Arc;

use axum::{
    extract::Extension,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::app::dto;
use crate::app::errors::compliance_error_to_response;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/available", get(list_available))
}

/// Owned numbers that no active registration currently holds.
pub async fn list_available(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Result<Response, Response> {
    let phone_numbers = services
        .orchestrator
        .list_available_numbers(tenant.tenant_id())
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(dto::AvailableNumbers { phone_numbers }).into_response())
}
