//! Operator endpoints. Require the `operator` or `admin` role.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::app::dto;
use crate::app::errors::{compliance_error_to_response, forbidden, parse_registration_id};
use crate::app::services::AppServices;
use crate::context::{OPERATOR_ROLES, PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/registrations/:id/attempts", get(list_attempts))
        .route("/registrations/:id/reconcile", post(force_reconcile))
}

fn require_operator(principal: &PrincipalContext) -> Result<(), Response> {
    if principal.has_any_role(OPERATOR_ROLES) {
        Ok(())
    } else {
        Err(forbidden("operator or admin role required"))
    }
}

pub async fn list_attempts(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    require_operator(&principal)?;
    let id = parse_registration_id(&id)?;
    let attempts = services
        .orchestrator
        .list_attempts(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(dto::AttemptList { attempts }).into_response())
}

pub async fn force_reconcile(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    require_operator(&principal)?;
    let id = parse_registration_id(&id)?;
    tracing::info!(registration_id = %id, user_id = %principal.user_id(), "operator forced reconciliation");
    let report = services
        .orchestrator
        .force_reconcile(tenant.tenant_id(), id)
        .await
        .map_err(compliance_error_to_response)?;
    Ok(Json(report).into_response())
}
