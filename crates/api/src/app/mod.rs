//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, gateway and orchestrator wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::{get, post}, Extension, Router};
use tower::ServiceBuilder;

use crate::auth::Hs256JwtValidator;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, StartupError, build_services};

/// Build the full HTTP router (public entrypoint used by `main.rs` and the black-box tests).
pub fn build_app(jwt_secret: &str, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(Hs256JwtValidator::new(jwt_secret.as_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // The webhook authenticates by body signature instead of a bearer token.
    let webhooks = Router::new()
        .route("/webhooks/compliance", post(routes::webhooks::compliance_status))
        .layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(webhooks)
        .merge(protected)
        .layer(ServiceBuilder::new())
}
