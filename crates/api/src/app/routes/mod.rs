use axum::{routing::get, Router};

pub mod ops;
pub mod phone_numbers;
pub mod registrations;
pub mod system;
pub mod webhooks;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/registrations", registrations::router())
        .nest("/phone-numbers", phone_numbers::router())
        .nest("/ops", ops::router())
}
