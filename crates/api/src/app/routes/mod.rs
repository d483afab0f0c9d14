use axum::{routing::get, Router};

pub mod balances;
pub mod common;
pub mod courses;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/courses", courses::router())
        .nest("/balances", balances::router())
}
