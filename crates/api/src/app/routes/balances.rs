use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use campus_billing::DEFAULT_OPENING_BALANCE;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_balances))
        .route("/me", get(my_balance))
}

/// All account balances (staff only).
pub async fn list_balances(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if !(principal.has_role("admin") || principal.has_role("staff")) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "staff only");
    }

    let items = services
        .accounts_list()
        .iter()
        .map(dto::account_to_json)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

/// The caller's balance and entitlements.
///
/// An account that never transacted reports the default opening balance.
pub async fn my_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let body = match services.account_get(&principal.user_id()) {
        Some(rm) => dto::account_to_json(&rm),
        None => serde_json::json!({
            "user_id": principal.user_id().to_string(),
            "balance": DEFAULT_OPENING_BALANCE,
            "entitlements": [],
        }),
    };

    (StatusCode::OK, Json(body)).into_response()
}
