use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use campus_infra::command_dispatcher::DispatchError;
use campus_infra::enrollment::{PurchaseError, RevocationError};

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DispatchError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DispatchError::Unauthorized => json_error(StatusCode::FORBIDDEN, "unauthorized", "unauthorized"),
        DispatchError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DispatchError::Deserialize(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "deserialize_error", msg)
        }
        DispatchError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            format!("{e:?}"),
        ),
        DispatchError::Publish(msg) => json_error(StatusCode::BAD_GATEWAY, "publish_error", msg),
    }
}

/// Purchase failures: 404 for a missing course, 400 with a human-readable
/// reason for business rejections.
pub fn purchase_error_to_response(err: PurchaseError) -> axum::response::Response {
    match err {
        PurchaseError::CourseNotFound => {
            json_error(StatusCode::NOT_FOUND, "not_found", "course not found")
        }
        PurchaseError::AlreadyPurchased => json_error(
            StatusCode::BAD_REQUEST,
            "already_purchased",
            "you have already purchased this course",
        ),
        PurchaseError::InsufficientFunds { balance, cost } => json_error(
            StatusCode::BAD_REQUEST,
            "insufficient_funds",
            format!("insufficient funds: balance {balance}, cost {cost}"),
        ),
        PurchaseError::Conflict => json_error(
            StatusCode::CONFLICT,
            "conflict",
            "purchase conflicted with concurrent requests, please retry",
        ),
        PurchaseError::Assignment(msg) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "enrollment_failed",
            format!("group assignment failed and the purchase was reversed: {msg}"),
        ),
        PurchaseError::Store(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn revocation_error_to_response(err: RevocationError) -> axum::response::Response {
    match err {
        RevocationError::EntitlementNotFound => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "no active entitlement for this course",
        ),
        RevocationError::Conflict => json_error(
            StatusCode::CONFLICT,
            "conflict",
            "revocation conflicted with concurrent requests, please retry",
        ),
        RevocationError::Store(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
