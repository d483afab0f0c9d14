use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use campus_auth::Permission;
use campus_catalog::{
    AddLesson, ArchiveCourse, Course, CourseCommand, CourseId, CreateCourse,
};
use campus_core::AggregateId;

use crate::app::routes::common::CmdAuth;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_course).get(list_courses))
        .route("/available", get(available_courses))
        .route("/:id", get(get_course))
        .route("/:id/archive", post(archive_course))
        .route("/:id/lessons", post(add_lesson))
        .route("/:id/groups", get(list_groups))
        .route("/:id/buy", post(buy_course))
        .route("/:id/revoke", post(revoke_entitlement))
}

fn parse_course_id(id: &str) -> Result<(AggregateId, CourseId), axum::response::Response> {
    match id.parse::<AggregateId>() {
        Ok(agg) => Ok((agg, CourseId::new(agg))),
        Err(_) => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            "invalid course id",
        )),
    }
}

pub async fn create_course(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateCourseRequest>,
) -> axum::response::Response {
    let agg = AggregateId::new();
    let course_id = CourseId::new(agg);

    let cmd = CourseCommand::CreateCourse(CreateCourse {
        course_id,
        creator: principal.user_id(),
        name: body.name,
        cost: body.cost,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("catalog.course.create")],
    };
    if let Err(e) = crate::authz::authorize_command(&principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Course>(
        agg,
        "catalog.course",
        cmd_auth.inner,
        |aggregate_id| Course::empty(CourseId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn add_lesson(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddLessonRequest>,
) -> axum::response::Response {
    let (agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Lesson links are unique per course inside the aggregate; cross-course
    // uniqueness is checked against the catalog read model here.
    let link_taken = services.courses_list().iter().any(|c| {
        c.course_id != course_id && c.lessons.iter().any(|l| l.link == body.link)
    });
    if link_taken {
        return errors::json_error(
            StatusCode::CONFLICT,
            "conflict",
            "lesson link already used by another course",
        );
    }

    let cmd = CourseCommand::AddLesson(AddLesson {
        course_id,
        name: body.name,
        link: body.link,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("catalog.lesson.create")],
    };
    if let Err(e) = crate::authz::authorize_command(&principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Course>(
        agg,
        "catalog.course",
        cmd_auth.inner,
        |aggregate_id| Course::empty(CourseId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn archive_course(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = CourseCommand::ArchiveCourse(ArchiveCourse {
        course_id,
        occurred_at: Utc::now(),
    });

    let cmd_auth = CmdAuth {
        inner: cmd,
        required: vec![Permission::new("catalog.course.archive")],
    };
    if let Err(e) = crate::authz::authorize_command(&principal, &cmd_auth) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string());
    }

    let committed = match services.dispatch::<Course>(
        agg,
        "catalog.course",
        cmd_auth.inner,
        |aggregate_id| Course::empty(CourseId::new(aggregate_id)),
    ) {
        Ok(c) => c,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": agg.to_string(),
            "events_committed": committed.len(),
        })),
    )
        .into_response()
}

pub async fn list_courses(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let items = services
        .courses_list()
        .iter()
        .map(dto::course_summary_to_json)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

/// Courses the caller has not purchased (no active entitlement).
pub async fn available_courses(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let account = services.account_get(&principal.user_id());
    let items = services
        .courses_list()
        .iter()
        .filter(|c| {
            account
                .as_ref()
                .map(|a| !a.has_active_entitlement(c.course_id))
                .unwrap_or(true)
        })
        .map(dto::course_summary_to_json)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

/// Course detail embeds lessons, so it is the entitlement-guarded resource:
/// staff see everything, students only what they purchased.
pub async fn get_course(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (_agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(course) = services.course_get(&course_id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "course not found");
    };

    let is_staff = principal.has_role("admin") || principal.has_role("staff");
    let entitled = services
        .account_get(&principal.user_id())
        .map(|a| a.has_active_entitlement(course_id))
        .unwrap_or(false);

    if !is_staff && !entitled {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "purchase the course to access its lessons",
        );
    }

    (StatusCode::OK, Json(dto::course_detail_to_json(&course))).into_response()
}

pub async fn list_groups(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (_agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if !(principal.has_role("admin") || principal.has_role("staff")) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "staff only");
    }

    match services.course_groups(&course_id) {
        Some(rm) => (StatusCode::OK, Json(dto::groups_to_json(&rm))).into_response(),
        None => (
            StatusCode::OK,
            Json(serde_json::json!({
                "course_id": course_id.0.to_string(),
                "groups": [],
            })),
        )
            .into_response(),
    }
}

/// Purchase access to a course. Any authenticated user may buy.
pub async fn buy_course(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (_agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.purchase(principal.user_id(), course_id) {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(dto::purchase_receipt_to_json(&receipt)),
        )
            .into_response(),
        Err(e) => errors::purchase_error_to_response(e),
    }
}

/// Revoke a user's entitlement and release their group seat (staff only).
pub async fn revoke_entitlement(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::RevokeEntitlementRequest>,
) -> axum::response::Response {
    let (_agg, course_id) = match parse_course_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if !(principal.has_role("admin") || principal.has_role("staff")) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "staff only");
    }

    let user = match body.user_id.parse::<campus_core::UserId>() {
        Ok(u) => u,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id")
        }
    };

    match services.revoke(user, course_id) {
        Ok(receipt) => (
            StatusCode::OK,
            Json(dto::revocation_receipt_to_json(&receipt)),
        )
            .into_response(),
        Err(e) => errors::revocation_error_to_response(e),
    }
}
