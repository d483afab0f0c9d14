use serde::Deserialize;

use campus_infra::enrollment::{PurchaseReceipt, RevocationReceipt};
use campus_infra::projections::{AccountReadModel, CourseGroupsReadModel, CourseReadModel};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateCourseRequest {
    pub name: String,
    pub cost: u64,
}

#[derive(Debug, Deserialize)]
pub struct AddLessonRequest {
    pub name: String,
    pub link: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeEntitlementRequest {
    pub user_id: String,
}

// -------------------------
// JSON mapping helpers
// -------------------------

/// Catalog listing entry: no lessons, those are entitlement-guarded.
pub fn course_summary_to_json(rm: &CourseReadModel) -> serde_json::Value {
    serde_json::json!({
        "id": rm.course_id.0.to_string(),
        "creator": rm.creator.to_string(),
        "name": rm.name,
        "cost": rm.cost,
        "started_at": rm.started_at.to_rfc3339(),
        "lesson_count": rm.lessons.len(),
    })
}

pub fn course_detail_to_json(rm: &CourseReadModel) -> serde_json::Value {
    serde_json::json!({
        "id": rm.course_id.0.to_string(),
        "creator": rm.creator.to_string(),
        "name": rm.name,
        "cost": rm.cost,
        "started_at": rm.started_at.to_rfc3339(),
        "lessons": rm.lessons.iter().map(|l| serde_json::json!({
            "lesson_no": l.lesson_no,
            "name": l.name,
            "link": l.link,
        })).collect::<Vec<_>>(),
    })
}

pub fn account_to_json(rm: &AccountReadModel) -> serde_json::Value {
    serde_json::json!({
        "user_id": rm.user.to_string(),
        "balance": rm.balance,
        "entitlements": rm.entitlements.iter().map(|e| serde_json::json!({
            "course_id": e.course_id.0.to_string(),
            "cost": e.cost,
            "purchased_at": e.purchased_at.to_rfc3339(),
            "valid": e.valid,
        })).collect::<Vec<_>>(),
    })
}

pub fn groups_to_json(rm: &CourseGroupsReadModel) -> serde_json::Value {
    serde_json::json!({
        "course_id": rm.course_id.0.to_string(),
        "groups": rm.groups.iter().map(|g| serde_json::json!({
            "group_no": g.group_no,
            "title": g.title,
            "student_count": g.student_count,
            "members": g.members.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

pub fn purchase_receipt_to_json(receipt: &PurchaseReceipt) -> serde_json::Value {
    serde_json::json!({
        "course_id": receipt.course_id.0.to_string(),
        "cost": receipt.cost.amount(),
        "balance_after": receipt.balance_after.amount(),
        "group_no": receipt.group_no,
    })
}

pub fn revocation_receipt_to_json(receipt: &RevocationReceipt) -> serde_json::Value {
    serde_json::json!({
        "course_id": receipt.course_id.0.to_string(),
        "released_group": receipt.released_group,
    })
}
