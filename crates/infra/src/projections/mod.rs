//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Idempotent**: Safe for at-least-once delivery

pub mod accounts;
pub mod catalog;
pub mod groups;

pub use accounts::{AccountBalancesProjection, AccountReadModel, EntitlementView};
pub use catalog::{CourseCatalogProjection, CourseReadModel, LessonView};
pub use groups::{CourseGroupsProjection, CourseGroupsReadModel, GroupReadModel};
