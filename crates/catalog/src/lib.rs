//! Course catalog domain module (event-sourced).
//!
//! This crate contains business rules for courses and their lessons,
//! implemented purely as deterministic domain logic (no IO, no HTTP,
//! no storage).

pub mod course;

pub use course::{
    AddLesson, ArchiveCourse, Course, CourseArchived, CourseCommand, CourseCreated, CourseEvent,
    CourseId, CreateCourse, Lesson, LessonAdded,
};
