use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campus_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Entity, UserId};
use campus_events::Event;

/// Course identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseId(pub AggregateId);

impl CourseId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CourseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A lesson within a course.
///
/// Lessons are entities owned by the course aggregate; they have no stream of
/// their own and are numbered from 1 in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub lesson_no: u32,
    pub name: String,
    pub link: String,
}

impl Entity for Lesson {
    type Id = u32;

    fn id(&self) -> &Self::Id {
        &self.lesson_no
    }
}

/// Aggregate root: Course.
///
/// The cost is fixed at creation; no command mutates it, so a purchase can
/// never observe a price change mid-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    id: CourseId,
    creator: Option<UserId>,
    name: String,
    cost: u64,
    started_at: Option<DateTime<Utc>>,
    lessons: Vec<Lesson>,
    archived: bool,
    version: u64,
    created: bool,
}

impl Course {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: CourseId) -> Self {
        Self {
            id,
            creator: None,
            name: String::new(),
            cost: 0,
            started_at: None,
            lessons: Vec::new(),
            archived: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CourseId {
        self.id
    }

    pub fn creator(&self) -> Option<UserId> {
        self.creator
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn lessons(&self) -> &[Lesson] {
        &self.lessons
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    /// Check if the course can be purchased (created and not archived).
    pub fn is_purchasable(&self) -> bool {
        self.created && !self.archived
    }
}

impl AggregateRoot for Course {
    type Id = CourseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateCourse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCourse {
    pub course_id: CourseId,
    pub creator: UserId,
    pub name: String,
    pub cost: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLesson {
    pub course_id: CourseId,
    pub name: String,
    pub link: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ArchiveCourse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCourse {
    pub course_id: CourseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourseCommand {
    CreateCourse(CreateCourse),
    AddLesson(AddLesson),
    ArchiveCourse(ArchiveCourse),
}

/// Event: CourseCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCreated {
    pub course_id: CourseId,
    pub creator: UserId,
    pub name: String,
    pub cost: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LessonAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonAdded {
    pub course_id: CourseId,
    pub lesson_no: u32,
    pub name: String,
    pub link: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CourseArchived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseArchived {
    pub course_id: CourseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourseEvent {
    CourseCreated(CourseCreated),
    LessonAdded(LessonAdded),
    CourseArchived(CourseArchived),
}

impl Event for CourseEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CourseEvent::CourseCreated(_) => "catalog.course.created",
            CourseEvent::LessonAdded(_) => "catalog.course.lesson_added",
            CourseEvent::CourseArchived(_) => "catalog.course.archived",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CourseEvent::CourseCreated(e) => e.occurred_at,
            CourseEvent::LessonAdded(e) => e.occurred_at,
            CourseEvent::CourseArchived(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Course {
    type Command = CourseCommand;
    type Event = CourseEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CourseEvent::CourseCreated(e) => {
                self.id = e.course_id;
                self.creator = Some(e.creator);
                self.name = e.name.clone();
                self.cost = e.cost;
                self.started_at = Some(e.occurred_at);
                self.created = true;
            }
            CourseEvent::LessonAdded(e) => {
                self.lessons.push(Lesson {
                    lesson_no: e.lesson_no,
                    name: e.name.clone(),
                    link: e.link.clone(),
                });
            }
            CourseEvent::CourseArchived(_) => {
                self.archived = true;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CourseCommand::CreateCourse(cmd) => self.handle_create(cmd),
            CourseCommand::AddLesson(cmd) => self.handle_add_lesson(cmd),
            CourseCommand::ArchiveCourse(cmd) => self.handle_archive(cmd),
        }
    }
}

impl Course {
    fn ensure_course_id(&self, course_id: CourseId) -> Result<(), DomainError> {
        if self.id != course_id {
            return Err(DomainError::invariant("course_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateCourse) -> Result<Vec<CourseEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("course already exists"));
        }

        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }

        Ok(vec![CourseEvent::CourseCreated(CourseCreated {
            course_id: cmd.course_id,
            creator: cmd.creator,
            name: cmd.name.clone(),
            cost: cmd.cost,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_lesson(&self, cmd: &AddLesson) -> Result<Vec<CourseEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_course_id(cmd.course_id)?;

        if self.archived {
            return Err(DomainError::invariant("archived courses cannot be modified"));
        }

        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("lesson name cannot be empty"));
        }

        if cmd.link.trim().is_empty() {
            return Err(DomainError::validation("lesson link cannot be empty"));
        }

        // Link uniqueness across courses is a read-model check at the API
        // boundary; the aggregate can only see its own lessons.
        if self.lessons.iter().any(|l| l.link == cmd.link) {
            return Err(DomainError::conflict("lesson link already used in this course"));
        }

        let lesson_no = self.lessons.len() as u32 + 1;

        Ok(vec![CourseEvent::LessonAdded(LessonAdded {
            course_id: cmd.course_id,
            lesson_no,
            name: cmd.name.clone(),
            link: cmd.link.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_archive(&self, cmd: &ArchiveCourse) -> Result<Vec<CourseEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_course_id(cmd.course_id)?;

        if self.archived {
            return Err(DomainError::conflict("course is already archived"));
        }

        Ok(vec![CourseEvent::CourseArchived(CourseArchived {
            course_id: cmd.course_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_course_id() -> CourseId {
        CourseId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn created_course(cost: u64) -> (Course, CourseId) {
        let course_id = test_course_id();
        let mut course = Course::empty(course_id);
        let cmd = CreateCourse {
            course_id,
            creator: UserId::new(),
            name: "Intro to Rust".to_string(),
            cost,
            occurred_at: test_time(),
        };
        let events = course.handle(&CourseCommand::CreateCourse(cmd)).unwrap();
        course.apply(&events[0]);
        (course, course_id)
    }

    #[test]
    fn create_course_emits_course_created_event() {
        let course_id = test_course_id();
        let course = Course::empty(course_id);
        let creator = UserId::new();
        let cmd = CreateCourse {
            course_id,
            creator,
            name: "Intro to Rust".to_string(),
            cost: 1000,
            occurred_at: test_time(),
        };

        let events = course.handle(&CourseCommand::CreateCourse(cmd)).unwrap();
        assert_eq!(events.len(), 1);

        match &events[0] {
            CourseEvent::CourseCreated(e) => {
                assert_eq!(e.course_id, course_id);
                assert_eq!(e.creator, creator);
                assert_eq!(e.name, "Intro to Rust");
                assert_eq!(e.cost, 1000);
            }
            _ => panic!("Expected CourseCreated event"),
        }
    }

    #[test]
    fn create_course_rejects_empty_name() {
        let course_id = test_course_id();
        let course = Course::empty(course_id);
        let cmd = CreateCourse {
            course_id,
            creator: UserId::new(),
            name: "   ".to_string(),
            cost: 1000,
            occurred_at: test_time(),
        };

        let err = course.handle(&CourseCommand::CreateCourse(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_course_rejects_duplicate_creation() {
        let (course, course_id) = created_course(1000);
        let cmd = CreateCourse {
            course_id,
            creator: UserId::new(),
            name: "Another".to_string(),
            cost: 500,
            occurred_at: test_time(),
        };

        let err = course.handle(&CourseCommand::CreateCourse(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn zero_cost_course_is_allowed() {
        let (course, _) = created_course(0);
        assert_eq!(course.cost(), 0);
        assert!(course.is_purchasable());
    }

    #[test]
    fn add_lesson_numbers_lessons_in_order() {
        let (mut course, course_id) = created_course(1000);

        for (i, link) in ["https://campus.test/l1", "https://campus.test/l2"]
            .iter()
            .enumerate()
        {
            let cmd = AddLesson {
                course_id,
                name: format!("Lesson {}", i + 1),
                link: link.to_string(),
                occurred_at: test_time(),
            };
            let events = course.handle(&CourseCommand::AddLesson(cmd)).unwrap();
            course.apply(&events[0]);
        }

        assert_eq!(course.lessons().len(), 2);
        assert_eq!(course.lessons()[0].lesson_no, 1);
        assert_eq!(course.lessons()[1].lesson_no, 2);
    }

    #[test]
    fn add_lesson_rejects_duplicate_link() {
        let (mut course, course_id) = created_course(1000);

        let cmd = AddLesson {
            course_id,
            name: "Lesson 1".to_string(),
            link: "https://campus.test/l1".to_string(),
            occurred_at: test_time(),
        };
        let events = course.handle(&CourseCommand::AddLesson(cmd.clone())).unwrap();
        course.apply(&events[0]);

        let err = course
            .handle(&CourseCommand::AddLesson(AddLesson {
                name: "Lesson 2".to_string(),
                ..cmd
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn add_lesson_rejects_missing_course() {
        let course_id = test_course_id();
        let course = Course::empty(course_id);
        let cmd = AddLesson {
            course_id,
            name: "Lesson 1".to_string(),
            link: "https://campus.test/l1".to_string(),
            occurred_at: test_time(),
        };

        let err = course.handle(&CourseCommand::AddLesson(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[test]
    fn archive_blocks_further_modification() {
        let (mut course, course_id) = created_course(1000);

        let events = course
            .handle(&CourseCommand::ArchiveCourse(ArchiveCourse {
                course_id,
                occurred_at: test_time(),
            }))
            .unwrap();
        course.apply(&events[0]);
        assert!(course.is_archived());
        assert!(!course.is_purchasable());

        let err = course
            .handle(&CourseCommand::AddLesson(AddLesson {
                course_id,
                name: "Late lesson".to_string(),
                link: "https://campus.test/late".to_string(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let err = course
            .handle(&CourseCommand::ArchiveCourse(ArchiveCourse {
                course_id,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn version_increments_on_apply() {
        let (mut course, course_id) = created_course(1000);
        assert_eq!(course.version(), 1);

        let events = course
            .handle(&CourseCommand::AddLesson(AddLesson {
                course_id,
                name: "Lesson 1".to_string(),
                link: "https://campus.test/l1".to_string(),
                occurred_at: test_time(),
            }))
            .unwrap();
        course.apply(&events[0]);
        assert_eq!(course.version(), 2);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (course, course_id) = created_course(1000);
        let before = course.clone();

        let cmd = CourseCommand::AddLesson(AddLesson {
            course_id,
            name: "Lesson 1".to_string(),
            link: "https://campus.test/l1".to_string(),
            occurred_at: test_time(),
        });

        let events1 = course.handle(&cmd).unwrap();
        let events2 = course.handle(&cmd).unwrap();

        assert_eq!(course, before);
        assert_eq!(events1, events2);
    }
}
