use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campus_catalog::CourseId;
use campus_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use campus_events::Event;

/// Maximum number of students a group may hold.
pub const GROUP_CAPACITY: usize = 10;

/// Number of groups after which new students are packed into the least-full
/// existing group instead of opening yet another one.
pub const GROUP_FANOUT_LIMIT: usize = 10;

/// Namespace for deriving roster stream ids from course ids (UUIDv5).
const ROSTER_NAMESPACE: Uuid = Uuid::from_u128(0x8f1d_c6a2_42b7_4b1e_9d35_77aa_10c4_5e02);

/// Roster identifier.
///
/// Derived deterministically from the course id, so the enrollment flow can
/// address a course's roster without a lookup, and so the roster stream never
/// collides with the course's own stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RosterId(pub AggregateId);

impl RosterId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn for_course(course_id: CourseId) -> Self {
        let derived = Uuid::new_v5(&ROSTER_NAMESPACE, course_id.0.as_uuid().as_bytes());
        Self(AggregateId::from_uuid(derived))
    }
}

impl core::fmt::Display for RosterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A study group within a roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub group_no: u32,
    pub title: String,
    pub members: BTreeSet<UserId>,
}

impl Group {
    pub fn student_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= GROUP_CAPACITY
    }
}

/// Aggregate root: Roster (all groups of one course).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    id: RosterId,
    course_id: Option<CourseId>,
    groups: BTreeMap<u32, Group>,
    version: u64,
}

impl Roster {
    /// Create an empty aggregate instance for rehydration.
    ///
    /// A roster has no explicit create command; the first assignment brings
    /// it to life.
    pub fn empty(id: RosterId) -> Self {
        Self {
            id,
            course_id: None,
            groups: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> RosterId {
        self.id
    }

    pub fn course_id(&self) -> Option<CourseId> {
        self.course_id
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group(&self, group_no: u32) -> Option<&Group> {
        self.groups.get(&group_no)
    }

    /// The group the user currently belongs to, if any.
    pub fn group_of(&self, user: UserId) -> Option<u32> {
        self.groups
            .values()
            .find(|g| g.members.contains(&user))
            .map(|g| g.group_no)
    }

    fn next_group_no(&self) -> u32 {
        self.groups.keys().next_back().copied().unwrap_or(0) + 1
    }

    /// Least-full group; ties broken by the lowest group number.
    fn least_full(&self) -> Option<&Group> {
        self.groups
            .values()
            .min_by_key(|g| (g.members.len(), g.group_no))
    }
}

impl AggregateRoot for Roster {
    type Id = RosterId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AssignStudent (place a new enrollee into a group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignStudent {
    pub course_id: CourseId,
    pub user: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveStudent (release the seat after a revocation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveStudent {
    pub course_id: CourseId,
    pub user: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterCommand {
    AssignStudent(AssignStudent),
    RemoveStudent(RemoveStudent),
}

/// Event: GroupCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCreated {
    pub course_id: CourseId,
    pub group_no: u32,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StudentAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentAssigned {
    pub course_id: CourseId,
    pub group_no: u32,
    pub user: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StudentRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRemoved {
    pub course_id: CourseId,
    pub group_no: u32,
    pub user: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterEvent {
    GroupCreated(GroupCreated),
    StudentAssigned(StudentAssigned),
    StudentRemoved(StudentRemoved),
}

impl Event for RosterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RosterEvent::GroupCreated(_) => "groups.roster.group_created",
            RosterEvent::StudentAssigned(_) => "groups.roster.student_assigned",
            RosterEvent::StudentRemoved(_) => "groups.roster.student_removed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RosterEvent::GroupCreated(e) => e.occurred_at,
            RosterEvent::StudentAssigned(e) => e.occurred_at,
            RosterEvent::StudentRemoved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Roster {
    type Command = RosterCommand;
    type Event = RosterEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RosterEvent::GroupCreated(e) => {
                self.course_id = Some(e.course_id);
                self.groups.insert(
                    e.group_no,
                    Group {
                        group_no: e.group_no,
                        title: e.title.clone(),
                        members: BTreeSet::new(),
                    },
                );
            }
            RosterEvent::StudentAssigned(e) => {
                self.course_id = Some(e.course_id);
                if let Some(group) = self.groups.get_mut(&e.group_no) {
                    group.members.insert(e.user);
                }
            }
            RosterEvent::StudentRemoved(e) => {
                // The emptied group stays around; the next enrollee reuses it.
                if let Some(group) = self.groups.get_mut(&e.group_no) {
                    group.members.remove(&e.user);
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RosterCommand::AssignStudent(cmd) => self.handle_assign(cmd),
            RosterCommand::RemoveStudent(cmd) => self.handle_remove(cmd),
        }
    }
}

impl Roster {
    fn ensure_course(&self, course_id: CourseId) -> Result<(), DomainError> {
        match self.course_id {
            Some(existing) if existing != course_id => {
                Err(DomainError::invariant("course_id mismatch"))
            }
            _ => Ok(()),
        }
    }

    fn open_and_assign(&self, cmd: &AssignStudent, group_no: u32) -> Vec<RosterEvent> {
        vec![
            RosterEvent::GroupCreated(GroupCreated {
                course_id: cmd.course_id,
                group_no,
                title: format!("Group {group_no}"),
                occurred_at: cmd.occurred_at,
            }),
            RosterEvent::StudentAssigned(StudentAssigned {
                course_id: cmd.course_id,
                group_no,
                user: cmd.user,
                occurred_at: cmd.occurred_at,
            }),
        ]
    }

    fn assign_to(&self, cmd: &AssignStudent, group_no: u32) -> Vec<RosterEvent> {
        vec![RosterEvent::StudentAssigned(StudentAssigned {
            course_id: cmd.course_id,
            group_no,
            user: cmd.user,
            occurred_at: cmd.occurred_at,
        })]
    }

    fn handle_assign(&self, cmd: &AssignStudent) -> Result<Vec<RosterEvent>, DomainError> {
        self.ensure_course(cmd.course_id)?;

        if self.group_of(cmd.user).is_some() {
            return Err(DomainError::conflict("student is already assigned to a group"));
        }

        let Some(candidate) = self.least_full() else {
            // First enrollee for this course.
            return Ok(self.open_and_assign(cmd, 1));
        };

        // An emptied group is always reused before anything else.
        if candidate.members.is_empty() {
            return Ok(self.assign_to(cmd, candidate.group_no));
        }

        if self.groups.len() >= GROUP_FANOUT_LIMIT {
            if !candidate.is_full() {
                return Ok(self.assign_to(cmd, candidate.group_no));
            }
            // Every group is at capacity: open an extra one rather than
            // overfilling the least-full group.
            return Ok(self.open_and_assign(cmd, self.next_group_no()));
        }

        // Below the fan-out limit, each enrollee seeds a fresh group.
        Ok(self.open_and_assign(cmd, self.next_group_no()))
    }

    fn handle_remove(&self, cmd: &RemoveStudent) -> Result<Vec<RosterEvent>, DomainError> {
        self.ensure_course(cmd.course_id)?;

        // Releasing a seat for a student who never got one is a no-op.
        let Some(group_no) = self.group_of(cmd.user) else {
            return Ok(vec![]);
        };

        Ok(vec![RosterEvent::StudentRemoved(StudentRemoved {
            course_id: cmd.course_id,
            group_no,
            user: cmd.user,
            occurred_at: cmd.occurred_at,
        })])
    }
}
