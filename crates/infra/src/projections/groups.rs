use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use campus_catalog::{CourseEvent, CourseId};
use campus_core::{AggregateId, UserId};
use campus_events::EventEnvelope;
use campus_groups::{RosterEvent, RosterId};

use crate::read_model::ReadModelStore;

/// Queryable group read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReadModel {
    pub group_no: u32,
    pub title: String,
    pub student_count: u32,
    pub members: Vec<UserId>,
}

/// All groups of one course, sorted by group number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseGroupsReadModel {
    pub course_id: CourseId,
    pub groups: Vec<GroupReadModel>,
}

#[derive(Debug, Error)]
pub enum GroupsProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Course groups projection.
///
/// Consumes two streams: roster events build the group listing; the course's
/// `CourseArchived` event cascades the whole listing away, since groups only
/// exist as part of their course.
#[derive(Debug)]
pub struct CourseGroupsProjection<S>
where
    S: ReadModelStore<CourseId, CourseGroupsReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> CourseGroupsProjection<S>
where
    S: ReadModelStore<CourseId, CourseGroupsReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors.get(&aggregate_id).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, sequence_number);
        }
    }

    /// Idempotency guard shared by both consumed streams.
    fn check_sequence(
        &self,
        aggregate_id: AggregateId,
        seq: u64,
    ) -> Result<bool, GroupsProjectionError> {
        let last = self.cursor(aggregate_id);
        if seq == 0 {
            return Err(GroupsProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(false);
        }
        if seq != last + 1 && last != 0 {
            return Err(GroupsProjectionError::NonMonotonicSequence { last, found: seq });
        }
        Ok(true)
    }

    pub fn get(&self, course_id: &CourseId) -> Option<CourseGroupsReadModel> {
        self.store.get(course_id)
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), GroupsProjectionError> {
        match envelope.aggregate_type() {
            "groups.roster" => self.apply_roster_event(envelope),
            "catalog.course" => self.apply_course_event(envelope),
            _ => Ok(()),
        }
    }

    fn apply_roster_event(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), GroupsProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        if !self.check_sequence(aggregate_id, seq)? {
            return Ok(());
        }

        let ev: RosterEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| GroupsProjectionError::Deserialize(e.to_string()))?;

        let course_id = match &ev {
            RosterEvent::GroupCreated(e) => e.course_id,
            RosterEvent::StudentAssigned(e) => e.course_id,
            RosterEvent::StudentRemoved(e) => e.course_id,
        };

        if RosterId::for_course(course_id).0 != aggregate_id {
            return Err(GroupsProjectionError::StreamMismatch(
                "event course_id does not derive the envelope aggregate_id".to_string(),
            ));
        }

        let mut rm = self.store.get(&course_id).unwrap_or(CourseGroupsReadModel {
            course_id,
            groups: Vec::new(),
        });

        match ev {
            RosterEvent::GroupCreated(e) => {
                if !rm.groups.iter().any(|g| g.group_no == e.group_no) {
                    rm.groups.push(GroupReadModel {
                        group_no: e.group_no,
                        title: e.title,
                        student_count: 0,
                        members: Vec::new(),
                    });
                    rm.groups.sort_by_key(|g| g.group_no);
                }
            }
            RosterEvent::StudentAssigned(e) => {
                if let Some(g) = rm.groups.iter_mut().find(|g| g.group_no == e.group_no) {
                    if !g.members.contains(&e.user) {
                        g.members.push(e.user);
                        g.student_count += 1;
                    }
                }
            }
            RosterEvent::StudentRemoved(e) => {
                if let Some(g) = rm.groups.iter_mut().find(|g| g.group_no == e.group_no) {
                    // Decrement first, floored at zero, then drop the member row.
                    g.student_count = g.student_count.saturating_sub(1);
                    g.members.retain(|m| *m != e.user);
                }
            }
        }

        self.store.upsert(course_id, rm);
        self.update_cursor(aggregate_id, seq);
        Ok(())
    }

    fn apply_course_event(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), GroupsProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        if !self.check_sequence(aggregate_id, seq)? {
            return Ok(());
        }

        let ev: CourseEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| GroupsProjectionError::Deserialize(e.to_string()))?;

        if let CourseEvent::CourseArchived(e) = &ev {
            if e.course_id.0 != aggregate_id {
                return Err(GroupsProjectionError::StreamMismatch(
                    "event course_id does not match envelope aggregate_id".to_string(),
                ));
            }
            self.store.remove(&e.course_id);
        }

        self.update_cursor(aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), GroupsProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        self.store.clear();
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
