use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use campus_catalog::{CourseEvent, CourseId};
use campus_core::{AggregateId, UserId};
use campus_events::EventEnvelope;

use crate::read_model::ReadModelStore;

/// Queryable course read model (catalog entry with embedded lessons).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseReadModel {
    pub course_id: CourseId,
    pub creator: UserId,
    pub name: String,
    pub cost: u64,
    pub started_at: DateTime<Utc>,
    pub lessons: Vec<LessonView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonView {
    pub lesson_no: u32,
    pub name: String,
    pub link: String,
}

#[derive(Debug, Error)]
pub enum CatalogProjectionError {
    #[error("failed to deserialize course event: {0}")]
    Deserialize(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Course catalog projection.
///
/// Archiving a course removes its catalog entry (and its embedded lessons)
/// entirely; lessons have no life of their own outside their course.
#[derive(Debug)]
pub struct CourseCatalogProjection<S>
where
    S: ReadModelStore<CourseId, CourseReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> CourseCatalogProjection<S>
where
    S: ReadModelStore<CourseId, CourseReadModel>,
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

    pub fn get(&self, course_id: &CourseId) -> Option<CourseReadModel> {
        self.store.get(course_id)
    }

    pub fn list(&self) -> Vec<CourseReadModel> {
        let mut items = self.store.list();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), CatalogProjectionError> {
        if envelope.aggregate_type() != "catalog.course" {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let last = self.cursor(aggregate_id);
        if seq == 0 {
            return Err(CatalogProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 && last != 0 {
            return Err(CatalogProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let ev: CourseEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| CatalogProjectionError::Deserialize(e.to_string()))?;

        let course_id = match &ev {
            CourseEvent::CourseCreated(e) => e.course_id,
            CourseEvent::LessonAdded(e) => e.course_id,
            CourseEvent::CourseArchived(e) => e.course_id,
        };

        if course_id.0 != aggregate_id {
            return Err(CatalogProjectionError::StreamMismatch(
                "event course_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            CourseEvent::CourseCreated(e) => {
                self.store.upsert(
                    e.course_id,
                    CourseReadModel {
                        course_id: e.course_id,
                        creator: e.creator,
                        name: e.name,
                        cost: e.cost,
                        started_at: e.occurred_at,
                        lessons: Vec::new(),
                    },
                );
            }
            CourseEvent::LessonAdded(e) => {
                if let Some(mut rm) = self.store.get(&e.course_id) {
                    rm.lessons.push(LessonView {
                        lesson_no: e.lesson_no,
                        name: e.name,
                        link: e.link,
                    });
                    self.store.upsert(e.course_id, rm);
                }
            }
            CourseEvent::CourseArchived(e) => {
                self.store.remove(&e.course_id);
            }
        }

        self.update_cursor(aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), CatalogProjectionError> {
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
