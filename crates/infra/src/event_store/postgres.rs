//! Postgres-backed event store implementation.
//!
//! Events are persisted append-only with optimistic concurrency enforced at
//! the database level: the unique constraint on `(aggregate_id,
//! sequence_number)` turns a concurrent append into a constraint violation,
//! which is surfaced as `EventStoreError::Concurrency`.
//!
//! The `EventStore` trait is synchronous; database operations run through
//! `Handle::block_on` inside `block_in_place`, which requires the process to
//! run on a multi-threaded tokio runtime (the API binary does).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use campus_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INT NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    UNIQUE (aggregate_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS events_aggregate_idx ON events (aggregate_id, sequence_number);
"#;

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the events table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn load_stream_async(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT event_id, aggregate_id, aggregate_type, sequence_number, \
                    event_type, event_version, occurred_at, payload \
             FROM events WHERE aggregate_id = $1 ORDER BY sequence_number ASC",
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(row_to_stored).collect()
    }

    async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_number), 0) AS version, MIN(aggregate_type) AS aggregate_type \
             FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        let current = row.try_get::<i64, _>("version").map_err(backend)? as u64;
        let stream_type: Option<String> = row.try_get("aggregate_type").map_err(backend)?;

        if let Some(existing) = stream_type {
            if existing != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());

        for e in events {
            let result = sqlx::query(
                "INSERT INTO events (event_id, aggregate_id, aggregate_type, sequence_number, \
                                     event_type, event_version, occurred_at, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(e.event_id)
            .bind(e.aggregate_id.as_uuid())
            .bind(&e.aggregate_type)
            .bind(next as i64)
            .bind(&e.event_type)
            .bind(e.event_version as i32)
            .bind(e.occurred_at)
            .bind(&e.payload)
            .execute(&mut *tx)
            .await;

            if let Err(err) = result {
                // A concurrent append wins the race on (aggregate_id, sequence_number).
                if is_unique_violation(&err) {
                    return Err(EventStoreError::Concurrency(format!(
                        "concurrent append detected at sequence {next}"
                    )));
                }
                return Err(backend(err));
            }

            committed.push(StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            });
            next += 1;
        }

        tx.commit().await.map_err(backend)?;

        Ok(committed)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on_store(self.append_async(events, expected_version))
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        block_on_store(self.load_stream_async(aggregate_id))
    }
}

fn block_on_store<T>(
    fut: impl Future<Output = Result<T, EventStoreError>>,
) -> Result<T, EventStoreError> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| EventStoreError::Backend("no tokio runtime available".to_string()))?;

    tokio::task::block_in_place(|| handle.block_on(fut))
}

fn backend(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let event_id: Uuid = row.try_get("event_id").map_err(backend)?;
    let aggregate_id: Uuid = row.try_get("aggregate_id").map_err(backend)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(backend)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(backend)?;
    let event_type: String = row.try_get("event_type").map_err(backend)?;
    let event_version: i32 = row.try_get("event_version").map_err(backend)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(backend)?;
    let payload: JsonValue = row.try_get("payload").map_err(backend)?;

    Ok(StoredEvent {
        event_id,
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        aggregate_type,
        sequence_number: sequence_number as u64,
        event_type,
        event_version: event_version as u32,
        occurred_at,
        payload,
    })
}
