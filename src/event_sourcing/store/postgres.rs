use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::event_sourcing::core::{
    EncodedValue, EventRecord, EventStoreError, NewEvent, PersistenceError, Result,
};
use super::backend::{AuditCursor, EventBackend};

// ============================================================================
// Postgres Backend
// ============================================================================
//
// One append-only table keyed by `id`, with a unique constraint on
// `(stream_id, version)`. The expected-version check is folded into the
// insert statement itself:
//
//   INSERT .. SELECT .. WHERE current_version = expected
//   ON CONFLICT (stream_id, version) DO NOTHING
//
// Two writers racing for the same version both pass the WHERE clause, but
// the unique index serialises them: the second one waits for the first to
// commit and then inserts nothing. No application-level lock is involved,
// so the guarantee holds across processes.
//
// ============================================================================

const STREAM_VERSION_CONSTRAINT: &str = "event_store_stream_version_key";

const SELECT_COLUMNS: &str =
    "id, stream_id, stream_type, event_type, payload, metadata, version, created_at";

const INSERT_IF_CURRENT: &str = r#"
    INSERT INTO event_store (
        id, stream_id, stream_type, event_type, payload, metadata, version, created_at
    )
    SELECT $1, $2, $3, $4, $5, $6, $7, clock_timestamp()
    WHERE (SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = $2) = $8
    ON CONFLICT (stream_id, version) DO NOTHING
    RETURNING created_at
"#;

const INSERT_NEXT: &str = r#"
    INSERT INTO event_store (
        id, stream_id, stream_type, event_type, payload, metadata, version, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp())
    RETURNING created_at
"#;

#[derive(Clone)]
pub struct PgEventBackend {
    pool: PgPool,
}

impl PgEventBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the migrations under `migrations/`. The migrator holds a
    /// Postgres advisory lock while it runs, so processes starting
    /// together on a fresh database apply each migration exactly once.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PersistenceError::from)?;
        tracing::info!("Event store schema ready");
        Ok(())
    }

    /// Insert the first event of a batch, conditional on the current version.
    /// Returns `None` when the condition or the unique key rejected it.
    async fn insert_if_current(
        tx: &mut Transaction<'_, Postgres>,
        stream_id: Uuid,
        expected_version: i64,
        version: i64,
        id: Uuid,
        event: &NewEvent,
    ) -> std::result::Result<Option<DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar::<_, DateTime<Utc>>(INSERT_IF_CURRENT)
            .bind(id)
            .bind(stream_id)
            .bind(&event.stream_type)
            .bind(&event.event_type)
            .bind(event.payload.as_str())
            .bind(event.metadata.as_ref().map(EncodedValue::as_str))
            .bind(version)
            .bind(expected_version)
            .fetch_optional(&mut **tx)
            .await
    }

    async fn insert_next(
        tx: &mut Transaction<'_, Postgres>,
        stream_id: Uuid,
        version: i64,
        id: Uuid,
        event: &NewEvent,
    ) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
        sqlx::query_scalar::<_, DateTime<Utc>>(INSERT_NEXT)
            .bind(id)
            .bind(stream_id)
            .bind(&event.stream_type)
            .bind(&event.event_type)
            .bind(event.payload.as_str())
            .bind(event.metadata.as_ref().map(EncodedValue::as_str))
            .bind(version)
            .fetch_one(&mut **tx)
            .await
    }

    async fn conflict(&self, stream_id: Uuid, expected_version: i64) -> EventStoreError {
        match self.current_version(stream_id).await {
            Ok(actual_version) => EventStoreError::ConcurrencyConflict {
                stream_id,
                expected_version,
                actual_version,
            },
            Err(e) => e,
        }
    }
}

/// Whether `e` is the `(stream_id, version)` uniqueness check firing
fn is_version_collision(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                && db_err.constraint() == Some(STREAM_VERSION_CONSTRAINT)
        }
        _ => false,
    }
}

fn record_from_row(row: &PgRow) -> std::result::Result<EventRecord, sqlx::Error> {
    Ok(EventRecord {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        stream_type: row.try_get("stream_type")?,
        event_type: row.try_get("event_type")?,
        payload: EncodedValue::from_raw(row.try_get::<String, _>("payload")?),
        metadata: row
            .try_get::<Option<String>, _>("metadata")?
            .map(EncodedValue::from_raw),
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EventBackend for PgEventBackend {
    async fn append(
        &self,
        stream_id: Uuid,
        expected_version: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>> {
        let last_version = expected_version
            .checked_add(events.len() as i64)
            .ok_or(EventStoreError::InvalidExpectedVersion(expected_version))?;

        let mut tx = self.pool.begin().await?;
        let mut committed = Vec::with_capacity(events.len());
        let versions = (expected_version..last_version).map(|v| v + 1);

        for (position, (event, version)) in events.into_iter().zip(versions).enumerate() {
            let id = Uuid::now_v7();

            let inserted = if position == 0 {
                Self::insert_if_current(&mut tx, stream_id, expected_version, version, id, &event)
                    .await
            } else {
                Self::insert_next(&mut tx, stream_id, version, id, &event)
                    .await
                    .map(Some)
            };

            let created_at = match inserted {
                Ok(Some(created_at)) => created_at,
                Ok(None) => {
                    drop(tx);
                    return Err(self.conflict(stream_id, expected_version).await);
                }
                Err(e) if is_version_collision(&e) => {
                    drop(tx);
                    return Err(self.conflict(stream_id, expected_version).await);
                }
                Err(e) => return Err(e.into()),
            };

            committed.push(EventRecord {
                id,
                stream_id,
                stream_type: event.stream_type,
                event_type: event.event_type,
                payload: event.payload,
                metadata: event.metadata,
                version,
                created_at,
            });
        }

        tx.commit().await?;
        Ok(committed)
    }

    async fn current_version(&self, stream_id: Uuid) -> Result<i64> {
        let version = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_store
             WHERE stream_id = $1 AND version > $2
             ORDER BY version ASC
             LIMIT $3"
        );

        let rows = sqlx::query(&sql)
            .bind(stream_id)
            .bind(from_version)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let events = rows
            .iter()
            .map(record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    async fn read_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<AuditCursor>,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM event_store
             WHERE created_at >= $1 AND created_at < $2
               AND ($3::timestamptz IS NULL
                    OR (created_at, stream_id, version) > ($3::timestamptz, $4::uuid, $5::bigint))
             ORDER BY created_at ASC, stream_id ASC, version ASC
             LIMIT $6"
        );

        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .bind(after.map(|c| c.created_at))
            .bind(after.map(|c| c.stream_id))
            .bind(after.map(|c| c.version))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let events = rows
            .iter()
            .map(record_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
