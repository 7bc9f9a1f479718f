//! Postgres-backed event store.
//!
//! ## Schema
//!
//! - `events`: one row per event, unique on
//!   `(tenant_id, aggregate_type, aggregate_id, version)`.
//! - `aggregates`: one row per stream holding the live snapshot. The row is
//!   also the per-stream lock taken by `append` (`SELECT ... FOR UPDATE`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `VersionConflict` (on insert) |
//! | Database (other) | Any other | `InvalidAppend` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};

use strata_core::{AggregateId, EventUpcasters, MessageId, TenantId};
use strata_events::{Event, Metadata};

use super::r#trait::{
    AppendOutcome, EventStore, EventStoreError, LoadedStream, SnapshotCandidate, SnapshotPolicy,
    StoredSnapshot, StreamId, UncommittedEvent, upcast_event,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        aggregate_type TEXT NOT NULL,
        type TEXT NOT NULL,
        payload JSONB NOT NULL,
        version BIGINT NOT NULL CHECK (version > 0),
        metadata JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, id),
        UNIQUE (tenant_id, aggregate_type, aggregate_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aggregates (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        type TEXT NOT NULL,
        version BIGINT NOT NULL DEFAULT 0,
        snapshot JSONB,
        schema_version INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, type, id)
    )
    "#,
];

/// Postgres-backed append-only event store.
///
/// Every query is scoped by `tenant_id`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    upcasters: Arc<EventUpcasters>,
    policy: SnapshotPolicy,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            upcasters: Arc::new(EventUpcasters::new()),
            policy: SnapshotPolicy::default(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn with_upcasters(mut self, upcasters: EventUpcasters) -> Self {
        self.upcasters = Arc::new(upcasters);
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create the `events` and `aggregates` tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        info!("event store schema ready");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, stream, events, snapshot),
        fields(
            stream = %stream,
            event_count = events.len(),
            snapshot_version
        ),
        err
    )]
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
        snapshot: Option<SnapshotCandidate>,
    ) -> Result<AppendOutcome, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_stream(&mut tx, stream).await?;
        let current = stream_version(&mut tx, stream).await?;
        if current != expected_version {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::VersionConflict {
                stream: stream.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        if events.is_empty() {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(AppendOutcome {
                events: vec![],
                snapshot_version: None,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        for (i, event) in events.into_iter().enumerate() {
            let version = expected_version + i as u64 + 1;
            let event = event.commit(stream, version);
            insert_event(&mut tx, &event).await.map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::VersionConflict {
                        stream: stream.to_string(),
                        expected: expected_version,
                        actual: version,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;
            committed.push(event);
        }

        let new_version = expected_version + committed.len() as u64;
        let mut snapshot_version = None;
        if self.policy.should_persist(expected_version, new_version, snapshot.as_ref()) {
            if let Some(candidate) = snapshot {
                if upsert_snapshot(&mut tx, stream, new_version, &candidate).await? {
                    snapshot_version = Some(new_version);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if let Some(v) = snapshot_version {
            Span::current().record("snapshot_version", v);
        }
        Ok(AppendOutcome {
            events: committed,
            snapshot_version,
        })
    }

    #[instrument(skip(self, stream), fields(stream = %stream, event_count), err)]
    async fn load(
        &self,
        stream: &StreamId,
        from_version: u64,
    ) -> Result<Option<LoadedStream>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, type, aggregate_id, aggregate_type, version, payload, metadata
            FROM events
            WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3 AND version > $4
            ORDER BY version ASC
            "#,
        )
        .bind(stream.tenant_id.as_str())
        .bind(&stream.aggregate_type)
        .bind(stream.aggregate_id.as_str())
        .bind(to_db_version(from_version)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        Span::current().record("event_count", rows.len());
        if rows.is_empty() && from_version == 0 {
            return Ok(None);
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event = event_from_row(&row)?;
            if event.tenant_id != stream.tenant_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "event {} does not belong to tenant {}",
                    event.id, stream.tenant_id
                )));
            }
            events.push(upcast_event(&self.upcasters, event)?);
        }
        let version = events.last().map(|e| e.version).unwrap_or(0).max(from_version);
        Ok(Some(LoadedStream { events, version }))
    }

    #[instrument(skip(self, stream), fields(stream = %stream), err)]
    async fn load_snapshot(&self, stream: &StreamId) -> Result<Option<StoredSnapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT version, snapshot, schema_version, created_at
            FROM aggregates
            WHERE tenant_id = $1 AND type = $2 AND id = $3 AND snapshot IS NOT NULL
            "#,
        )
        .bind(stream.tenant_id.as_str())
        .bind(&stream.aggregate_type)
        .bind(stream.aggregate_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        row.map(|row| snapshot_from_row(&row)).transpose()
    }
}

/// Ensure the stream's `aggregates` row exists, then lock it for this transaction.
async fn lock_stream(tx: &mut Transaction<'_, Postgres>, stream: &StreamId) -> Result<(), EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO aggregates (id, tenant_id, type)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, type, id) DO NOTHING
        "#,
    )
    .bind(stream.aggregate_id.as_str())
    .bind(stream.tenant_id.as_str())
    .bind(&stream.aggregate_type)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("ensure_aggregate_row", e))?;

    sqlx::query("SELECT version FROM aggregates WHERE tenant_id = $1 AND type = $2 AND id = $3 FOR UPDATE")
        .bind(stream.tenant_id.as_str())
        .bind(&stream.aggregate_type)
        .bind(stream.aggregate_id.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_aggregate_row", e))?;
    Ok(())
}

async fn stream_version(tx: &mut Transaction<'_, Postgres>, stream: &StreamId) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(version), 0) AS current_version
        FROM events
        WHERE tenant_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        "#,
    )
    .bind(stream.tenant_id.as_str())
    .bind(&stream.aggregate_type)
    .bind(stream.aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("stream_version", e))?;
    Ok(current.max(0) as u64)
}

async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<(), sqlx::Error> {
    let metadata = event
        .metadata
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO events (tenant_id, id, aggregate_id, aggregate_type, type, payload, version, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.tenant_id.as_str())
    .bind(event.id.as_str())
    .bind(event.aggregate_id.as_str())
    .bind(&event.aggregate_type)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.version as i64)
    .bind(metadata)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Write the snapshot unless an equal or newer one is already stored.
async fn upsert_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    stream: &StreamId,
    version: u64,
    candidate: &SnapshotCandidate,
) -> Result<bool, EventStoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO aggregates (id, tenant_id, type, version, snapshot, schema_version, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (tenant_id, type, id) DO UPDATE SET
            version = EXCLUDED.version,
            snapshot = EXCLUDED.snapshot,
            schema_version = EXCLUDED.schema_version,
            created_at = EXCLUDED.created_at
        WHERE aggregates.version < EXCLUDED.version
        "#,
    )
    .bind(stream.aggregate_id.as_str())
    .bind(stream.tenant_id.as_str())
    .bind(&stream.aggregate_type)
    .bind(to_db_version(version)?)
    .bind(&candidate.state)
    .bind(candidate.schema_version as i32)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_snapshot", e))?;
    Ok(result.rows_affected() > 0)
}

fn to_db_version(version: u64) -> Result<i64, EventStoreError> {
    i64::try_from(version).map_err(|_| EventStoreError::InvalidAppend(format!("version {version} out of range")))
}

fn event_from_row(row: &PgRow) -> Result<Event, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Serialization(format!("failed to decode event row: {e}"));
    let metadata: Option<JsonValue> = row.try_get("metadata").map_err(decode)?;
    let metadata = metadata
        .map(serde_json::from_value::<Metadata>)
        .transpose()
        .map_err(|e| EventStoreError::Serialization(format!("failed to decode event metadata: {e}")))?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(Event {
        id: MessageId::from(row.try_get::<String, _>("id").map_err(decode)?),
        tenant_id: TenantId::from(row.try_get::<String, _>("tenant_id").map_err(decode)?),
        event_type: row.try_get("type").map_err(decode)?,
        aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id").map_err(decode)?),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        version: version as u64,
        payload: row.try_get("payload").map_err(decode)?,
        metadata,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<StoredSnapshot, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Serialization(format!("failed to decode snapshot row: {e}"));
    let version: i64 = row.try_get("version").map_err(decode)?;
    let schema_version: i32 = row.try_get("schema_version").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    Ok(StoredSnapshot {
        version: version as u64,
        state: row.try_get("snapshot").map_err(decode)?,
        schema_version: schema_version.max(1) as u32,
        created_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventStoreError::InvalidAppend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            EventStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            EventStoreError::InvalidAppend(format!("unexpected row not found in {operation}"))
        }
        other => EventStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}
