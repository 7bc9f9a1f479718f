use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use strata_core::{AggregateId, MessageId, TenantId, UpcastError};
use strata_events::{Event, Metadata};

/// Identity of one aggregate stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
}

impl StreamId {
    pub fn new(
        tenant_id: TenantId,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
    ) -> Self {
        Self {
            tenant_id,
            aggregate_type: aggregate_type.into(),
            aggregate_id,
        }
    }

    pub fn of_event(event: &Event) -> Self {
        Self::new(
            event.tenant_id.clone(),
            event.aggregate_type.clone(),
            event.aggregate_id.clone(),
        )
    }
}

/// Renders as the aggregate workflow id: `{tenant}_{type}-{id}`.
impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}-{}",
            self.tenant_id, self.aggregate_type, self.aggregate_id
        )
    }
}

/// An event ready to be appended (the store assigns its version).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncommittedEvent {
    pub id: MessageId,
    pub event_type: String,
    pub payload: JsonValue,
    pub metadata: Metadata,
}

impl UncommittedEvent {
    pub(crate) fn commit(self, stream: &StreamId, version: u64) -> Event {
        Event {
            id: self.id,
            tenant_id: stream.tenant_id.clone(),
            event_type: self.event_type,
            aggregate_id: stream.aggregate_id.clone(),
            aggregate_type: stream.aggregate_type.clone(),
            version,
            payload: self.payload,
            metadata: Some(self.metadata),
        }
    }
}

/// Post-append state offered for snapshotting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCandidate {
    pub state: JsonValue,
    pub schema_version: u32,
    /// Persist regardless of the cadence.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub version: u64,
    pub state: JsonValue,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub events: Vec<Event>,
    /// Version of the snapshot written by this append, if any.
    pub snapshot_version: Option<u64>,
}

impl AppendOutcome {
    pub fn version(&self) -> Option<u64> {
        self.events.last().map(|e| e.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedStream {
    pub events: Vec<Event>,
    /// `max(from_version, highest returned version)`.
    pub version: u64,
}

/// Snapshot cadence: persist when an append crosses a multiple of `every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub every: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { every: 2 }
    }
}

impl SnapshotPolicy {
    pub fn every(every: u64) -> Self {
        Self { every }
    }

    /// `⌊new / N⌋ > ⌊expected / N⌋`. A cadence of 0 disables snapshots.
    pub fn crosses_boundary(&self, expected_version: u64, new_version: u64) -> bool {
        self.every > 0 && new_version / self.every > expected_version / self.every
    }

    pub(crate) fn should_persist(
        &self,
        expected_version: u64,
        new_version: u64,
        candidate: Option<&SnapshotCandidate>,
    ) -> bool {
        match candidate {
            Some(c) => c.force || self.crosses_boundary(expected_version, new_version),
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("version conflict on {stream}: expected {expected}, found {actual}")]
    VersionConflict {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

impl EventStoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }
}

/// Append-only, tenant-scoped event store with snapshots.
///
/// Streams are keyed by `(tenant_id, aggregate_type, aggregate_id)`. Versions
/// are 1-based, strictly increasing and gap-free within a stream.
///
/// `append`:
/// - fails with `VersionConflict` unless the stream is exactly at
///   `expected_version`; the check and the write are atomic
/// - assigns event `i` the version `expected_version + i + 1`
/// - writes all events or none
/// - persists the snapshot candidate when `force` is set or the batch crosses
///   a cadence boundary; a stored snapshot is only replaced by a strictly
///   newer one
///
/// `load`:
/// - returns events with `version > from_version`, upcast to current schemas
/// - returns `None` only when the stream is empty and `from_version` is 0
///
/// Conflicts are reported, never retried here.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
        snapshot: Option<SnapshotCandidate>,
    ) -> Result<AppendOutcome, EventStoreError>;

    async fn load(
        &self,
        stream: &StreamId,
        from_version: u64,
    ) -> Result<Option<LoadedStream>, EventStoreError>;

    async fn load_snapshot(&self, stream: &StreamId) -> Result<Option<StoredSnapshot>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
        snapshot: Option<SnapshotCandidate>,
    ) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(stream, events, expected_version, snapshot).await
    }

    async fn load(
        &self,
        stream: &StreamId,
        from_version: u64,
    ) -> Result<Option<LoadedStream>, EventStoreError> {
        (**self).load(stream, from_version).await
    }

    async fn load_snapshot(&self, stream: &StreamId) -> Result<Option<StoredSnapshot>, EventStoreError> {
        (**self).load_snapshot(stream).await
    }
}

/// Upcast a stored event to its current schema, recording the new version.
pub(crate) fn upcast_event(
    upcasters: &strata_core::EventUpcasters,
    mut event: Event,
) -> Result<Event, EventStoreError> {
    let from_version = event.schema_version();
    let (payload, version) = upcasters.upcast(&event.event_type, from_version, event.payload)?;
    event.payload = payload;
    if version != from_version {
        if let Some(meta) = event.metadata.as_mut() {
            meta.schema_version = Some(version);
        }
    }
    Ok(event)
}
