//! Aggregate contract for event-sourced domain models.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::AggregateId;
use crate::upcast::UpcastChain;

/// How an event is being applied to an aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyMode {
    /// A freshly decided event: the aggregate version advances by one.
    New,
    /// A stored event being replayed: the aggregate version is set to the
    /// event's recorded version so replays never double-count.
    Replay { version: u64 },
}

/// A typed event together with its position in the aggregate stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded<E> {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub event: E,
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `mutate(&mut self, event)` evolves domain state;
///   version bookkeeping is done by the provided [`Aggregate::apply`].
/// - **Snapshots**: `extract_snapshot_state` / `apply_snapshot_state` move the
///   derived state only. Id and version travel in the snapshot envelope.
///
/// Commands and events are tagged enums (`#[serde(tag = "type", content =
/// "payload")]`), so the wire type tag selects the variant at decode time and
/// `handle`/`mutate` are exhaustive matches.
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: Clone + Send + Sync + Sized + 'static {
    /// Stable aggregate type name (e.g. `"order"`). Part of the workflow id.
    const AGGREGATE_TYPE: &'static str;

    /// Schema version written alongside new snapshots.
    ///
    /// Must equal `snapshot_upcasters().current_version()`.
    const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

    type Command: DeserializeOwned + Clone + core::fmt::Debug + Send + Sync;
    type Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync;
    type State: Serialize + DeserializeOwned;

    /// Command type tags this aggregate handles (the routing table entries).
    fn command_types() -> &'static [&'static str];

    /// Event type tags this aggregate emits.
    fn event_types() -> &'static [&'static str];

    /// A not-yet-created instance at version 0.
    fn empty(id: AggregateId) -> Self;

    fn id(&self) -> &AggregateId;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Extract the target aggregate id from a command.
    fn target_id(command: &Self::Command) -> DomainResult<AggregateId>;

    /// Decide which events to emit given the current state and a command.
    ///
    /// Must not mutate state.
    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>>;

    /// Evolve domain state from a single event. Must be deterministic.
    fn mutate(&mut self, event: &Self::Event);

    fn extract_snapshot_state(&self) -> Self::State;

    fn apply_snapshot_state(&mut self, state: Self::State);

    /// Transforms for older snapshot schemas. Identity by default.
    fn snapshot_upcasters() -> UpcastChain {
        UpcastChain::identity(Self::SNAPSHOT_SCHEMA_VERSION)
    }

    /// Apply an event, keeping `version` consistent with the stream.
    fn apply(&mut self, event: &Self::Event, mode: ApplyMode) {
        self.mutate(event);
        match mode {
            ApplyMode::New => {
                let next = self.version() + 1;
                self.set_version(next);
            }
            ApplyMode::Replay { version } => self.set_version(version),
        }
    }

    /// Build a brand-new instance for the aggregate a command targets.
    fn create(command: &Self::Command) -> DomainResult<Self> {
        Ok(Self::empty(Self::target_id(command)?))
    }

    /// Rebuild an instance by replaying its full history.
    fn rehydrate(events: Vec<Recorded<Self::Event>>) -> DomainResult<Self> {
        let first = events.first().ok_or(DomainError::EmptyStream)?;
        let mut aggregate = Self::empty(first.aggregate_id.clone());
        aggregate.replay(events);
        Ok(aggregate)
    }

    /// Replay stored events on top of the current state, in order.
    fn replay(&mut self, events: Vec<Recorded<Self::Event>>) {
        for recorded in events {
            self.apply(
                &recorded.event,
                ApplyMode::Replay {
                    version: recorded.version,
                },
            );
        }
    }

    /// Restore an instance from a snapshot written at `schema_version`.
    fn restore(
        id: AggregateId,
        version: u64,
        raw: JsonValue,
        schema_version: u32,
    ) -> DomainResult<Self> {
        let upcast = Self::snapshot_upcasters().upcast(Self::AGGREGATE_TYPE, raw, schema_version)?;
        let state: Self::State = serde_json::from_value(upcast).map_err(|e| {
            DomainError::malformed(format!("{} snapshot: {e}", Self::AGGREGATE_TYPE))
        })?;
        let mut aggregate = Self::empty(id);
        aggregate.apply_snapshot_state(state);
        aggregate.set_version(version);
        Ok(aggregate)
    }
}
