//! Command execution pipeline.
//!
//! The `CommandDispatcher` runs one command against one live aggregate:
//!
//! ```text
//! Command
//!   ↓
//! 1. Instance held by the caller (or rehydrated / created empty)
//!   ↓
//! 2. Command bus: validate, find handler, tenant check, decide events
//!   ↓
//! 3. Stamp metadata (causation, correlation, schema version)
//!   ↓
//! 4. Apply to a copy of the instance, offer its state as a snapshot
//!   ↓
//! 5. Append with `expected_version` = the instance version
//!   ↓
//! 6. Swap the copy in, publish to the event bus
//! ```
//!
//! A command the domain rejects (validation, unknown handler, tenant mismatch,
//! business rule) is answered with `CommandOutcome::Fail` and leaves the
//! instance untouched. Anything else (store failures, version conflicts,
//! corrupt history) is returned as a `PipelineError` for the caller's retry
//! policy to deal with.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use strata_core::{ApplyMode, DomainError, MessageId};
use strata_events::{
    AggregateInstance, Command, CommandBus, CommandOutcome, DispatchError, Event, EventBus,
    Metadata, NewEvent, Registry,
};

use crate::event_store::{EventStore, EventStoreError, SnapshotCandidate, StreamId, UncommittedEvent};
use crate::repository::AggregateRepository;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The command was rejected before anything was written.
    #[error(transparent)]
    Rejected(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Stored history or snapshot could not be applied.
    #[error("aggregate state error: {0}")]
    State(DomainError),

    #[error("no aggregate registered for type '{0}'")]
    UnknownAggregate(String),
}

impl PipelineError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::Rejected(e) if e.is_rejection())
    }

    pub fn is_business_rule_violation(&self) -> bool {
        matches!(self, PipelineError::Rejected(e) if e.is_business_rule_violation())
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            PipelineError::Rejected(e) => e.is_retriable(),
            PipelineError::Store(EventStoreError::VersionConflict { .. })
            | PipelineError::Store(EventStoreError::Unavailable(_)) => true,
            _ => false,
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, PipelineError::Store(e) if e.is_version_conflict())
    }

    /// The failed outcome reported for a rejection, `None` for runtime errors.
    pub fn to_outcome(&self) -> Option<CommandOutcome> {
        self.is_rejection()
            .then(|| CommandOutcome::fail(self, self.is_retriable()))
    }
}

/// The live state of one aggregate stream as held by its context.
#[derive(Debug, Clone)]
pub struct LoadedAggregate {
    pub stream: StreamId,
    /// `None` until the stream has at least one event.
    pub instance: Option<Box<dyn AggregateInstance>>,
    /// Successful mutations since the last persisted snapshot.
    pub since_snapshot: u64,
}

impl LoadedAggregate {
    pub fn version(&self) -> u64 {
        self.instance.as_ref().map(|i| i.version()).unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn EventStore>,
    repository: AggregateRepository,
    commands: CommandBus,
    events: EventBus,
    snapshot_every: u64,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn EventStore>) -> Self {
        Self {
            repository: AggregateRepository::new(store.clone(), registry.clone()),
            commands: CommandBus::from_registry(registry.clone()),
            events: EventBus::from_registry(registry.clone()),
            registry,
            store,
            snapshot_every: crate::config::DEFAULT_SNAPSHOT_EVERY,
        }
    }

    /// Force a snapshot after this many successful mutations. 0 disables it.
    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn repository(&self) -> &AggregateRepository {
        &self.repository
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Rehydrate `stream` into a context-owned aggregate.
    pub async fn load(&self, stream: &StreamId) -> Result<LoadedAggregate, PipelineError> {
        let rehydrated = self.repository.load(stream).await?;
        let (instance, since_snapshot) = match rehydrated {
            None => (None, 0),
            Some(r) => {
                let version = r.instance.version();
                let since = version - r.snapshot_version.unwrap_or(0).min(version);
                (Some(r.instance), since)
            }
        };
        Ok(LoadedAggregate {
            stream: stream.clone(),
            instance,
            since_snapshot,
        })
    }

    /// Resolve the stream a command targets.
    pub fn stream_for(&self, command: &Command) -> Result<StreamId, PipelineError> {
        let kind = self
            .registry
            .aggregate_for_command(&command.command_type)
            .ok_or_else(|| DispatchError::NoHandler(command.command_type.clone()))?;
        let id = kind.target_id(command).map_err(DispatchError::from)?;
        Ok(StreamId::new(command.tenant_id.clone(), kind.aggregate_type(), id))
    }

    /// Load the target aggregate, run `command`, and drop the instance.
    pub async fn dispatch(&self, command: &Command) -> Result<CommandOutcome, PipelineError> {
        let stream = match self.stream_for(command) {
            Ok(stream) => stream,
            Err(e) => return e.to_outcome().ok_or(e),
        };
        let mut aggregate = self.load(&stream).await?;
        self.execute(&mut aggregate, command).await
    }

    /// Run `command` against the held aggregate.
    ///
    /// On success the aggregate holds the new state. On any failure it is
    /// left exactly as it was.
    pub async fn execute(
        &self,
        aggregate: &mut LoadedAggregate,
        command: &Command,
    ) -> Result<CommandOutcome, PipelineError> {
        let empty;
        let current: &dyn AggregateInstance = match aggregate.instance.as_deref() {
            Some(instance) => instance,
            None => {
                let kind = self.repository.kind(&aggregate.stream.aggregate_type)?;
                empty = kind.empty(aggregate.stream.aggregate_id.clone());
                empty.as_ref()
            }
        };

        let decided = match self.commands.dispatch_with_aggregate(command, current) {
            Ok(events) => events,
            Err(e) => {
                let e = PipelineError::Rejected(e);
                return match e.to_outcome() {
                    Some(outcome) => {
                        info!(
                            workflow_id = %aggregate.stream,
                            command_id = %command.id,
                            command_type = %command.command_type,
                            error = %e,
                            "command rejected"
                        );
                        Ok(outcome)
                    }
                    None => Err(e),
                };
            }
        };

        if decided.is_empty() {
            debug!(workflow_id = %aggregate.stream, command_type = %command.command_type, "command produced no events");
            return Ok(CommandOutcome::Success { events: Vec::new() });
        }

        let base = Metadata::caused_by(&command.id, command.metadata.as_ref());
        let uncommitted = decided
            .into_iter()
            .map(|NewEvent { event_type, payload }| {
                let mut metadata = base.clone();
                metadata.schema_version = Some(self.registry.upcasters().current_version(&event_type));
                UncommittedEvent {
                    id: MessageId::generate(),
                    event_type,
                    payload,
                    metadata,
                }
            })
            .collect();

        let base = current.clone_box();
        let events = self.commit(aggregate, base, uncommitted).await?;
        Ok(CommandOutcome::Success { events })
    }

    /// Apply an externally produced event to the held aggregate.
    ///
    /// Events at or below the current version are skipped. An event further
    /// ahead than the next version triggers a reload first. Returns whether
    /// the event was appended.
    pub async fn apply_event(
        &self,
        aggregate: &mut LoadedAggregate,
        event: &Event,
    ) -> Result<bool, PipelineError> {
        if StreamId::of_event(event) != aggregate.stream {
            return Err(EventStoreError::TenantIsolation(format!(
                "event {} belongs to {}, not {}",
                event.id,
                StreamId::of_event(event),
                aggregate.stream
            ))
            .into());
        }

        if event.version <= aggregate.version() {
            debug!(workflow_id = %aggregate.stream, version = event.version, "event already applied");
            return Ok(false);
        }
        if event.version > aggregate.version() + 1 {
            *aggregate = self.load(&aggregate.stream).await?;
            if event.version <= aggregate.version() {
                return Ok(false);
            }
        }
        if event.version != aggregate.version() + 1 {
            return Err(EventStoreError::VersionConflict {
                stream: aggregate.stream.to_string(),
                expected: aggregate.version(),
                actual: event.version - 1,
            }
            .into());
        }

        let base = match aggregate.instance.as_ref() {
            Some(instance) => instance.clone_box(),
            None => self
                .repository
                .kind(&aggregate.stream.aggregate_type)?
                .empty(aggregate.stream.aggregate_id.clone()),
        };
        let uncommitted = UncommittedEvent {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            metadata: event.metadata.clone().unwrap_or_else(Metadata::now),
        };
        self.commit(aggregate, base, vec![uncommitted]).await?;
        Ok(true)
    }

    async fn commit(
        &self,
        aggregate: &mut LoadedAggregate,
        mut next: Box<dyn AggregateInstance>,
        uncommitted: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, PipelineError> {
        let expected = next.version();
        for (i, event) in uncommitted.iter().enumerate() {
            let provisional = event.clone().commit(&aggregate.stream, expected + i as u64 + 1);
            next.apply_event(&provisional, ApplyMode::New)
                .map_err(PipelineError::State)?;
        }

        let state = next.snapshot_state().map_err(PipelineError::State)?;
        let snapshot = SnapshotCandidate {
            state: state.state,
            schema_version: state.schema_version,
            force: self.snapshot_every > 0 && aggregate.since_snapshot + 1 >= self.snapshot_every,
        };

        let outcome = self
            .store
            .append(&aggregate.stream, uncommitted, expected, Some(snapshot))
            .await?;

        aggregate.instance = Some(next);
        aggregate.since_snapshot = match outcome.snapshot_version {
            Some(_) => 0,
            None => aggregate.since_snapshot + 1,
        };
        debug!(
            workflow_id = %aggregate.stream,
            version = aggregate.version(),
            events = outcome.events.len(),
            snapshot = outcome.snapshot_version.is_some(),
            "events committed"
        );

        let report = self.events.publish_batch(&outcome.events).await;
        if report.failed > 0 {
            warn!(
                workflow_id = %aggregate.stream,
                failed = report.failed,
                delivered = report.delivered,
                "event handlers failed after commit"
            );
        }
        Ok(outcome.events)
    }
}
