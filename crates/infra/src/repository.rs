//! Aggregate rehydration protocol.
//!
//! 1. Load the stream's snapshot; if present, restore from it (upcasting its
//!    state) and replay the events recorded after it.
//! 2. Otherwise replay the whole stream.
//!
//! A snapshot that cannot be restored is logged and ignored in favour of a
//! full replay.

use std::sync::Arc;

use tracing::{debug, warn};

use strata_core::ApplyMode;
use strata_events::{AggregateInstance, AggregateKind, Registry};

use crate::command_dispatcher::PipelineError;
use crate::event_store::{EventStore, StreamId};

/// A rehydrated instance and the version of the snapshot it started from.
#[derive(Debug)]
pub struct Rehydrated {
    pub instance: Box<dyn AggregateInstance>,
    pub snapshot_version: Option<u64>,
}

#[derive(Clone)]
pub struct AggregateRepository {
    store: Arc<dyn EventStore>,
    registry: Arc<Registry>,
}

impl AggregateRepository {
    pub fn new(store: Arc<dyn EventStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn kind(&self, aggregate_type: &str) -> Result<&Arc<dyn AggregateKind>, PipelineError> {
        self.registry
            .aggregate(aggregate_type)
            .ok_or_else(|| PipelineError::UnknownAggregate(aggregate_type.to_string()))
    }

    /// Rebuild the current state of `stream`, or `None` if it has no events.
    pub async fn load(&self, stream: &StreamId) -> Result<Option<Rehydrated>, PipelineError> {
        let kind = self.kind(&stream.aggregate_type)?;

        if let Some(snapshot) = self.store.load_snapshot(stream).await? {
            match kind.restore(
                stream.aggregate_id.clone(),
                snapshot.version,
                snapshot.state,
                snapshot.schema_version,
            ) {
                Ok(mut instance) => {
                    let tail = self.store.load(stream, snapshot.version).await?;
                    let replayed = tail.as_ref().map(|t| t.events.len()).unwrap_or(0);
                    for event in tail.map(|t| t.events).unwrap_or_default() {
                        instance
                            .apply_event(&event, ApplyMode::Replay { version: event.version })
                            .map_err(PipelineError::State)?;
                    }
                    debug!(
                        stream = %stream,
                        snapshot_version = snapshot.version,
                        replayed,
                        "rehydrated from snapshot"
                    );
                    return Ok(Some(Rehydrated {
                        instance,
                        snapshot_version: Some(snapshot.version),
                    }));
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "snapshot unusable; replaying full stream");
                }
            }
        }

        match self.store.load(stream, 0).await? {
            None => Ok(None),
            Some(loaded) => {
                let instance = kind.rehydrate(&loaded.events).map_err(PipelineError::State)?;
                debug!(stream = %stream, version = loaded.version, "rehydrated from events");
                Ok(Some(Rehydrated {
                    instance,
                    snapshot_version: None,
                }))
            }
        }
    }
}
