use async_trait::async_trait;
use tracing::debug;

use crate::command_dispatcher::{CommandDispatcher, LoadedAggregate};
use crate::event_store::StreamId;

use super::substrate::{Signal, SignalResult, Workflow, WorkflowError};

/// Context logic for one aggregate stream.
///
/// The aggregate is rehydrated on the first signal and then kept in memory
/// for the life of the context. Every successful command leaves it exactly at
/// the stored stream head; a failed one leaves it untouched.
pub struct AggregateWorkflow {
    dispatcher: CommandDispatcher,
    stream: StreamId,
    loaded: Option<LoadedAggregate>,
}

impl AggregateWorkflow {
    pub fn new(dispatcher: CommandDispatcher, stream: StreamId) -> Self {
        Self {
            dispatcher,
            stream,
            loaded: None,
        }
    }

    async fn aggregate(&mut self) -> Result<LoadedAggregate, WorkflowError> {
        match self.loaded.take() {
            Some(loaded) => Ok(loaded),
            None => {
                debug!(workflow_id = %self.stream, "rehydrating aggregate");
                Ok(self.dispatcher.load(&self.stream).await?)
            }
        }
    }
}

#[async_trait]
impl Workflow for AggregateWorkflow {
    async fn handle(&mut self, signal: &Signal) -> Result<SignalResult, WorkflowError> {
        let mut aggregate = self.aggregate().await?;
        let result = match signal {
            Signal::Command(command) => self
                .dispatcher
                .execute(&mut aggregate, command)
                .await
                .map(SignalResult::Outcome),
            Signal::Event(event) => self
                .dispatcher
                .apply_event(&mut aggregate, event)
                .await
                .map(|applied| SignalResult::EventApplied { applied }),
        };
        // `execute` and `apply_event` leave the aggregate consistent either way.
        self.loaded = Some(aggregate);
        Ok(result?)
    }

    fn reset(&mut self) {
        self.loaded = None;
    }
}
