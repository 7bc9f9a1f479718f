use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use strata_core::{AggregateId, MessageId, TenantId};
use strata_events::{
    Command, ConditionInput, Event, PlanContext, Registry, SagaDefinition, SagaError, SagaInput,
};

use crate::command_log::{CommandLog, CommandLogError};
use crate::event_store::{EventStore, StreamId};

use super::substrate::{Signal, SignalResult, Workflow, WorkflowError};

/// Plan context handed to a saga for one input.
///
/// Ids are derived from the input id, so planning the same input twice yields
/// the same command ids and the command log drops the repeats.
struct SagaPlanContext<'a> {
    prefix: String,
    issued: AtomicU64,
    store: &'a dyn EventStore,
    registry: &'a Registry,
}

impl<'a> SagaPlanContext<'a> {
    fn new(saga: &str, input: &SagaInput, store: &'a dyn EventStore, registry: &'a Registry) -> Self {
        Self {
            prefix: format!("{}-{saga}", input.id()),
            issued: AtomicU64::new(0),
            store,
            registry,
        }
    }
}

#[async_trait]
impl PlanContext for SagaPlanContext<'_> {
    fn next_id(&self) -> MessageId {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        MessageId::from(format!("{}-{n}", self.prefix))
    }

    async fn read_events(
        &self,
        tenant_id: &TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<Event>, SagaError> {
        let stream = StreamId::new(tenant_id.clone(), aggregate_type, aggregate_id.clone());
        let loaded = self
            .store
            .load(&stream, 0)
            .await
            .map_err(|e| SagaError::ReadFailed(e.to_string()))?;
        Ok(loaded.map(|l| l.events).unwrap_or_default())
    }

    fn evaluate_condition(&self, name: &str, input: &ConditionInput) -> Result<bool, SagaError> {
        let condition = self
            .registry
            .condition(name)
            .ok_or_else(|| SagaError::UnknownCondition(name.to_string()))?;
        Ok(condition.as_ref()(input))
    }
}

/// Context logic for one saga instance.
///
/// Each signal is planned, the immediate commands are written to the command
/// log, then each delayed command is written after its delay. Signals that
/// arrive meanwhile wait in the mailbox. A saga whose planning fails is
/// logged and skipped; it never fails the signal. Reading events can fail
/// transiently and is left to the substrate's retry.
pub struct SagaWorkflow {
    saga: Arc<dyn SagaDefinition>,
    context_id: String,
    registry: Arc<Registry>,
    store: Arc<dyn EventStore>,
    commands: Arc<dyn CommandLog>,
}

impl SagaWorkflow {
    pub fn new(
        saga: Arc<dyn SagaDefinition>,
        context_id: impl Into<String>,
        registry: Arc<Registry>,
        store: Arc<dyn EventStore>,
        commands: Arc<dyn CommandLog>,
    ) -> Self {
        Self {
            saga,
            context_id: context_id.into(),
            registry,
            store,
            commands,
        }
    }

    async fn issue(&self, command: Command) -> Result<(), WorkflowError> {
        let id = command.id.clone();
        let command_type = command.command_type.clone();
        match self.commands.insert(command).await {
            Ok(()) => {
                debug!(saga_id = %self.context_id, command_id = %id, command_type, "saga issued command");
                Ok(())
            }
            Err(CommandLogError::AlreadyExists(_)) => {
                debug!(saga_id = %self.context_id, command_id = %id, "saga command already issued");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Workflow for SagaWorkflow {
    async fn handle(&mut self, signal: &Signal) -> Result<SignalResult, WorkflowError> {
        let input = SagaInput::from(signal.clone());
        let ctx = SagaPlanContext::new(
            self.saga.name(),
            &input,
            self.store.as_ref(),
            self.registry.as_ref(),
        );

        let plan = match self.saga.plan(&input, &ctx).await {
            Ok(plan) => plan,
            Err(e @ SagaError::ReadFailed(_)) => return Err(e.into()),
            Err(e) => {
                warn!(
                    saga_id = %self.context_id,
                    message_id = %input.id(),
                    message_type = input.message_type(),
                    error = %e,
                    "saga planning failed; skipping input"
                );
                return Ok(SignalResult::Planned {
                    immediate: 0,
                    delayed: 0,
                });
            }
        };

        let immediate = plan.commands.len();
        let delayed = plan.delays.len();
        if let Some(trace) = plan.trace_context.as_deref() {
            debug!(saga_id = %self.context_id, trace_context = trace, "plan trace context");
        }
        info!(
            saga_id = %self.context_id,
            message_type = input.message_type(),
            immediate,
            delayed,
            "saga planned"
        );

        for command in plan.commands {
            self.issue(command).await?;
        }
        for step in plan.delays {
            tokio::time::sleep(step.delay).await;
            self.issue(step.command).await?;
        }

        Ok(SignalResult::Planned { immediate, delayed })
    }

    // Nothing is cached between signals.
    fn reset(&mut self) {}
}
