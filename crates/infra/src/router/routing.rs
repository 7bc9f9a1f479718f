use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use strata_core::AggregateId;
use strata_events::{Command, CommandOutcome, Event, Registry, SagaDefinition, SagaInput};

use crate::config::DEFAULT_TASK_QUEUE;
use crate::event_store::StreamId;

use super::substrate::{Signal, SignalResult, StartArgs, Substrate, SubstrateError};

#[derive(Debug, Error)]
pub enum RouteError {
    /// Neither an aggregate nor a saga accepts the command.
    #[error("no aggregate or saga accepts '{0}'")]
    NoRoute(String),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// What routing one message did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Result of the aggregate step of a command.
    pub outcome: Option<CommandOutcome>,
    /// Whether the owning aggregate appended a routed event.
    pub applied: Option<bool>,
    /// Saga contexts signaled, in order.
    pub sagas: Vec<String>,
}

/// Maps commands and events onto substrate contexts.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    substrate: Arc<dyn Substrate>,
    task_queue: String,
}

impl Router {
    pub fn new(registry: Arc<Registry>, substrate: Arc<dyn Substrate>) -> Self {
        Self {
            registry,
            substrate,
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// The aggregate stream a command targets.
    ///
    /// Resolution order: the command type's route hint, then explicit
    /// `aggregateType`/`aggregateId` payload fields, then the aggregate that
    /// handles the command type. `Err` carries why a command that belongs to
    /// an aggregate names no instance of it, or names an aggregate type that
    /// is not registered.
    pub fn aggregate_route(&self, command: &Command) -> Result<Option<StreamId>, String> {
        let stream = |aggregate_type: &str, id: AggregateId| {
            StreamId::new(command.tenant_id.clone(), aggregate_type, id)
        };

        let hint = self
            .registry
            .command_type(&command.command_type)
            .and_then(|info| info.route_hint.as_ref());
        if let Some(hint) = hint {
            return match hint.extract(&command.payload) {
                Some(id) => Ok(Some(stream(&hint.aggregate_type, id))),
                None => Err(format!(
                    "command '{}' names no '{}' instance",
                    command.command_type, hint.aggregate_type
                )),
            };
        }

        let explicit = |field: &str| {
            command
                .payload
                .get(field)
                .and_then(JsonValue::as_str)
                .filter(|v| !v.is_empty())
        };
        if let (Some(aggregate_type), Some(id)) = (explicit("aggregateType"), explicit("aggregateId")) {
            if self.registry.aggregate(aggregate_type).is_none() {
                return Err(format!("no aggregate registered for type '{aggregate_type}'"));
            }
            return Ok(Some(stream(aggregate_type, AggregateId::from(id))));
        }

        match self.registry.aggregate_for_command(&command.command_type) {
            Some(kind) => kind
                .target_id(command)
                .map(|id| Some(stream(kind.aggregate_type(), id)))
                .map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    /// Key under which commands must be routed one after another: the
    /// aggregate context the command targets, else the first saga context
    /// interested in it, else the command itself.
    pub fn ordering_key(&self, command: &Command) -> String {
        if let Ok(Some(stream)) = self.aggregate_route(command) {
            return stream.to_string();
        }
        let input = SagaInput::Command(command.clone());
        self.interested(&input)
            .into_iter()
            .next()
            .map(|(_, context_id)| context_id)
            .unwrap_or_else(|| command.id.to_string())
    }

    /// Route one command.
    ///
    /// An aggregate command is handled by its aggregate context first and
    /// its result awaited. Sagas interested in the command are signaled
    /// afterwards whatever that result was, then sagas interested in the
    /// events it produced. Saga results are not awaited.
    #[instrument(
        skip_all,
        fields(
            command_id = %command.id,
            command_type = %command.command_type,
            tenant_id = %command.tenant_id,
        )
    )]
    pub async fn schedule(&self, command: &Command) -> Result<RouteReport, RouteError> {
        let mut report = RouteReport::default();
        let mut aggregate_failure = None;
        let mut routed = false;

        match self.aggregate_route(command) {
            Ok(Some(stream)) => {
                routed = true;
                match self.signal_aggregate(stream, Signal::Command(command.clone())).await {
                    Ok(SignalResult::Outcome(outcome)) => report.outcome = Some(outcome),
                    Ok(other) => {
                        aggregate_failure = Some(unexpected_reply(command.id.as_str(), &other));
                    }
                    Err(e) => aggregate_failure = Some(e),
                }
            }
            Ok(None) => {}
            Err(message) => {
                routed = true;
                info!(error = %message, "command cannot be routed to its aggregate");
                report.outcome = Some(CommandOutcome::fail(message, false));
            }
        }

        report.sagas = self.signal_sagas(&SagaInput::Command(command.clone())).await;
        let produced = report
            .outcome
            .as_ref()
            .map(|o| o.events().to_vec())
            .unwrap_or_default();
        for event in produced {
            let signaled = self.signal_sagas(&SagaInput::Event(event)).await;
            report.sagas.extend(signaled);
        }

        if let Some(e) = aggregate_failure {
            return Err(e.into());
        }
        if !routed && report.sagas.is_empty() {
            warn!("command matches no aggregate and no saga");
            return Err(RouteError::NoRoute(command.command_type.clone()));
        }
        Ok(report)
    }

    /// Route one event to its owning aggregate and every interested saga.
    ///
    /// Both are signaled before anything is awaited; only the aggregate's
    /// result is waited for.
    #[instrument(
        skip_all,
        fields(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
        )
    )]
    pub async fn route_event(&self, event: &Event) -> Result<RouteReport, RouteError> {
        let owned = !event.aggregate_id.as_str().is_empty()
            && self.registry.aggregate(&event.aggregate_type).is_some();
        let handle = if owned {
            let stream = StreamId::of_event(event);
            let context_id = stream.to_string();
            Some(
                self.substrate
                    .signal_or_start(
                        &context_id,
                        &self.task_queue,
                        StartArgs::Aggregate { stream },
                        Signal::Event(event.clone()),
                    )
                    .await,
            )
        } else {
            None
        };

        let sagas = self.signal_sagas(&SagaInput::Event(event.clone())).await;

        let applied = match handle {
            None => None,
            Some(handle) => match handle?.result().await? {
                SignalResult::EventApplied { applied } => Some(applied),
                other => return Err(unexpected_reply(event.id.as_str(), &other).into()),
            },
        };

        if applied.is_none() && sagas.is_empty() {
            return Err(RouteError::NoRoute(event.event_type.clone()));
        }
        Ok(RouteReport {
            outcome: None,
            applied,
            sagas,
        })
    }

    async fn signal_aggregate(&self, stream: StreamId, signal: Signal) -> Result<SignalResult, SubstrateError> {
        let context_id = stream.to_string();
        debug!(workflow_id = %context_id, signal = signal.name(), "signaling aggregate");
        let handle = self
            .substrate
            .signal_or_start(
                &context_id,
                &self.task_queue,
                StartArgs::Aggregate { stream },
                signal,
            )
            .await?;
        handle.result().await
    }

    fn interested(&self, input: &SagaInput) -> Vec<(Arc<dyn SagaDefinition>, String)> {
        self.registry
            .sagas()
            .filter_map(|saga| saga.id_for(input).map(|id| (saga.clone(), id)))
            .collect()
    }

    /// Signal every saga whose `id_for` matches; returns the signaled ids.
    async fn signal_sagas(&self, input: &SagaInput) -> Vec<String> {
        let mut signaled = Vec::new();
        for (saga, context_id) in self.interested(input) {
            let task_queue = saga.task_queue().unwrap_or(&self.task_queue);
            let start = StartArgs::Saga {
                saga: saga.name().to_string(),
                tenant_id: input.tenant_id().clone(),
            };
            let signal = match input {
                SagaInput::Command(c) => Signal::Command(c.clone()),
                SagaInput::Event(e) => Signal::Event(e.clone()),
            };
            match self
                .substrate
                .signal_or_start(&context_id, task_queue, start, signal)
                .await
            {
                Ok(handle) => {
                    debug!(saga = saga.name(), saga_id = %context_id, "signaled saga");
                    tokio::spawn(async move {
                        let context_id = handle.context_id().to_string();
                        match handle.result().await {
                            Ok(result) => debug!(saga_id = %context_id, ?result, "saga signal handled"),
                            Err(e) => warn!(saga_id = %context_id, error = %e, "saga signal failed"),
                        }
                    });
                    signaled.push(context_id);
                }
                Err(e) => {
                    warn!(saga = saga.name(), saga_id = %context_id, error = %e, "cannot signal saga");
                }
            }
        }
        signaled
    }
}

fn unexpected_reply(message_id: &str, reply: &SignalResult) -> SubstrateError {
    SubstrateError::Failed {
        context_id: message_id.to_string(),
        attempts: 1,
        message: format!("unexpected reply {reply:?}"),
    }
}
