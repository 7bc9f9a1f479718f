//! Durable execution boundary.
//!
//! A substrate runs long-lived contexts keyed by a unique id. The router only
//! ever asks it to "signal this context, starting it first if needed" and may
//! then wait for the signal's result. What runs inside a context is a
//! [`Workflow`] built by a [`WorkflowFactory`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use strata_core::{MessageId, TenantId};
use strata_events::{Command, CommandOutcome, Event, SagaError, SagaInput};

use crate::command_dispatcher::PipelineError;
use crate::command_log::CommandLogError;
use crate::event_store::StreamId;

/// What a new context is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartArgs {
    Aggregate { stream: StreamId },
    Saga { saga: String, tenant_id: TenantId },
}

/// A message delivered to a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Command(Command),
    Event(Event),
}

impl Signal {
    pub fn id(&self) -> &MessageId {
        match self {
            Signal::Command(c) => &c.id,
            Signal::Event(e) => &e.id,
        }
    }

    /// Signal name at the substrate boundary.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Command(_) => "command",
            Signal::Event(_) => "event",
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            Signal::Command(c) => &c.command_type,
            Signal::Event(e) => &e.event_type,
        }
    }
}

impl From<Signal> for SagaInput {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Command(c) => SagaInput::Command(c),
            Signal::Event(e) => SagaInput::Event(e),
        }
    }
}

/// What a context answers to one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Outcome(CommandOutcome),
    EventApplied { applied: bool },
    Planned { immediate: usize, delayed: usize },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    CommandLog(#[from] CommandLogError),
}

impl WorkflowError {
    /// Whether another attempt may succeed. Missing registrations and corrupt
    /// history fail the same way every time.
    pub fn is_retriable(&self) -> bool {
        match self {
            WorkflowError::Pipeline(e) => e.is_retriable(),
            WorkflowError::Saga(e) => matches!(e, SagaError::ReadFailed(_)),
            WorkflowError::CommandLog(e) => matches!(e, CommandLogError::Storage(_)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("cannot start context {context_id}: {message}")]
    Start { context_id: String, message: String },

    #[error("context {context_id} failed after {attempts} attempt(s): {message}")]
    Failed {
        context_id: String,
        attempts: u32,
        message: String,
    },

    #[error("context {0} stopped before replying")]
    ContextGone(String),
}

/// Logic running inside one context. Signals are handled one at a time.
#[async_trait]
pub trait Workflow: Send {
    async fn handle(&mut self, signal: &Signal) -> Result<SignalResult, WorkflowError>;

    /// Drop cached state; the next signal starts from storage again.
    fn reset(&mut self);
}

pub trait WorkflowFactory: Send + Sync {
    fn create(&self, context_id: &str, start: &StartArgs) -> Result<Box<dyn Workflow>, SubstrateError>;
}

/// Pending result of one signal.
#[derive(Debug)]
pub struct ContextHandle {
    context_id: String,
    reply: oneshot::Receiver<Result<SignalResult, SubstrateError>>,
}

impl ContextHandle {
    pub(crate) fn new(
        context_id: impl Into<String>,
        reply: oneshot::Receiver<Result<SignalResult, SubstrateError>>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            reply,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Wait for the context to finish handling the signal.
    pub async fn result(self) -> Result<SignalResult, SubstrateError> {
        self.reply
            .await
            .map_err(|_| SubstrateError::ContextGone(self.context_id))?
    }
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Deliver `signal` to `context_id`, starting the context with `start`
    /// if it is not running.
    async fn signal_or_start(
        &self,
        context_id: &str,
        task_queue: &str,
        start: StartArgs,
        signal: Signal,
    ) -> Result<ContextHandle, SubstrateError>;
}
