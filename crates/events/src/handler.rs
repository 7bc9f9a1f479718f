//! Handler contracts for the command and event buses.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use strata_core::DomainResult;

use crate::instance::{AggregateInstance, AggregateKind, NewEvent};
use crate::message::{Command, Event};

/// Decides events for a command against an already loaded aggregate.
///
/// Handlers never load or persist; the caller owns the aggregate instance and
/// applies and stores whatever is returned.
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    fn aggregate_type(&self) -> &'static str;

    /// Command type tags routed to this handler.
    fn command_types(&self) -> &'static [&'static str];

    fn supports_command(&self, command_type: &str) -> bool {
        self.command_types().contains(&command_type)
    }

    fn handle_with_aggregate(
        &self,
        command: &Command,
        aggregate: &dyn AggregateInstance,
    ) -> DomainResult<Vec<NewEvent>>;
}

/// Command handler that delegates to the aggregate's own `handle`.
pub struct AggregateCommandHandler {
    name: String,
    kind: Arc<dyn AggregateKind>,
}

impl AggregateCommandHandler {
    pub fn new(kind: Arc<dyn AggregateKind>) -> Self {
        Self {
            name: format!("{}.commands", kind.aggregate_type()),
            kind,
        }
    }
}

impl CommandHandler for AggregateCommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn aggregate_type(&self) -> &'static str {
        self.kind.aggregate_type()
    }

    fn command_types(&self) -> &'static [&'static str] {
        self.kind.command_types()
    }

    fn handle_with_aggregate(
        &self,
        command: &Command,
        aggregate: &dyn AggregateInstance,
    ) -> DomainResult<Vec<NewEvent>> {
        aggregate.handle_command(command)
    }
}

#[derive(Debug, Error)]
#[error("event handler '{handler}' failed on {event_type}: {message}")]
pub struct EventHandlerError {
    pub handler: String,
    pub event_type: String,
    pub message: String,
}

impl EventHandlerError {
    pub fn new(handler: impl Into<String>, event: &Event, message: impl ToString) -> Self {
        Self {
            handler: handler.into(),
            event_type: event.event_type.clone(),
            message: message.to_string(),
        }
    }
}

/// Reacts to published events (projections, notifications).
///
/// Handlers must be idempotent: the same event may be delivered again after a
/// retry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supports_event(&self, event: &Event) -> bool;

    async fn handle(&self, event: &Event) -> Result<(), EventHandlerError>;
}
