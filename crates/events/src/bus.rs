//! Command and event buses.
//!
//! - [`CommandBus`]: validates a command and runs its single handler against an
//!   aggregate the caller already loaded. No IO, no persistence.
//! - [`EventBus`]: fans published events out to the registered event
//!   handlers.
//!
//! Both are built from an `Arc<Registry>` and hold no mutable state.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use strata_core::DomainError;

use crate::handler::EventHandler;
use crate::instance::{AggregateInstance, NewEvent};
use crate::message::{Command, Event};
use crate::registry::Registry;
use crate::schema::{FieldError, ValidationOutcome};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{command_type} payload invalid: {}", format_fields(.fields))]
    Validation {
        command_type: String,
        fields: Vec<FieldError>,
    },

    /// The handler decided an event that breaks its registered schema.
    #[error("{event_type} event invalid: {}", format_fields(.fields))]
    InvalidEvent {
        event_type: String,
        fields: Vec<FieldError>,
    },

    #[error("no handler registered for command type '{0}'")]
    NoHandler(String),

    #[error("payload tenant '{payload_tenant}' does not match command tenant '{command_tenant}'")]
    TenantMismatch {
        command_tenant: String,
        payload_tenant: String,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl DispatchError {
    pub fn is_business_rule_violation(&self) -> bool {
        matches!(self, DispatchError::Domain(e) if e.is_business_rule_violation())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, DispatchError::Domain(e) if e.is_retriable())
    }

    /// Rejections that describe the command itself, as opposed to a failure
    /// of the runtime. They are reported to the caller, never retried.
    pub fn is_rejection(&self) -> bool {
        match self {
            DispatchError::Validation { .. }
            | DispatchError::InvalidEvent { .. }
            | DispatchError::NoHandler(_)
            | DispatchError::TenantMismatch { .. } => true,
            DispatchError::Domain(e) => !matches!(e, DomainError::Upcast(_)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CommandBus {
    registry: Arc<Registry>,
}

impl CommandBus {
    pub fn from_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run `command` against `aggregate` and return the decided events.
    ///
    /// Steps, in order: payload validation, handler lookup, tenant check,
    /// handler invocation, event schema check. The aggregate is not mutated.
    pub fn dispatch_with_aggregate(
        &self,
        command: &Command,
        aggregate: &dyn AggregateInstance,
    ) -> Result<Vec<NewEvent>, DispatchError> {
        self.validate(command)?;

        let handler = self
            .registry
            .command_handler(&command.command_type)
            .ok_or_else(|| DispatchError::NoHandler(command.command_type.clone()))?;

        if let Some(payload_tenant) = command.payload_tenant() {
            if payload_tenant != command.tenant_id.as_str() {
                return Err(DispatchError::TenantMismatch {
                    command_tenant: command.tenant_id.to_string(),
                    payload_tenant: payload_tenant.to_string(),
                });
            }
        }

        let events = handler.handle_with_aggregate(command, aggregate)?;
        for event in &events {
            self.validate_event(event)?;
        }
        debug!(
            command_type = %command.command_type,
            aggregate_id = %aggregate.id(),
            handler = handler.name(),
            events = events.len(),
            "command handled"
        );
        Ok(events)
    }

    /// Validate the payload against the registered schema, if any.
    pub fn validate(&self, command: &Command) -> Result<(), DispatchError> {
        let validator = self
            .registry
            .command_type(&command.command_type)
            .and_then(|info| info.validator.as_ref());

        let Some(validator) = validator else {
            warn!(command_type = %command.command_type, "no payload schema registered; skipping validation");
            return Ok(());
        };

        match validator(&command.payload) {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Invalid(fields) => Err(DispatchError::Validation {
                command_type: command.command_type.clone(),
                fields,
            }),
        }
    }

    /// Check a decided event against its registered schema, if any.
    pub fn validate_event(&self, event: &NewEvent) -> Result<(), DispatchError> {
        let Some(validator) = self
            .registry
            .event_type(&event.event_type)
            .and_then(|info| info.validator.as_ref())
        else {
            return Ok(());
        };

        match validator(&event.payload) {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Invalid(fields) => Err(DispatchError::InvalidEvent {
                event_type: event.event_type.clone(),
                fields,
            }),
        }
    }
}

/// Outcome of publishing a batch. Failed deliveries are logged and counted,
/// never propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn from_registry(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Publish events in batch order.
    ///
    /// All handlers interested in one event run concurrently and are awaited
    /// before the next event is published.
    pub async fn publish_batch(&self, events: &[Event]) -> PublishReport {
        let mut report = PublishReport::default();
        for event in events {
            let handlers: Vec<&Arc<dyn EventHandler>> = self
                .registry
                .event_handlers()
                .iter()
                .filter(|h| h.supports_event(event))
                .collect();
            if handlers.is_empty() {
                continue;
            }

            let results = join_all(handlers.iter().map(|h| h.handle(event))).await;
            for (handler, result) in handlers.iter().zip(results) {
                match result {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            handler = handler.name(),
                            event_type = %event.event_type,
                            aggregate_id = %event.aggregate_id,
                            version = event.version,
                            error = %e,
                            "event handler failed"
                        );
                    }
                }
            }
        }
        report
    }
}
