//! Process-wide domain catalog.
//!
//! A [`Registry`] is built once at startup from explicit
//! [`DomainModule::register`] calls, then shared read-only (`Arc<Registry>`).
//! Every key (aggregate type, command type, event type, saga name, handler
//! name, condition name, domain roles) can be registered once; a second
//! registration is a startup error.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use strata_core::{Aggregate, AggregateId, EventUpcasters, UpcastChain, UpcastError};

use crate::handler::{AggregateCommandHandler, CommandHandler, EventHandler};
use crate::instance::{AggregateKind, KindOf};
use crate::policy::{AccessModel, Condition};
use crate::saga::SagaDefinition;
use crate::schema::{ObjectSchema, PayloadValidator};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} '{key}' registered twice")]
    Duplicate { kind: &'static str, key: String },

    #[error("domain module '{module}' failed to register: {message}")]
    Module { module: String, message: String },
}

impl RegistryError {
    fn duplicate(kind: &'static str, key: impl Into<String>) -> Self {
        Self::Duplicate {
            kind,
            key: key.into(),
        }
    }
}

/// Routing hint for commands whose target aggregate is not implied by a
/// registered handler (or must be overridden).
#[derive(Clone)]
pub struct RouteHint {
    pub aggregate_type: String,
    pub extract_id: Arc<dyn Fn(&JsonValue) -> Option<AggregateId> + Send + Sync>,
}

impl RouteHint {
    pub fn new(
        aggregate_type: impl Into<String>,
        extract_id: impl Fn(&JsonValue) -> Option<AggregateId> + Send + Sync + 'static,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            extract_id: Arc::new(extract_id),
        }
    }

    /// Route to `aggregate_type` using a string payload field as the id.
    pub fn field(aggregate_type: impl Into<String>, field: &'static str) -> Self {
        Self::new(aggregate_type, move |payload| {
            payload
                .get(field)
                .and_then(JsonValue::as_str)
                .filter(|id| !id.is_empty())
                .map(AggregateId::from)
        })
    }

    pub fn extract(&self, payload: &JsonValue) -> Option<AggregateId> {
        (self.extract_id)(payload)
    }
}

impl fmt::Debug for RouteHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteHint")
            .field("aggregate_type", &self.aggregate_type)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct CommandTypeInfo {
    pub name: String,
    pub validator: Option<PayloadValidator>,
    pub route_hint: Option<RouteHint>,
}

impl CommandTypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validator: None,
            route_hint: None,
        }
    }

    pub fn with_schema(self, schema: ObjectSchema) -> Self {
        self.with_validator(schema.into_validator())
    }

    pub fn with_validator(mut self, validator: PayloadValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_route(mut self, hint: RouteHint) -> Self {
        self.route_hint = Some(hint);
        self
    }
}

impl fmt::Debug for CommandTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTypeInfo")
            .field("name", &self.name)
            .field("has_validator", &self.validator.is_some())
            .field("route_hint", &self.route_hint)
            .finish()
    }
}

#[derive(Clone)]
pub struct EventTypeInfo {
    pub name: String,
    pub validator: Option<PayloadValidator>,
}

impl EventTypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validator: None,
        }
    }

    pub fn with_schema(mut self, schema: ObjectSchema) -> Self {
        self.validator = Some(schema.into_validator());
        self
    }
}

impl fmt::Debug for EventTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeInfo")
            .field("name", &self.name)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// A unit of domain wiring. Modules register everything they contribute.
pub trait DomainModule: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registry: &mut Registry) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct Registry {
    aggregates: BTreeMap<String, Arc<dyn AggregateKind>>,
    command_handlers: HashMap<String, Arc<dyn CommandHandler>>,
    sagas: BTreeMap<String, Arc<dyn SagaDefinition>>,
    command_types: HashMap<String, CommandTypeInfo>,
    event_types: HashMap<String, EventTypeInfo>,
    roles: BTreeMap<String, Vec<String>>,
    conditions: HashMap<String, Condition>,
    upcasters: EventUpcasters,
    event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("aggregates", &self.aggregates.keys().collect::<Vec<_>>())
            .field("sagas", &self.sagas.keys().collect::<Vec<_>>())
            .field("command_types", &self.command_types.len())
            .field("event_types", &self.event_types.len())
            .field("event_handlers", &self.event_handlers.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from domain modules, in order.
    pub fn build(modules: &[&dyn DomainModule]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for module in modules {
            module.register(&mut registry)?;
            info!(module = module.name(), "domain module registered");
        }
        Ok(registry)
    }

    /// Register a typed aggregate and the command handler for its command types.
    pub fn register_aggregate<A>(&mut self) -> Result<&mut Self, RegistryError>
    where
        A: Aggregate + fmt::Debug,
    {
        let kind: Arc<dyn AggregateKind> = Arc::new(KindOf::<A>::new());
        let aggregate_type = kind.aggregate_type();
        if self.aggregates.contains_key(aggregate_type) {
            return Err(RegistryError::duplicate("aggregate type", aggregate_type));
        }
        self.register_command_handler(Arc::new(AggregateCommandHandler::new(kind.clone())))?;
        self.aggregates.insert(aggregate_type.to_string(), kind);
        Ok(self)
    }

    /// Route each of the handler's command types to it.
    pub fn register_command_handler(
        &mut self,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<&mut Self, RegistryError> {
        if let Some(taken) = handler
            .command_types()
            .iter()
            .find(|t| self.command_handlers.contains_key(**t))
        {
            return Err(RegistryError::duplicate("command handler for", *taken));
        }
        for command_type in handler.command_types() {
            self.command_handlers
                .insert(command_type.to_string(), handler.clone());
        }
        Ok(self)
    }

    pub fn register_command_type(&mut self, info: CommandTypeInfo) -> Result<&mut Self, RegistryError> {
        if self.command_types.contains_key(&info.name) {
            return Err(RegistryError::duplicate("command type", info.name));
        }
        self.command_types.insert(info.name.clone(), info);
        Ok(self)
    }

    pub fn register_event_type(&mut self, info: EventTypeInfo) -> Result<&mut Self, RegistryError> {
        if self.event_types.contains_key(&info.name) {
            return Err(RegistryError::duplicate("event type", info.name));
        }
        self.event_types.insert(info.name.clone(), info);
        Ok(self)
    }

    pub fn register_event_upcaster(
        &mut self,
        event_type: impl Into<String>,
        chain: UpcastChain,
    ) -> Result<&mut Self, RegistryError> {
        self.upcasters
            .register(event_type, chain)
            .map_err(|e| match e {
                UpcastError::DuplicateChain(key) => RegistryError::duplicate("event upcaster", key),
                other => RegistryError::Module {
                    module: "upcasters".to_string(),
                    message: other.to_string(),
                },
            })?;
        Ok(self)
    }

    pub fn register_saga(&mut self, saga: Arc<dyn SagaDefinition>) -> Result<&mut Self, RegistryError> {
        let name = saga.name().to_string();
        if self.sagas.contains_key(&name) {
            return Err(RegistryError::duplicate("saga", name));
        }
        self.sagas.insert(name, saga);
        Ok(self)
    }

    pub fn register_access_model(&mut self, model: AccessModel) -> Result<&mut Self, RegistryError> {
        let (domain, roles, conditions) = model.split();
        if self.roles.contains_key(&domain) {
            return Err(RegistryError::duplicate("access model", domain));
        }
        if let Some(taken) = conditions.keys().find(|k| self.conditions.contains_key(*k)) {
            return Err(RegistryError::duplicate("condition", taken.clone()));
        }
        self.conditions.extend(conditions);
        self.roles.insert(domain, roles);
        Ok(self)
    }

    pub fn register_event_handler(
        &mut self,
        handler: Arc<dyn EventHandler>,
    ) -> Result<&mut Self, RegistryError> {
        if self.event_handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(RegistryError::duplicate("event handler", handler.name()));
        }
        self.event_handlers.push(handler);
        Ok(self)
    }

    pub fn aggregate(&self, aggregate_type: &str) -> Option<&Arc<dyn AggregateKind>> {
        self.aggregates.get(aggregate_type)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &Arc<dyn AggregateKind>> {
        self.aggregates.values()
    }

    pub fn command_handler(&self, command_type: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.command_handlers.get(command_type)
    }

    /// Aggregate type that owns `command_type`, via its registered handler.
    pub fn aggregate_for_command(&self, command_type: &str) -> Option<&Arc<dyn AggregateKind>> {
        self.command_handler(command_type)
            .and_then(|h| self.aggregate(h.aggregate_type()))
    }

    pub fn saga(&self, name: &str) -> Option<&Arc<dyn SagaDefinition>> {
        self.sagas.get(name)
    }

    /// Sagas in name order.
    pub fn sagas(&self) -> impl Iterator<Item = &Arc<dyn SagaDefinition>> {
        self.sagas.values()
    }

    pub fn command_type(&self, command_type: &str) -> Option<&CommandTypeInfo> {
        self.command_types.get(command_type)
    }

    pub fn event_type(&self, event_type: &str) -> Option<&EventTypeInfo> {
        self.event_types.get(event_type)
    }

    pub fn roles(&self, domain: &str) -> &[String] {
        self.roles.get(domain).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(name)
    }

    pub fn upcasters(&self) -> &EventUpcasters {
        &self.upcasters
    }

    pub fn event_handlers(&self) -> &[Arc<dyn EventHandler>] {
        &self.event_handlers
    }
}
