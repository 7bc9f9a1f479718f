//! Commands, events, and the in-process machinery that wires domains together.
//!
//! - [`message`]: the plain data contracts (`Command`, `Event`, `Metadata`).
//! - [`registry`]: the process-wide catalog built once at startup.
//! - [`bus`]: command dispatch against a loaded aggregate and event fan-out.
//! - [`saga`]: process-manager planning contract.

pub mod bus;
pub mod handler;
pub mod instance;
pub mod message;
pub mod policy;
pub mod registry;
pub mod saga;
pub mod schema;

pub use bus::{CommandBus, DispatchError, EventBus, PublishReport};
pub use handler::{AggregateCommandHandler, CommandHandler, EventHandler, EventHandlerError};
pub use instance::{AggregateInstance, AggregateKind, KindOf, NewEvent, SnapshotState};
pub use message::{Command, CommandOutcome, CommandStatus, Event, Metadata};
pub use policy::{AccessModel, Condition, ConditionInput};
pub use registry::{
    CommandTypeInfo, DomainModule, EventTypeInfo, Registry, RegistryError, RouteHint,
};
pub use saga::{DelayedCommand, PlanContext, ProcessPlan, SagaDefinition, SagaError, SagaInput};
pub use schema::{FieldError, FieldKind, ObjectSchema, PayloadValidator, ValidationOutcome};
