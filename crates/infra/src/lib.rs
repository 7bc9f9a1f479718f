//! Infrastructure layer: event store, command pipeline, durable routing.

pub mod command_dispatcher;
pub mod command_log;
pub mod config;
pub mod event_store;
pub mod pump;
pub mod read_model;
pub mod repository;
pub mod router;

mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, LoadedAggregate, PipelineError};
pub use command_log::{CommandLog, CommandLogError, InMemoryCommandLog};
pub use config::{ConfigError, RetryPolicy, RuntimeConfig};
pub use pump::{CommandPump, PumpConfig, PumpHandle, PumpStats};
pub use repository::{AggregateRepository, Rehydrated};
pub use router::{ContextFactory, LocalSubstrate, LocalSubstrateConfig, RouteError, RouteReport, Router};
