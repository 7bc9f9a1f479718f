//! Durable routing layer.
//!
//! Commands and events are mapped onto long-lived contexts run by a
//! [`Substrate`]: one per aggregate stream (`{tenant}_{type}-{id}`) and one
//! per saga instance (whatever the saga's `id_for` returns). Because every
//! command for one aggregate lands in the same context, aggregate writes are
//! single-writer without any lock.
//!
//! - [`substrate`]: the signal-or-start boundary and the workflow contract
//! - [`local`]: tokio implementation with TTL retirement and retries
//! - [`aggregate_context`] / [`saga_context`]: what runs inside a context
//! - [`routing`]: the `Router` resolving where each message goes

pub mod aggregate_context;
pub mod local;
pub mod routing;
pub mod saga_context;
pub mod substrate;

use std::sync::Arc;

use crate::command_dispatcher::CommandDispatcher;
use crate::command_log::CommandLog;

pub use aggregate_context::AggregateWorkflow;
pub use local::{LocalSubstrate, LocalSubstrateConfig};
pub use routing::{RouteError, RouteReport, Router};
pub use saga_context::SagaWorkflow;
pub use substrate::{
    ContextHandle, Signal, SignalResult, StartArgs, Substrate, SubstrateError, Workflow,
    WorkflowError, WorkflowFactory,
};

/// Builds aggregate and saga workflows from their start arguments.
#[derive(Clone)]
pub struct ContextFactory {
    dispatcher: CommandDispatcher,
    commands: Arc<dyn CommandLog>,
}

impl ContextFactory {
    /// `commands` is where saga plans write the commands they issue.
    pub fn new(dispatcher: CommandDispatcher, commands: Arc<dyn CommandLog>) -> Self {
        Self {
            dispatcher,
            commands,
        }
    }
}

impl WorkflowFactory for ContextFactory {
    fn create(&self, context_id: &str, start: &StartArgs) -> Result<Box<dyn Workflow>, SubstrateError> {
        match start {
            StartArgs::Aggregate { stream } => Ok(Box::new(AggregateWorkflow::new(
                self.dispatcher.clone(),
                stream.clone(),
            ))),
            StartArgs::Saga { saga, .. } => {
                let definition = self.dispatcher.registry().saga(saga).cloned().ok_or_else(|| {
                    SubstrateError::Start {
                        context_id: context_id.to_string(),
                        message: format!("unknown saga '{saga}'"),
                    }
                })?;
                Ok(Box::new(SagaWorkflow::new(
                    definition,
                    context_id,
                    self.dispatcher.registry().clone(),
                    self.dispatcher.store().clone(),
                    self.commands.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::{AggregateId, TenantId};
    use strata_systest::fixture_registry;

    use crate::command_log::InMemoryCommandLog;
    use crate::event_store::{InMemoryEventStore, StreamId};

    fn factory() -> ContextFactory {
        let registry = Arc::new(fixture_registry(Duration::from_secs(1)).unwrap());
        let dispatcher = CommandDispatcher::new(registry, Arc::new(InMemoryEventStore::new()));
        ContextFactory::new(dispatcher, Arc::new(InMemoryCommandLog::new()))
    }

    #[test]
    fn builds_workflows_for_known_targets() {
        let factory = factory();
        let stream = StreamId::new(TenantId::from("t1"), "order", AggregateId::from("o1"));
        assert!(factory.create("t1_order-o1", &StartArgs::Aggregate { stream }).is_ok());

        let saga = StartArgs::Saga {
            saga: "orderFulfillment".into(),
            tenant_id: TenantId::from("t1"),
        };
        assert!(factory.create("t1_orderFulfillment-o1", &saga).is_ok());
    }

    #[test]
    fn unknown_sagas_cannot_start() {
        let saga = StartArgs::Saga {
            saga: "missing".into(),
            tenant_id: TenantId::from("t1"),
        };
        let err = factory().create("ctx", &saga).err().unwrap();
        assert!(matches!(err, SubstrateError::Start { .. }));
    }
}
