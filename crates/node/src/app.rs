//! Runtime wiring.
//!
//! Builds the registry from the domain modules, picks the store backend from
//! `DATABASE_URL` (Postgres when set, in-memory otherwise), and connects
//! dispatcher, substrate, router and command log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use strata_core::TenantId;
use strata_events::{Event, Registry};
use strata_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore, SnapshotPolicy};
use strata_infra::read_model::{
    InMemoryReadModel, PostgresReadModel, ReadModelChange, ReadModelError, ReadModelProjector,
    ReadModelUpdater,
};
use strata_infra::{
    CommandDispatcher, CommandLog, CommandPump, ContextFactory, InMemoryCommandLog, LocalSubstrate,
    LocalSubstrateConfig, PumpConfig, PumpHandle, Router, RuntimeConfig,
};
use strata_systest::{OrderModule, SystemTestModule};

pub const ORDER_STATUS_MODEL: &str = "order_status";

/// Where the order status read model lives.
#[derive(Debug, Clone)]
pub enum OrderStatusView {
    Memory(Arc<InMemoryReadModel>),
    Postgres(PostgresReadModel),
}

impl OrderStatusView {
    fn updater(&self) -> Arc<dyn ReadModelUpdater> {
        match self {
            OrderStatusView::Memory(store) => store.clone(),
            OrderStatusView::Postgres(store) => Arc::new(store.clone()),
        }
    }

    pub async fn get(&self, tenant_id: &TenantId, order_id: &str) -> Result<Option<JsonValue>, ReadModelError> {
        match self {
            OrderStatusView::Memory(store) => Ok(store.get(tenant_id, order_id)),
            OrderStatusView::Postgres(store) => store.get(tenant_id, order_id).await,
        }
    }
}

/// Order status projection: one record per order, removed on expiry.
pub fn order_status_projector(updater: Arc<dyn ReadModelUpdater>) -> ReadModelProjector {
    ReadModelProjector::new(
        ORDER_STATUS_MODEL,
        &["OrderCreated", "OrderConfirmed", "OrderShipped", "OrderExpired"],
        updater,
        |event: &Event| {
            let id = event.aggregate_id.to_string();
            let status = match event.event_type.as_str() {
                "OrderCreated" => "pending",
                "OrderConfirmed" => "confirmed",
                "OrderShipped" => "shipped",
                "OrderExpired" => return Some(ReadModelChange::Remove { id }),
                _ => return None,
            };
            Some(ReadModelChange::Upsert {
                id,
                data: json!({ "status": status, "version": event.version }),
            })
        },
    )
}

pub struct Node {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn EventStore>,
    pub log: Arc<dyn CommandLog>,
    pub substrate: Arc<LocalSubstrate>,
    pub router: Router,
    pub order_status: OrderStatusView,
}

impl Node {
    pub async fn build(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let mut registry = Registry::build(&[&SystemTestModule, &OrderModule::default()])
            .context("registering domain modules")?;
        let policy = SnapshotPolicy::every(config.snapshot_every);

        let (store, order_status): (Arc<dyn EventStore>, OrderStatusView) = match &config.database_url {
            Some(url) => {
                let store = PostgresEventStore::connect(url)
                    .await
                    .context("connecting to Postgres")?
                    .with_upcasters(registry.upcasters().clone())
                    .with_snapshot_policy(policy);
                store.ensure_schema().await.context("creating event store tables")?;
                let view = PostgresReadModel::new(store.pool().clone(), ORDER_STATUS_MODEL);
                view.ensure_schema().await.context("creating read model table")?;
                info!(backend = "postgres", "event store ready");
                let store: Arc<dyn EventStore> = Arc::new(store);
                (store, OrderStatusView::Postgres(view))
            }
            None => {
                let store = InMemoryEventStore::new()
                    .with_upcasters(registry.upcasters().clone())
                    .with_snapshot_policy(policy);
                info!(backend = "memory", "event store ready");
                let store: Arc<dyn EventStore> = Arc::new(store);
                (store, OrderStatusView::Memory(Arc::new(InMemoryReadModel::new())))
            }
        };

        registry
            .register_event_handler(Arc::new(order_status_projector(order_status.updater())))
            .context("registering read model projector")?;
        let registry = Arc::new(registry);

        let log: Arc<dyn CommandLog> = Arc::new(InMemoryCommandLog::new());
        let dispatcher = CommandDispatcher::new(registry.clone(), store.clone())
            .with_snapshot_every(config.snapshot_every);
        let factory = ContextFactory::new(dispatcher, log.clone());
        let substrate = Arc::new(LocalSubstrate::new(
            Arc::new(factory),
            LocalSubstrateConfig::from_runtime(config),
        ));
        let router = Router::new(registry.clone(), substrate.clone()).with_task_queue(&config.task_queue);

        Ok(Self {
            registry,
            store,
            log,
            substrate,
            router,
            order_status,
        })
    }

    pub fn start_pump(&self, config: PumpConfig) -> PumpHandle {
        CommandPump::new(self.log.clone(), self.router.clone()).spawn(config)
    }

    /// Wait until no command is pending, or `max_wait` elapses.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let idle = self.log.pending(1).await.map(|p| p.is_empty()).unwrap_or(false);
            if idle {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            self.log.wait_for_pending(Duration::from_millis(20)).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_systest::{create_order, order_command};

    #[tokio::test]
    async fn in_memory_node_routes_commands_into_the_read_model() {
        let node = Node::build(&RuntimeConfig::default()).await.unwrap();
        let pump = node.start_pump(PumpConfig::default().with_poll_interval(Duration::from_millis(10)));

        node.log.insert(create_order("o1", 12)).await.unwrap();
        node.log
            .insert(order_command("confirmOrder", "o1", json!({})))
            .await
            .unwrap();

        let tenant = TenantId::from("t1");
        let mut status = None;
        for _ in 0..200 {
            status = node.order_status.get(&tenant, "o1").await.unwrap();
            if status.as_ref().and_then(|s| s["status"].as_str()) == Some("confirmed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pump.shutdown().await;

        let status = status.unwrap();
        assert_eq!(status["status"], "confirmed");
        assert_eq!(status["version"], 2);
    }

    #[tokio::test]
    async fn expired_orders_leave_the_view() {
        use strata_core::{AggregateId, MessageId};
        use strata_events::EventHandler;

        let store = Arc::new(InMemoryReadModel::new());
        let projector = order_status_projector(store.clone());
        let event = |event_type: &str, version: u64| Event {
            id: MessageId::generate(),
            tenant_id: TenantId::from("t1"),
            event_type: event_type.to_string(),
            aggregate_id: AggregateId::from("o9"),
            aggregate_type: "order".into(),
            version,
            payload: json!({ "orderId": "o9" }),
            metadata: None,
        };

        projector.handle(&event("OrderCreated", 1)).await.unwrap();
        let tenant = TenantId::from("t1");
        assert_eq!(store.get(&tenant, "o9").unwrap()["status"], "pending");

        projector.handle(&event("OrderExpired", 2)).await.unwrap();
        assert_eq!(store.get(&tenant, "o9"), None);
    }
}
