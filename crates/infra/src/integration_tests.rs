//! Integration tests for the full runtime.
//!
//! Tests: Command log → Pump → Router → Local substrate → Aggregate / saga
//! contexts → Event store
//!
//! Verifies:
//! - Snapshot cadence and rehydration through long-lived contexts
//! - Idempotent replay of redelivered commands
//! - Contexts retire when idle and restart transparently
//! - Saga plans loop back through the command log
//! - Commands to one aggregate are serialized

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use serde_json::json;

    use strata_core::{AggregateId, MessageId, TenantId};
    use strata_events::{CommandOutcome, Event, Metadata, Registry};
    use strata_systest::{
        FIXTURE_TENANT, create_order, fixture_registry, order_command, test_command,
    };

    use crate::command_dispatcher::CommandDispatcher;
    use crate::command_log::{CommandLog, InMemoryCommandLog};
    use crate::event_store::{EventStore, InMemoryEventStore, SnapshotPolicy, StreamId};
    use crate::pump::{CommandPump, PumpConfig, PumpHandle};
    use crate::router::{ContextFactory, LocalSubstrate, LocalSubstrateConfig, RouteReport, Router};

    struct Runtime {
        store: Arc<InMemoryEventStore>,
        log: Arc<InMemoryCommandLog>,
        substrate: Arc<LocalSubstrate>,
        router: Router,
    }

    impl Runtime {
        fn new(expire_after: Duration, ttl: Duration) -> Self {
            let registry: Arc<Registry> = Arc::new(fixture_registry(expire_after).unwrap());
            let store = Arc::new(
                InMemoryEventStore::new()
                    .with_upcasters(registry.upcasters().clone())
                    .with_snapshot_policy(SnapshotPolicy::every(2)),
            );
            let log = Arc::new(InMemoryCommandLog::new());
            let dispatcher = CommandDispatcher::new(registry.clone(), store.clone()).with_snapshot_every(2);
            let factory = ContextFactory::new(dispatcher, log.clone());
            let substrate = Arc::new(LocalSubstrate::new(
                Arc::new(factory),
                LocalSubstrateConfig::default().with_ttl(ttl),
            ));
            let router = Router::new(registry, substrate.clone());
            Self {
                store,
                log,
                substrate,
                router,
            }
        }

        fn standard() -> Self {
            Self::new(Duration::from_secs(60), Duration::from_secs(5))
        }

        fn pump(&self) -> PumpHandle {
            CommandPump::new(self.log.clone(), self.router.clone())
                .spawn(PumpConfig::default().with_poll_interval(Duration::from_millis(10)))
        }

        async fn schedule(&self, command: &strata_events::Command) -> CommandOutcome {
            let report: RouteReport = self.router.schedule(command).await.unwrap();
            report.outcome.unwrap()
        }

        async fn events(&self, aggregate_type: &str, id: &str) -> Vec<Event> {
            self.store
                .load(&stream(aggregate_type, id), 0)
                .await
                .unwrap()
                .map(|l| l.events)
                .unwrap_or_default()
        }

        /// Poll until the stream's event types match `expected`.
        async fn wait_for_types(&self, aggregate_type: &str, id: &str, expected: &[&str]) -> Vec<String> {
            let mut types = Vec::new();
            for _ in 0..200 {
                types = self
                    .events(aggregate_type, id)
                    .await
                    .into_iter()
                    .map(|e| e.event_type)
                    .collect::<Vec<_>>();
                if types == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            types
        }
    }

    fn stream(aggregate_type: &str, id: &str) -> StreamId {
        StreamId::new(TenantId::from(FIXTURE_TENANT), aggregate_type, AggregateId::from(id))
    }

    fn event_types(outcome: &CommandOutcome) -> Vec<&str> {
        outcome.events().iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn order_scenario_snapshots_at_version_two() {
        let rt = Runtime::standard();

        let created = rt.schedule(&create_order("o1", 25)).await;
        assert_eq!(event_types(&created), vec!["OrderCreated"]);
        assert!(rt.store.load_snapshot(&stream("order", "o1")).await.unwrap().is_none());

        let confirmed = rt.schedule(&order_command("confirmOrder", "o1", json!({}))).await;
        assert_eq!(event_types(&confirmed), vec!["OrderConfirmed"]);

        let snapshot = rt.store.load_snapshot(&stream("order", "o1")).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);

        let events = rt.events("order", "o1").await;
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn retryable_test_fails_only_at_even_versions() {
        let rt = Runtime::standard();

        rt.schedule(&test_command("createTest", "r1")).await;
        let odd = rt.schedule(&test_command("executeRetryableTest", "r1")).await;
        assert_eq!(event_types(&odd), vec!["TestRetryableExecuted"]);
        assert_eq!(odd.events()[0].version, 2);

        let even = rt.schedule(&test_command("executeRetryableTest", "r1")).await;
        assert!(matches!(even, CommandOutcome::Fail { retriable: true, .. }));
        assert_eq!(rt.events("systemTest", "r1").await.len(), 2);
    }

    #[tokio::test]
    async fn redelivered_commands_are_not_applied_twice() {
        let rt = Runtime::standard();
        let create = test_command("createTest", "d1");

        let first = rt.schedule(&create).await;
        let second = rt.schedule(&create).await;

        assert_eq!(first, second);
        assert_eq!(rt.events("systemTest", "d1").await.len(), 1);
    }

    #[tokio::test]
    async fn idle_contexts_restart_from_storage() {
        let rt = Runtime::new(Duration::from_secs(60), Duration::from_millis(40));

        rt.schedule(&test_command("createTest", "t9")).await;
        rt.schedule(&test_command("executeTest", "t9")).await;
        assert!(rt.substrate.is_active("t1_systemTest-t9"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!rt.substrate.is_active("t1_systemTest-t9"));

        // The new context rehydrates from the snapshot at v2.
        let third = rt.schedule(&test_command("executeTest", "t9")).await;
        assert_eq!(third.events()[0].version, 3);
        assert!(rt.substrate.is_active("t1_systemTest-t9"));
    }

    #[tokio::test]
    async fn confirmed_orders_are_shipped_by_the_saga() {
        let rt = Runtime::new(Duration::from_millis(50), Duration::from_secs(5));
        let pump = rt.pump();

        rt.log.insert(create_order("o2", 10)).await.unwrap();
        rt.log
            .insert(order_command("confirmOrder", "o2", json!({})))
            .await
            .unwrap();

        // The expiry lands after confirmation and changes nothing.
        let types = rt
            .wait_for_types("order", "o2", &["OrderCreated", "OrderConfirmed", "OrderShipped"])
            .await;
        assert_eq!(types, vec!["OrderCreated", "OrderConfirmed", "OrderShipped"]);

        let shipped = rt.events("order", "o2").await.pop().unwrap();
        let meta = shipped.metadata.unwrap();
        assert!(meta.causation_id.is_some());
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn unconfirmed_orders_expire() {
        let rt = Runtime::new(Duration::from_millis(30), Duration::from_secs(5));
        let pump = rt.pump();

        rt.log.insert(create_order("o3", 10)).await.unwrap();

        let types = rt
            .wait_for_types("order", "o3", &["OrderCreated", "OrderExpired"])
            .await;
        assert_eq!(types, vec!["OrderCreated", "OrderExpired"]);
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn shipment_requests_go_through_the_saga() {
        let rt = Runtime::standard();
        let stream = stream("order", "o4");
        let seed = |version: u64, event_type: &str, payload: serde_json::Value| Event {
            id: MessageId::generate(),
            tenant_id: TenantId::from(FIXTURE_TENANT),
            event_type: event_type.to_string(),
            aggregate_id: AggregateId::from("o4"),
            aggregate_type: "order".into(),
            version,
            payload,
            metadata: Some(Metadata::now()),
        };
        rt.store
            .seed(
                &stream,
                vec![
                    seed(
                        1,
                        "OrderCreated",
                        json!({ "orderId": "o4", "customer": "c1", "amount": 5, "currency": "EUR" }),
                    ),
                    seed(2, "OrderConfirmed", json!({ "orderId": "o4" })),
                ],
            )
            .unwrap();
        let pump = rt.pump();

        let report = rt
            .router
            .schedule(&order_command("requestShipment", "o4", json!({ "carrier": "dhl" })))
            .await
            .unwrap();
        assert_eq!(report.outcome, None);
        assert_eq!(report.sagas, vec!["t1_orderFulfillment-o4".to_string()]);

        let types = rt
            .wait_for_types("order", "o4", &["OrderCreated", "OrderConfirmed", "OrderShipped"])
            .await;
        assert_eq!(types.len(), 3);
        let shipped = rt.events("order", "o4").await.pop().unwrap();
        assert_eq!(shipped.payload["carrier"], "dhl");
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn routed_events_are_applied_once() {
        let rt = Runtime::standard();
        rt.schedule(&test_command("createTest", "e1")).await;

        let external = Event {
            id: MessageId::generate(),
            tenant_id: TenantId::from(FIXTURE_TENANT),
            event_type: "TestExecuted".into(),
            aggregate_id: AggregateId::from("e1"),
            aggregate_type: "systemTest".into(),
            version: 2,
            payload: json!({ "testId": "e1" }),
            metadata: None,
        };

        let first = rt.router.route_event(&external).await.unwrap();
        assert_eq!(first.applied, Some(true));

        let mut replayed = external.clone();
        replayed.id = MessageId::generate();
        let second = rt.router.route_event(&replayed).await.unwrap();
        assert_eq!(second.applied, Some(false));
        assert_eq!(rt.events("systemTest", "e1").await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_commands_to_one_aggregate_are_serialized() {
        let rt = Runtime::standard();
        rt.schedule(&test_command("createTest", "c1")).await;

        let commands: Vec<_> = (0..10).map(|_| test_command("executeTest", "c1")).collect();
        let outcomes = join_all(commands.iter().map(|c| rt.router.schedule(c))).await;
        assert!(outcomes.iter().all(|o| matches!(
            o,
            Ok(RouteReport { outcome: Some(CommandOutcome::Success { .. }), .. })
        )));

        let versions: Vec<u64> = rt.events("systemTest", "c1").await.iter().map(|e| e.version).collect();
        assert_eq!(versions, (1..=11).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn tenants_get_separate_streams() {
        let rt = Runtime::standard();
        let mut other = test_command("createTest", "x1");
        other.tenant_id = TenantId::from("t2");
        other.payload = json!({ "testId": "x1", "tenantId": "t2" });

        rt.schedule(&test_command("createTest", "x1")).await;
        let outcome = rt.schedule(&other).await;
        assert!(outcome.is_success(), "{outcome:?}");

        assert!(rt.substrate.is_active("t1_systemTest-x1"));
        assert!(rt.substrate.is_active("t2_systemTest-x1"));
        assert_eq!(rt.events("systemTest", "x1").await.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_aggregate_type_fails_fast_without_retries() {
        let rt = Runtime::standard();
        let command = strata_events::Command::new(
            TenantId::from(FIXTURE_TENANT),
            "anything",
            json!({ "aggregateType": "ledger", "aggregateId": "l9" }),
        );

        let started = tokio::time::Instant::now();
        let outcome = rt.schedule(&command).await;
        assert!(
            matches!(outcome, CommandOutcome::Fail { retriable: false, ref error } if error.contains("'ledger'")),
            "{outcome:?}"
        );
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!rt.substrate.is_active("t1_ledger-l9"));
        assert_eq!(rt.substrate.started(), 0);
    }
}
