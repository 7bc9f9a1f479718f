//! `orderFulfillment` saga.
//!
//! - `OrderCreated`: expire the order after the configured delay.
//! - `OrderConfirmed`: ship right away with the default carrier.
//! - `requestShipment` (saga-only command): ship with the requested carrier,
//!   if the order is confirmed and the `order.canShip` condition holds.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use strata_core::AggregateId;
use strata_events::{PlanContext, ProcessPlan, SagaDefinition, SagaError, SagaInput};

pub const ORDER_FULFILLMENT: &str = "orderFulfillment";
pub const CAN_SHIP: &str = "order.canShip";

#[derive(Debug, Clone)]
pub struct OrderFulfillment {
    expire_after: Duration,
}

impl Default for OrderFulfillment {
    fn default() -> Self {
        Self {
            expire_after: Duration::from_secs(30 * 60),
        }
    }
}

impl OrderFulfillment {
    pub fn new(expire_after: Duration) -> Self {
        Self { expire_after }
    }
}

#[async_trait]
impl SagaDefinition for OrderFulfillment {
    fn name(&self) -> &str {
        ORDER_FULFILLMENT
    }

    fn id_for(&self, input: &SagaInput) -> Option<String> {
        let relevant = match input {
            SagaInput::Event(_) => matches!(input.message_type(), "OrderCreated" | "OrderConfirmed"),
            SagaInput::Command(_) => input.message_type() == "requestShipment",
        };
        if !relevant {
            return None;
        }
        let order_id = input.payload_str("orderId")?;
        Some(format!("{}_{ORDER_FULFILLMENT}-{order_id}", input.tenant_id()))
    }

    async fn plan(&self, input: &SagaInput, ctx: &dyn PlanContext) -> Result<ProcessPlan, SagaError> {
        let order_id = input
            .payload_str("orderId")
            .ok_or_else(|| SagaError::planning(ORDER_FULFILLMENT, "input has no orderId"))?;

        match input.message_type() {
            "OrderCreated" => {
                let expire = input.follow_up(ctx.next_id(), "expireOrder", json!({ "orderId": order_id }));
                Ok(ProcessPlan::empty().with_delay(expire, self.expire_after))
            }
            "OrderConfirmed" => {
                let ship = input.follow_up(ctx.next_id(), "shipOrder", json!({ "orderId": order_id }));
                Ok(ProcessPlan::empty().with_command(ship))
            }
            "requestShipment" => {
                let history = ctx
                    .read_events(input.tenant_id(), "order", &AggregateId::from(order_id))
                    .await?;
                let confirmed = history
                    .last()
                    .is_some_and(|e| e.event_type == "OrderConfirmed");
                if !confirmed {
                    debug!(order_id, "shipment requested for an unconfirmed order; ignoring");
                    return Ok(ProcessPlan::empty());
                }
                if !ctx.evaluate_condition(CAN_SHIP, &input.condition_input())? {
                    debug!(order_id, "shipment not allowed; ignoring");
                    return Ok(ProcessPlan::empty());
                }
                let carrier = input.payload_str("carrier").unwrap_or("standard");
                let ship = input.follow_up(
                    ctx.next_id(),
                    "shipOrder",
                    json!({ "orderId": order_id, "carrier": carrier }),
                );
                Ok(ProcessPlan::empty().with_command(ship))
            }
            other => Err(SagaError::planning(
                ORDER_FULFILLMENT,
                format!("unexpected input '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use strata_core::{MessageId, TenantId};
    use strata_events::{Command, ConditionInput, Event};

    #[derive(Default)]
    struct FakeContext {
        seq: AtomicU64,
        history: Mutex<Vec<Event>>,
        allow: bool,
    }

    #[async_trait]
    impl PlanContext for FakeContext {
        fn next_id(&self) -> MessageId {
            MessageId::from(format!("m{}", self.seq.fetch_add(1, Ordering::SeqCst)).as_str())
        }

        async fn read_events(
            &self,
            _tenant_id: &TenantId,
            _aggregate_type: &str,
            _aggregate_id: &AggregateId,
        ) -> Result<Vec<Event>, SagaError> {
            Ok(self.history.lock().unwrap().clone())
        }

        fn evaluate_condition(&self, name: &str, _input: &ConditionInput) -> Result<bool, SagaError> {
            assert_eq!(name, CAN_SHIP);
            Ok(self.allow)
        }
    }

    fn event(event_type: &str, version: u64) -> Event {
        Event {
            id: MessageId::generate(),
            tenant_id: TenantId::from("t1"),
            event_type: event_type.into(),
            aggregate_id: AggregateId::from("o1"),
            aggregate_type: "order".into(),
            version,
            payload: json!({ "orderId": "o1" }),
            metadata: None,
        }
    }

    fn request(carrier: &str) -> SagaInput {
        SagaInput::Command(Command::new(
            TenantId::from("t1"),
            "requestShipment",
            json!({ "orderId": "o1", "carrier": carrier }),
        ))
    }

    #[test]
    fn id_is_stable_per_order_and_absent_for_unrelated_input() {
        let saga = OrderFulfillment::default();
        let created = SagaInput::Event(event("OrderCreated", 1));
        let confirmed = SagaInput::Event(event("OrderConfirmed", 2));
        assert_eq!(saga.id_for(&created).as_deref(), Some("t1_orderFulfillment-o1"));
        assert_eq!(saga.id_for(&created), saga.id_for(&confirmed));
        assert_eq!(saga.id_for(&SagaInput::Event(event("OrderShipped", 3))), None);
    }

    #[tokio::test]
    async fn creation_schedules_a_delayed_expiry() {
        let saga = OrderFulfillment::new(Duration::from_millis(50));
        let input = SagaInput::Event(event("OrderCreated", 1));
        let plan = saga.plan(&input, &FakeContext::default()).await.unwrap();

        assert!(plan.commands.is_empty());
        assert_eq!(plan.delays.len(), 1);
        assert_eq!(plan.delays[0].delay, Duration::from_millis(50));
        let expire = &plan.delays[0].command;
        assert_eq!(expire.command_type, "expireOrder");
        let meta = expire.metadata.as_ref().unwrap();
        assert_eq!(meta.causation_id.as_deref(), Some(input.id().as_str()));
    }

    #[tokio::test]
    async fn plans_are_deterministic_apart_from_ids() {
        let saga = OrderFulfillment::default();
        let input = SagaInput::Event(event("OrderConfirmed", 2));
        let a = saga.plan(&input, &FakeContext::default()).await.unwrap();
        let b = saga.plan(&input, &FakeContext::default()).await.unwrap();
        assert_eq!(a.commands[0].id, b.commands[0].id);
        assert_eq!(a.commands[0].payload, b.commands[0].payload);
        assert_eq!(a.commands[0].command_type, "shipOrder");
    }

    #[tokio::test]
    async fn shipment_requests_check_history_and_condition() {
        let saga = OrderFulfillment::default();
        let ctx = FakeContext {
            allow: true,
            ..FakeContext::default()
        };
        assert!(saga.plan(&request("dhl"), &ctx).await.unwrap().is_empty());

        ctx.history
            .lock()
            .unwrap()
            .extend([event("OrderCreated", 1), event("OrderConfirmed", 2)]);
        let plan = saga.plan(&request("dhl"), &ctx).await.unwrap();
        assert_eq!(plan.commands[0].payload.get("carrier"), Some(&JsonValue::from("dhl")));

        let denied = FakeContext {
            allow: false,
            history: Mutex::new(vec![event("OrderConfirmed", 2)]),
            ..FakeContext::default()
        };
        assert!(saga.plan(&request("dhl"), &denied).await.unwrap().is_empty());
    }
}
