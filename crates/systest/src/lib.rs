//! Fixture domain used to exercise the runtime end to end.
//!
//! - [`SystemTest`]: a bare stream with a retryable command.
//! - [`Order`]: a small lifecycle with upcast event and snapshot schemas.
//! - [`OrderFulfillment`]: a saga reacting to order events and a saga-only
//!   `requestShipment` command.

pub mod fulfillment;
pub mod order;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use strata_core::TenantId;
use strata_events::{
    AccessModel, Command, CommandTypeInfo, DomainModule, EventTypeInfo, FieldKind, ObjectSchema,
    Registry, RegistryError, RouteHint,
};

pub use fulfillment::{CAN_SHIP, ORDER_FULFILLMENT, OrderFulfillment};
pub use order::{
    Order, OrderCommand, OrderEvent, OrderState, OrderStatus, order_created_upcasters,
    order_created_v1_to_v2, order_state_v1_to_v2,
};
pub use system_test::{SystemTest, SystemTestCommand, SystemTestEvent, SystemTestState};

pub const FIXTURE_TENANT: &str = "t1";

#[derive(Debug, Default)]
pub struct SystemTestModule;

impl DomainModule for SystemTestModule {
    fn name(&self) -> &str {
        "systemTest"
    }

    fn register(&self, registry: &mut Registry) -> Result<(), RegistryError> {
        registry.register_aggregate::<SystemTest>()?;
        for command_type in ["createTest", "executeTest", "executeRetryableTest"] {
            registry.register_command_type(
                CommandTypeInfo::new(command_type)
                    .with_schema(ObjectSchema::new().required("testId", FieldKind::String))
                    .with_route(RouteHint::field("systemTest", "testId")),
            )?;
        }
        for event_type in ["TestCreated", "TestExecuted", "TestRetryableExecuted"] {
            registry.register_event_type(
                EventTypeInfo::new(event_type)
                    .with_schema(ObjectSchema::new().required("testId", FieldKind::String)),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OrderModule {
    saga: OrderFulfillment,
}

impl OrderModule {
    /// Expire unconfirmed orders after `expire_after` instead of the default.
    pub fn with_expiry(expire_after: Duration) -> Self {
        Self {
            saga: OrderFulfillment::new(expire_after),
        }
    }
}

impl DomainModule for OrderModule {
    fn name(&self) -> &str {
        "order"
    }

    fn register(&self, registry: &mut Registry) -> Result<(), RegistryError> {
        let by_order = || RouteHint::field("order", "orderId");
        let order_id = || ObjectSchema::new().required("orderId", FieldKind::String);

        registry
            .register_aggregate::<Order>()?
            .register_command_type(
                CommandTypeInfo::new("createOrder")
                    .with_schema(
                        order_id()
                            .required("customer", FieldKind::String)
                            .required("amount", FieldKind::Number)
                            .optional("currency", FieldKind::String),
                    )
                    .with_route(by_order()),
            )?
            .register_command_type(CommandTypeInfo::new("confirmOrder").with_schema(order_id()).with_route(by_order()))?
            .register_command_type(
                CommandTypeInfo::new("shipOrder")
                    .with_schema(order_id().optional("carrier", FieldKind::String))
                    .with_route(by_order()),
            )?
            .register_command_type(CommandTypeInfo::new("expireOrder").with_schema(order_id()).with_route(by_order()))?
            .register_command_type(
                CommandTypeInfo::new("requestShipment")
                    .with_schema(order_id().required("carrier", FieldKind::String)),
            )?
            .register_event_type(
                EventTypeInfo::new("OrderCreated").with_schema(
                    order_id()
                        .required("customer", FieldKind::String)
                        .required("amount", FieldKind::Number)
                        .required("currency", FieldKind::String),
                ),
            )?
            .register_event_type(EventTypeInfo::new("OrderConfirmed").with_schema(order_id()))?
            .register_event_type(
                EventTypeInfo::new("OrderShipped")
                    .with_schema(order_id().required("carrier", FieldKind::String)),
            )?
            .register_event_type(EventTypeInfo::new("OrderExpired").with_schema(order_id()))?
            .register_event_upcaster("OrderCreated", order_created_upcasters())?
            .register_saga(Arc::new(self.saga.clone()))?
            .register_access_model(
                AccessModel::new("order")
                    .with_role("customer")
                    .with_role("warehouse")
                    .with_condition(CAN_SHIP, |input| {
                        input
                            .payload
                            .get("carrier")
                            .and_then(JsonValue::as_str)
                            .is_some_and(|carrier| !carrier.is_empty() && carrier != "none")
                    }),
            )?;
        Ok(())
    }
}

pub fn system_test_registry() -> Result<Registry, RegistryError> {
    Registry::build(&[&SystemTestModule])
}

pub fn order_registry() -> Result<Registry, RegistryError> {
    Registry::build(&[&OrderModule::default()])
}

/// Both fixture modules, with the given order expiry delay.
pub fn fixture_registry(expire_after: Duration) -> Result<Registry, RegistryError> {
    Registry::build(&[&SystemTestModule, &OrderModule::with_expiry(expire_after)])
}

/// A `systemTest` command for tenant `t1`.
pub fn test_command(command_type: &str, test_id: &str) -> Command {
    Command::new(
        TenantId::from(FIXTURE_TENANT),
        command_type,
        json!({ "testId": test_id }),
    )
}

/// An order command for tenant `t1`; `extra` fields are merged into the payload.
pub fn order_command(command_type: &str, order_id: &str, extra: JsonValue) -> Command {
    let mut payload = json!({ "orderId": order_id });
    if let (Some(target), JsonValue::Object(fields)) = (payload.as_object_mut(), extra) {
        target.extend(fields);
    }
    Command::new(TenantId::from(FIXTURE_TENANT), command_type, payload)
}

pub fn create_order(order_id: &str, amount: i64) -> Command {
    order_command(
        "createOrder",
        order_id,
        json!({ "customer": "c1", "amount": amount }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modules_register_once() {
        let registry = fixture_registry(Duration::from_secs(1)).unwrap();
        assert!(registry.aggregate("order").is_some());
        assert!(registry.aggregate("systemTest").is_some());
        assert!(registry.saga(ORDER_FULFILLMENT).is_some());
        assert_eq!(registry.roles("order"), ["customer".to_string(), "warehouse".to_string()]);
        assert!(registry.condition(CAN_SHIP).is_some());
        assert_eq!(registry.upcasters().current_version("OrderCreated"), 2);

        let twice = Registry::build(&[&SystemTestModule, &SystemTestModule]);
        assert!(matches!(twice, Err(RegistryError::Duplicate { .. })));
    }

    #[test]
    fn saga_only_commands_have_no_aggregate() {
        let registry = order_registry().unwrap();
        assert!(registry.aggregate_for_command("requestShipment").is_none());
        assert!(registry.command_type("requestShipment").is_some());
    }

    #[test]
    fn order_command_merges_fields() {
        let cmd = order_command("shipOrder", "o1", json!({ "carrier": "dhl" }));
        assert_eq!(cmd.payload, json!({ "orderId": "o1", "carrier": "dhl" }));
        assert_eq!(cmd.tenant_id.as_str(), FIXTURE_TENANT);
    }
}
