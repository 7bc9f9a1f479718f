//! `order` aggregate: pending → confirmed → shipped, or pending → expired.
//!
//! Schema history:
//! - `OrderCreated` v1 carried `total`; v2 renames it to `amount` and adds
//!   `currency` (defaulting to EUR).
//! - Snapshot state v1 has the same shape change.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use strata_core::{Aggregate, AggregateId, DomainError, DomainResult, UpcastChain};

pub const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Pending,
    Confirmed,
    Shipped,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: AggregateId,
    version: u64,
    status: OrderStatus,
    customer: Option<String>,
    amount: i64,
    currency: String,
    carrier: Option<String>,
}

impl Order {
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn customer(&self) -> Option<&str> {
        self.customer.as_deref()
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn carrier(&self) -> Option<&str> {
        self.carrier.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OrderCommand {
    #[serde(rename = "createOrder", rename_all = "camelCase")]
    Create {
        order_id: String,
        customer: String,
        amount: i64,
        #[serde(default)]
        currency: Option<String>,
    },
    #[serde(rename = "confirmOrder", rename_all = "camelCase")]
    Confirm { order_id: String },
    #[serde(rename = "shipOrder", rename_all = "camelCase")]
    Ship {
        order_id: String,
        #[serde(default)]
        carrier: Option<String>,
    },
    #[serde(rename = "expireOrder", rename_all = "camelCase")]
    Expire { order_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OrderEvent {
    #[serde(rename_all = "camelCase")]
    OrderCreated {
        order_id: String,
        customer: String,
        amount: i64,
        currency: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderConfirmed { order_id: String },
    #[serde(rename_all = "camelCase")]
    OrderShipped { order_id: String, carrier: String },
    #[serde(rename_all = "camelCase")]
    OrderExpired { order_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
    pub status: OrderStatus,
    pub customer: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub carrier: Option<String>,
}

/// `OrderCreated` v1 → v2: `total` becomes `amount`, `currency` is added.
pub fn order_created_v1_to_v2(payload: JsonValue) -> Result<JsonValue, String> {
    rename_total(payload, "OrderCreated payload")
}

/// Snapshot state v1 → v2, same shape change as the event.
pub fn order_state_v1_to_v2(state: JsonValue) -> Result<JsonValue, String> {
    rename_total(state, "order snapshot")
}

fn rename_total(value: JsonValue, what: &str) -> Result<JsonValue, String> {
    let JsonValue::Object(mut obj) = value else {
        return Err(format!("{what} is not an object"));
    };
    if let Some(total) = obj.remove("total") {
        obj.entry("amount").or_insert(total);
    }
    obj.entry("currency").or_insert_with(|| json!(DEFAULT_CURRENCY));
    Ok(JsonValue::Object(obj))
}

pub fn order_created_upcasters() -> UpcastChain {
    UpcastChain::identity(2).with_step(1, order_created_v1_to_v2)
}

impl Aggregate for Order {
    const AGGREGATE_TYPE: &'static str = "order";
    const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

    type Command = OrderCommand;
    type Event = OrderEvent;
    type State = OrderState;

    fn command_types() -> &'static [&'static str] {
        &["createOrder", "confirmOrder", "shipOrder", "expireOrder"]
    }

    fn event_types() -> &'static [&'static str] {
        &["OrderCreated", "OrderConfirmed", "OrderShipped", "OrderExpired"]
    }

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            status: OrderStatus::New,
            customer: None,
            amount: 0,
            currency: DEFAULT_CURRENCY.to_string(),
            carrier: None,
        }
    }

    fn id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn target_id(command: &Self::Command) -> DomainResult<AggregateId> {
        match command {
            OrderCommand::Create { order_id, .. }
            | OrderCommand::Confirm { order_id }
            | OrderCommand::Ship { order_id, .. }
            | OrderCommand::Expire { order_id } => order_id.parse(),
        }
    }

    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>> {
        match command {
            OrderCommand::Create {
                order_id,
                customer,
                amount,
                currency,
            } => {
                if self.status != OrderStatus::New {
                    return Err(DomainError::business_rule("order already exists"));
                }
                if *amount <= 0 {
                    return Err(DomainError::business_rule("order amount must be positive"));
                }
                Ok(vec![OrderEvent::OrderCreated {
                    order_id: order_id.clone(),
                    customer: customer.clone(),
                    amount: *amount,
                    currency: currency.clone().unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
                }])
            }
            OrderCommand::Confirm { order_id } => match self.status {
                OrderStatus::New => Err(DomainError::retriable("order not created yet")),
                OrderStatus::Pending => Ok(vec![OrderEvent::OrderConfirmed {
                    order_id: order_id.clone(),
                }]),
                other => Err(DomainError::business_rule(format!(
                    "cannot confirm a {other:?} order"
                ))),
            },
            OrderCommand::Ship { order_id, carrier } => match self.status {
                OrderStatus::Confirmed => Ok(vec![OrderEvent::OrderShipped {
                    order_id: order_id.clone(),
                    carrier: carrier.clone().unwrap_or_else(|| "standard".to_string()),
                }]),
                other => Err(DomainError::business_rule(format!(
                    "cannot ship a {other:?} order"
                ))),
            },
            // Expiry only bites while the order is still pending.
            OrderCommand::Expire { order_id } => match self.status {
                OrderStatus::Pending => Ok(vec![OrderEvent::OrderExpired {
                    order_id: order_id.clone(),
                }]),
                _ => Ok(vec![]),
            },
        }
    }

    fn mutate(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated {
                customer,
                amount,
                currency,
                ..
            } => {
                self.status = OrderStatus::Pending;
                self.customer = Some(customer.clone());
                self.amount = *amount;
                self.currency = currency.clone();
            }
            OrderEvent::OrderConfirmed { .. } => self.status = OrderStatus::Confirmed,
            OrderEvent::OrderShipped { carrier, .. } => {
                self.status = OrderStatus::Shipped;
                self.carrier = Some(carrier.clone());
            }
            OrderEvent::OrderExpired { .. } => self.status = OrderStatus::Expired,
        }
    }

    fn extract_snapshot_state(&self) -> Self::State {
        OrderState {
            status: self.status,
            customer: self.customer.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            carrier: self.carrier.clone(),
        }
    }

    fn apply_snapshot_state(&mut self, state: Self::State) {
        self.status = state.status;
        self.customer = state.customer;
        self.amount = state.amount;
        self.currency = state.currency;
        self.carrier = state.carrier;
    }

    fn snapshot_upcasters() -> UpcastChain {
        UpcastChain::identity(Self::SNAPSHOT_SCHEMA_VERSION).with_step(1, order_state_v1_to_v2)
    }
}
