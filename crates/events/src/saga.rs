//! Saga / process-manager planning contract (mechanics only).
//!
//! A saga reacts to commands and events that belong to one logical process
//! instance and answers with a [`ProcessPlan`]: commands to issue now and
//! commands to issue after a delay. Sagas never emit events; everything they
//! want to change goes back through the command path.
//!
//! - `id_for` correlates an input to an instance. It must be deterministic and
//!   cheap; `None` means the input is unrelated.
//! - `plan` may read event streams and evaluate registered conditions through
//!   the [`PlanContext`], but must not have side effects of its own.
//!
//! Running the plan (sleeping, inserting commands, retiring idle instances) is
//! the router's job.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use strata_core::{AggregateId, MessageId, TenantId};

use crate::message::{Command, Event, Metadata};
use crate::policy::ConditionInput;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SagaError {
    #[error("saga '{saga}' planning failed: {message}")]
    Planning { saga: String, message: String },

    #[error("unknown condition '{0}'")]
    UnknownCondition(String),

    #[error("reading events failed: {0}")]
    ReadFailed(String),
}

impl SagaError {
    pub fn planning(saga: impl Into<String>, message: impl ToString) -> Self {
        Self::Planning {
            saga: saga.into(),
            message: message.to_string(),
        }
    }
}

/// What a saga is signaled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaInput {
    Command(Command),
    Event(Event),
}

impl SagaInput {
    pub fn id(&self) -> &MessageId {
        match self {
            SagaInput::Command(c) => &c.id,
            SagaInput::Event(e) => &e.id,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            SagaInput::Command(c) => &c.tenant_id,
            SagaInput::Event(e) => &e.tenant_id,
        }
    }

    /// The command or event type tag.
    pub fn message_type(&self) -> &str {
        match self {
            SagaInput::Command(c) => &c.command_type,
            SagaInput::Event(e) => &e.event_type,
        }
    }

    pub fn payload(&self) -> &JsonValue {
        match self {
            SagaInput::Command(c) => &c.payload,
            SagaInput::Event(e) => &e.payload,
        }
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            SagaInput::Command(c) => c.metadata.as_ref(),
            SagaInput::Event(e) => e.metadata.as_ref(),
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            SagaInput::Event(e) => Some(e),
            SagaInput::Command(_) => None,
        }
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload().get(field).and_then(JsonValue::as_str)
    }

    /// A command caused by this input.
    ///
    /// Same tenant; `causationId` is this input's id and `correlationId` is
    /// propagated (or starts at this input's id).
    pub fn follow_up(
        &self,
        id: MessageId,
        command_type: impl Into<String>,
        payload: JsonValue,
    ) -> Command {
        Command::new(self.tenant_id().clone(), command_type, payload)
            .with_id(id)
            .with_metadata(Metadata::caused_by(self.id(), self.metadata()))
    }

    pub fn condition_input(&self) -> ConditionInput {
        ConditionInput {
            tenant_id: self.tenant_id().clone(),
            user_id: self.metadata().and_then(|m| m.user_id.clone()),
            payload: self.payload().clone(),
        }
    }
}

impl From<Command> for SagaInput {
    fn from(command: Command) -> Self {
        SagaInput::Command(command)
    }
}

impl From<Event> for SagaInput {
    fn from(event: Event) -> Self {
        SagaInput::Event(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedCommand {
    pub command: Command,
    pub delay: Duration,
}

/// Commands a saga wants issued. Immediate commands go first, then each
/// delayed command in turn after its own delay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessPlan {
    pub commands: Vec<Command>,
    pub delays: Vec<DelayedCommand>,
    pub trace_context: Option<String>,
}

impl ProcessPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_delay(mut self, command: Command, delay: Duration) -> Self {
        self.delays.push(DelayedCommand { command, delay });
        self
    }

    pub fn with_trace_context(mut self, trace_context: impl Into<String>) -> Self {
        self.trace_context = Some(trace_context.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.delays.is_empty()
    }
}

/// Capabilities available to `plan`.
#[async_trait]
pub trait PlanContext: Send + Sync {
    /// A fresh unique message id.
    fn next_id(&self) -> MessageId;

    async fn read_events(
        &self,
        tenant_id: &TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<Event>, SagaError>;

    fn evaluate_condition(&self, name: &str, input: &ConditionInput) -> Result<bool, SagaError>;
}

#[async_trait]
pub trait SagaDefinition: Send + Sync {
    fn name(&self) -> &str;

    /// Instance id for `input`, or `None` when the input is unrelated.
    fn id_for(&self, input: &SagaInput) -> Option<String>;

    async fn plan(&self, input: &SagaInput, ctx: &dyn PlanContext) -> Result<ProcessPlan, SagaError>;

    /// Task queue override for this saga's contexts.
    fn task_queue(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ReminderSaga;

    #[async_trait]
    impl SagaDefinition for ReminderSaga {
        fn name(&self) -> &str {
            "reminder"
        }

        fn id_for(&self, input: &SagaInput) -> Option<String> {
            match input.message_type() {
                "LedgerOpened" | "EntryPosted" => input
                    .payload_str("ledgerId")
                    .map(|id| format!("{}_reminder-{id}", input.tenant_id())),
                _ => None,
            }
        }

        async fn plan(
            &self,
            input: &SagaInput,
            ctx: &dyn PlanContext,
        ) -> Result<ProcessPlan, SagaError> {
            let ledger = input
                .payload_str("ledgerId")
                .ok_or_else(|| SagaError::planning(self.name(), "missing ledgerId"))?;
            let mut plan = ProcessPlan::empty().with_command(input.follow_up(
                ctx.next_id(),
                "notify",
                json!({ "ledgerId": ledger }),
            ));
            if ctx.evaluate_condition("isLarge", &input.condition_input())? {
                plan = plan.with_delay(
                    input.follow_up(ctx.next_id(), "audit", json!({ "ledgerId": ledger })),
                    Duration::from_millis(50),
                );
            }
            Ok(plan)
        }
    }

    struct CountingContext(AtomicU64);

    #[async_trait]
    impl PlanContext for CountingContext {
        fn next_id(&self) -> MessageId {
            MessageId::from(format!("m{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }

        async fn read_events(
            &self,
            _tenant_id: &TenantId,
            _aggregate_type: &str,
            _aggregate_id: &AggregateId,
        ) -> Result<Vec<Event>, SagaError> {
            Ok(Vec::new())
        }

        fn evaluate_condition(&self, name: &str, input: &ConditionInput) -> Result<bool, SagaError> {
            match name {
                "isLarge" => Ok(input.payload["amount"].as_i64() > Some(100)),
                other => Err(SagaError::UnknownCondition(other.to_string())),
            }
        }
    }

    fn event(event_type: &str, payload: JsonValue) -> SagaInput {
        SagaInput::Event(Event {
            id: MessageId::from("e1"),
            tenant_id: TenantId::from("t1"),
            event_type: event_type.to_string(),
            aggregate_id: AggregateId::from("l1"),
            aggregate_type: "ledger".to_string(),
            version: 1,
            payload,
            metadata: Some(Metadata::now().with_correlation("tx-1")),
        })
    }

    #[test]
    fn id_for_is_deterministic_and_selective() {
        let saga = ReminderSaga;
        let input = event("EntryPosted", json!({ "ledgerId": "l1", "amount": 1 }));
        assert_eq!(saga.id_for(&input), Some("t1_reminder-l1".to_string()));
        assert_eq!(saga.id_for(&input), saga.id_for(&input.clone()));
        assert_eq!(saga.id_for(&event("Unrelated", json!({ "ledgerId": "l1" }))), None);
    }

    #[tokio::test]
    async fn plan_emits_commands_with_inherited_metadata() {
        let saga = ReminderSaga;
        let ctx = CountingContext(AtomicU64::new(0));
        let input = event("EntryPosted", json!({ "ledgerId": "l1", "amount": 500 }));

        let plan = saga.plan(&input, &ctx).await.unwrap();
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.delays.len(), 1);
        assert_eq!(plan.delays[0].delay, Duration::from_millis(50));

        let notify = &plan.commands[0];
        assert_eq!(notify.id.as_str(), "m0");
        assert_eq!(notify.tenant_id.as_str(), "t1");
        let meta = notify.metadata.as_ref().unwrap();
        assert_eq!(meta.causation_id.as_deref(), Some("e1"));
        assert_eq!(meta.correlation_id.as_deref(), Some("tx-1"));
    }

    #[tokio::test]
    async fn planning_failures_are_errors_not_panics() {
        let saga = ReminderSaga;
        let ctx = CountingContext(AtomicU64::new(0));
        let err = saga
            .plan(&event("EntryPosted", json!({ "amount": 1 })), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Planning { .. }));
    }
}
