//! Plain data contracts shared by every component.
//!
//! Field names serialize in camelCase so stored rows and ingested JSON use the
//! same shape (`tenantId`, `aggregateType`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use strata_core::{AggregateId, MessageId, TenantId, UserId};

/// Lifecycle of a command in the command log.
///
/// `pending → consumed → processed | failed`; transitions are the only
/// mutation a logged command ever sees.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Consumed,
    Processed,
    Failed,
}

impl CommandStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::Consumed)
                | (CommandStatus::Consumed, CommandStatus::Processed)
                | (CommandStatus::Consumed, CommandStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Processed | CommandStatus::Failed)
    }
}

/// Cross-cutting message metadata.
///
/// `correlation_id` threads a business transaction across commands, events and
/// sagas; `causation_id` names the message that produced this one. Both are
/// propagated, never interpreted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

impl Metadata {
    pub fn now() -> Self {
        Self {
            user_id: None,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            request_id: None,
            source: None,
            tags: Vec::new(),
            schema_version: None,
        }
    }

    /// Metadata for a message produced in reaction to `parent_id`.
    ///
    /// Causation points at the parent; correlation is inherited, or defaults
    /// to the parent id when the parent starts a new transaction.
    pub fn caused_by(parent_id: &MessageId, parent: Option<&Metadata>) -> Self {
        let mut meta = Self::now();
        meta.causation_id = Some(parent_id.to_string());
        meta.correlation_id = parent
            .and_then(|p| p.correlation_id.clone())
            .or_else(|| Some(parent_id.to_string()));
        if let Some(p) = parent {
            meta.user_id = p.user_id.clone();
            meta.request_id = p.request_id.clone();
        }
        meta
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A request to change state, addressed by type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: MessageId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Command {
    pub fn new(tenant_id: TenantId, command_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: MessageId::generate(),
            tenant_id,
            command_type: command_type.into(),
            payload,
            status: None,
            metadata: Some(Metadata::now()),
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Tenant id embedded in the payload, if the payload carries one.
    pub fn payload_tenant(&self) -> Option<&str> {
        self.payload.get("tenantId").and_then(JsonValue::as_str)
    }

    /// A string field of the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}

/// A fact recorded in an aggregate stream.
///
/// `version` is the 1-based position within the stream of
/// `(tenant_id, aggregate_type, aggregate_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: MessageId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: u64,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Event {
    /// Schema version the payload was written with (v1 when unrecorded).
    pub fn schema_version(&self) -> u32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.schema_version)
            .unwrap_or(1)
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}

/// Result of handling one command, as returned to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success { events: Vec<Event> },
    Fail { error: String, retriable: bool },
}

impl CommandOutcome {
    pub fn fail(error: impl ToString, retriable: bool) -> Self {
        Self::Fail {
            error: error.to_string(),
            retriable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success { .. })
    }

    pub fn events(&self) -> &[Event] {
        match self {
            CommandOutcome::Success { events } => events,
            CommandOutcome::Fail { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serializes_with_wire_names() {
        let cmd = Command::new(TenantId::from("t1"), "createOrder", json!({ "orderId": "o1" }))
            .with_id("c1");
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["tenantId"], "t1");
        assert_eq!(value["type"], "createOrder");
        assert_eq!(value["id"], "c1");
        assert!(value.get("status").is_none());
    }

    #[test]
    fn caused_by_defaults_correlation_to_parent() {
        let parent = MessageId::from("c1");
        let meta = Metadata::caused_by(&parent, None);
        assert_eq!(meta.causation_id.as_deref(), Some("c1"));
        assert_eq!(meta.correlation_id.as_deref(), Some("c1"));

        let inherited = Metadata::now().with_correlation("tx-9");
        let meta = Metadata::caused_by(&parent, Some(&inherited));
        assert_eq!(meta.causation_id.as_deref(), Some("c1"));
        assert_eq!(meta.correlation_id.as_deref(), Some("tx-9"));
    }

    #[test]
    fn status_transitions_follow_the_log_lifecycle() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Consumed));
        assert!(CommandStatus::Consumed.can_transition_to(CommandStatus::Failed));
        assert!(!CommandStatus::Pending.can_transition_to(CommandStatus::Processed));
        assert!(!CommandStatus::Processed.can_transition_to(CommandStatus::Consumed));
    }

    #[test]
    fn outcome_serializes_status_tag() {
        let value = serde_json::to_value(CommandOutcome::fail("nope", true)).unwrap();
        assert_eq!(value, json!({ "status": "fail", "error": "nope", "retriable": true }));
    }
}
