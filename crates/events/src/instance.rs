//! Type-erased bridge between typed aggregates and the JSON message model.
//!
//! The registry and the router work with `Command`/`Event` values whose
//! payloads are JSON. Each typed [`Aggregate`] is exposed through two object
//! safe traits:
//!
//! - [`AggregateKind`]: the static side (`create`, `rehydrate`, `restore`).
//! - [`AggregateInstance`]: a live instance (`handle_command`, `apply_event`).
//!
//! Decoding goes through the aggregate's tagged enums: the message type tag
//! selects the variant, the payload fills it.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use strata_core::{Aggregate, AggregateId, ApplyMode, DomainError, DomainResult, Recorded};

use crate::message::{Command, Event};

/// An event decided by an aggregate, not yet assigned a stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: JsonValue,
}

/// Serialized aggregate state plus the schema version it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotState {
    pub state: JsonValue,
    pub schema_version: u32,
}

/// A live aggregate instance behind a trait object.
pub trait AggregateInstance: fmt::Debug + Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    fn id(&self) -> &AggregateId;

    fn version(&self) -> u64;

    /// Decide events for `command` without mutating the instance.
    fn handle_command(&self, command: &Command) -> DomainResult<Vec<NewEvent>>;

    fn apply_event(&mut self, event: &Event, mode: ApplyMode) -> DomainResult<()>;

    fn snapshot_state(&self) -> DomainResult<SnapshotState>;

    fn clone_box(&self) -> Box<dyn AggregateInstance>;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn AggregateInstance> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Static operations of an aggregate type.
pub trait AggregateKind: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    fn command_types(&self) -> &'static [&'static str];

    fn event_types(&self) -> &'static [&'static str];

    fn empty(&self, id: AggregateId) -> Box<dyn AggregateInstance>;

    fn target_id(&self, command: &Command) -> DomainResult<AggregateId>;

    /// A fresh (version 0) instance for the aggregate `command` targets.
    fn create(&self, command: &Command) -> DomainResult<Box<dyn AggregateInstance>>;

    /// Replay a full history. Fails with `EmptyStream` on no events.
    fn rehydrate(&self, events: &[Event]) -> DomainResult<Box<dyn AggregateInstance>>;

    fn restore(
        &self,
        id: AggregateId,
        version: u64,
        state: JsonValue,
        schema_version: u32,
    ) -> DomainResult<Box<dyn AggregateInstance>>;
}

/// [`AggregateKind`] for the typed aggregate `A`.
pub struct KindOf<A>(PhantomData<fn() -> A>);

impl<A> KindOf<A> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<A> Default for KindOf<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for KindOf<A>
where
    A: Aggregate,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KindOf").field(&A::AGGREGATE_TYPE).finish()
    }
}

/// Rebuild `{"type": .., "payload": ..}` and decode it into a tagged enum.
///
/// Unit variants carry no payload key, so a null payload is omitted.
pub(crate) fn decode_tagged<T: DeserializeOwned>(type_tag: &str, payload: &JsonValue) -> DomainResult<T> {
    let mut obj = Map::new();
    obj.insert("type".to_string(), JsonValue::String(type_tag.to_string()));
    if !payload.is_null() {
        obj.insert("payload".to_string(), payload.clone());
    }
    serde_json::from_value(JsonValue::Object(obj))
        .map_err(|e| DomainError::malformed(format!("{type_tag}: {e}")))
}

/// Split a tagged enum value back into its type tag and payload.
pub(crate) fn encode_tagged<T: Serialize>(value: &T) -> DomainResult<(String, JsonValue)> {
    let encoded = serde_json::to_value(value).map_err(|e| DomainError::malformed(e.to_string()))?;
    let JsonValue::Object(mut obj) = encoded else {
        return Err(DomainError::malformed("tagged value is not an object"));
    };
    let type_tag = match obj.remove("type") {
        Some(JsonValue::String(tag)) => tag,
        _ => return Err(DomainError::malformed("tagged value has no type tag")),
    };
    let payload = obj.remove("payload").unwrap_or(JsonValue::Null);
    Ok((type_tag, payload))
}

fn decode_command<A: Aggregate>(command: &Command) -> DomainResult<A::Command> {
    if !A::command_types().contains(&command.command_type.as_str()) {
        return Err(DomainError::unknown_command(&command.command_type));
    }
    decode_tagged(&command.command_type, &command.payload)
}

fn decode_event<A: Aggregate>(event: &Event) -> DomainResult<A::Event> {
    decode_tagged(&event.event_type, &event.payload)
}

impl<A> AggregateInstance for A
where
    A: Aggregate + fmt::Debug,
{
    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn id(&self) -> &AggregateId {
        Aggregate::id(self)
    }

    fn version(&self) -> u64 {
        Aggregate::version(self)
    }

    fn handle_command(&self, command: &Command) -> DomainResult<Vec<NewEvent>> {
        let typed = decode_command::<A>(command)?;
        self.handle(&typed)?
            .iter()
            .map(|event| {
                let (event_type, payload) = encode_tagged(event)?;
                Ok(NewEvent { event_type, payload })
            })
            .collect()
    }

    fn apply_event(&mut self, event: &Event, mode: ApplyMode) -> DomainResult<()> {
        let typed = decode_event::<A>(event)?;
        self.apply(&typed, mode);
        Ok(())
    }

    fn snapshot_state(&self) -> DomainResult<SnapshotState> {
        let state = serde_json::to_value(self.extract_snapshot_state())
            .map_err(|e| DomainError::malformed(format!("{} snapshot: {e}", A::AGGREGATE_TYPE)))?;
        Ok(SnapshotState {
            state,
            schema_version: A::SNAPSHOT_SCHEMA_VERSION,
        })
    }

    fn clone_box(&self) -> Box<dyn AggregateInstance> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<A> AggregateKind for KindOf<A>
where
    A: Aggregate + fmt::Debug,
{
    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn command_types(&self) -> &'static [&'static str] {
        A::command_types()
    }

    fn event_types(&self) -> &'static [&'static str] {
        A::event_types()
    }

    fn empty(&self, id: AggregateId) -> Box<dyn AggregateInstance> {
        Box::new(A::empty(id))
    }

    fn target_id(&self, command: &Command) -> DomainResult<AggregateId> {
        A::target_id(&decode_command::<A>(command)?)
    }

    fn create(&self, command: &Command) -> DomainResult<Box<dyn AggregateInstance>> {
        Ok(Box::new(A::create(&decode_command::<A>(command)?)?))
    }

    fn rehydrate(&self, events: &[Event]) -> DomainResult<Box<dyn AggregateInstance>> {
        let recorded = events
            .iter()
            .map(|event| {
                Ok(Recorded {
                    aggregate_id: event.aggregate_id.clone(),
                    version: event.version,
                    event: decode_event::<A>(event)?,
                })
            })
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(Box::new(A::rehydrate(recorded)?))
    }

    fn restore(
        &self,
        id: AggregateId,
        version: u64,
        state: JsonValue,
        schema_version: u32,
    ) -> DomainResult<Box<dyn AggregateInstance>> {
        Ok(Box::new(A::restore(id, version, state, schema_version)?))
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_variant_events_encode_with_null_payload() {
        let (tag, payload) = encode_tagged(&LedgerEvent::LedgerOpened).unwrap();
        assert_eq!(tag, "LedgerOpened");
        assert_eq!(payload, JsonValue::Null);

        let decoded: LedgerEvent = decode_tagged(&tag, &payload).unwrap();
        assert_eq!(decoded, LedgerEvent::LedgerOpened);
    }

    #[test]
    fn handle_command_decodes_by_type_tag() {
        let kind = KindOf::<Ledger>::new();
        let ledger = kind.create(&open("l1")).unwrap();
        assert_eq!(ledger.id().as_str(), "l1");
        assert_eq!(ledger.version(), 0);

        let events = ledger.handle_command(&open("l1")).unwrap();
        assert_eq!(
            events,
            vec![NewEvent {
                event_type: "LedgerOpened".to_string(),
                payload: JsonValue::Null
            }]
        );
    }

    #[test]
    fn foreign_command_types_are_unknown() {
        let ledger = KindOf::<Ledger>::new().empty(AggregateId::from("l1"));
        let cmd = Command::new(tenant(), "closeLedger", json!({ "ledgerId": "l1" }));
        assert_eq!(
            ledger.handle_command(&cmd).unwrap_err(),
            DomainError::UnknownCommand("closeLedger".to_string())
        );
    }

    #[test]
    fn malformed_payload_is_reported() {
        let ledger = KindOf::<Ledger>::new().empty(AggregateId::from("l1"));
        let cmd = Command::new(tenant(), "postEntry", json!({ "ledgerId": "l1", "amount": "x" }));
        assert!(matches!(
            ledger.handle_command(&cmd),
            Err(DomainError::MalformedPayload(_))
        ));
    }

    #[test]
    fn rehydrate_replays_stored_events() {
        let kind = KindOf::<Ledger>::new();
        let events = vec![
            stored("l1", 1, "LedgerOpened", JsonValue::Null),
            stored("l1", 2, "EntryPosted", json!({ "amount": 5 })),
            stored("l1", 3, "EntryPosted", json!({ "amount": -2 })),
        ];
        let ledger = kind.rehydrate(&events).unwrap();
        assert_eq!(ledger.version(), 3);
        let typed = ledger.as_any().downcast_ref::<Ledger>().unwrap();
        assert_eq!(typed.balance, 3);
        assert!(matches!(kind.rehydrate(&[]), Err(DomainError::EmptyStream)));
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let kind = KindOf::<Ledger>::new();
        let ledger = kind
            .rehydrate(&[
                stored("l1", 1, "LedgerOpened", JsonValue::Null),
                stored("l1", 2, "EntryPosted", json!({ "amount": 7 })),
            ])
            .unwrap();
        let snapshot = ledger.snapshot_state().unwrap();
        assert_eq!(snapshot.schema_version, 1);

        let restored = kind
            .restore(ledger.id().clone(), ledger.version(), snapshot.state, snapshot.schema_version)
            .unwrap();
        assert_eq!(restored.version(), 2);
        assert_eq!(
            restored.as_any().downcast_ref::<Ledger>(),
            ledger.as_any().downcast_ref::<Ledger>()
        );
    }

    #[test]
    fn new_events_bump_the_instance_version() {
        let mut ledger = KindOf::<Ledger>::new().empty(AggregateId::from("l1"));
        ledger
            .apply_event(&stored("l1", 1, "LedgerOpened", JsonValue::Null), ApplyMode::New)
            .unwrap();
        assert_eq!(ledger.version(), 1);
    }
}
