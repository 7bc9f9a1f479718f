use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use strata_events::{Event, EventHandler, EventHandlerError};

use super::ReadModelUpdater;

/// What a projection wants done to one read model record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadModelChange {
    Upsert { id: String, data: JsonValue },
    Remove { id: String },
}

type ProjectFn = Arc<dyn Fn(&Event) -> Option<ReadModelChange> + Send + Sync>;

/// Event handler that feeds a read model through a projection function.
///
/// Only events whose type is listed are offered to the projection; `None`
/// from the projection means nothing to write.
#[derive(Clone)]
pub struct ReadModelProjector {
    name: String,
    event_types: Vec<String>,
    project: ProjectFn,
    updater: Arc<dyn ReadModelUpdater>,
}

impl fmt::Debug for ReadModelProjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadModelProjector")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

impl ReadModelProjector {
    pub fn new(
        name: impl Into<String>,
        event_types: &[&str],
        updater: Arc<dyn ReadModelUpdater>,
        project: impl Fn(&Event) -> Option<ReadModelChange> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            project: Arc::new(project),
            updater,
        }
    }
}

#[async_trait]
impl EventHandler for ReadModelProjector {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_event(&self, event: &Event) -> bool {
        self.event_types.iter().any(|t| *t == event.event_type)
    }

    async fn handle(&self, event: &Event) -> Result<(), EventHandlerError> {
        let result = match (self.project)(event) {
            None => return Ok(()),
            Some(ReadModelChange::Upsert { id, data }) => {
                self.updater.upsert(&event.tenant_id, &id, data).await
            }
            Some(ReadModelChange::Remove { id }) => self.updater.remove(&event.tenant_id, &id).await,
        };
        result.map_err(|e| EventHandlerError::new(self.name.clone(), event, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryReadModel;
    use serde_json::json;
    use strata_core::{AggregateId, MessageId, TenantId};

    fn event(event_type: &str) -> Event {
        Event {
            id: MessageId::generate(),
            tenant_id: TenantId::from("t1"),
            event_type: event_type.into(),
            aggregate_id: AggregateId::from("o1"),
            aggregate_type: "order".into(),
            version: 1,
            payload: json!({ "orderId": "o1" }),
            metadata: None,
        }
    }

    fn projector(store: Arc<InMemoryReadModel>) -> ReadModelProjector {
        ReadModelProjector::new("orders.status", &["OrderCreated", "OrderExpired"], store, |e| {
            match e.event_type.as_str() {
                "OrderCreated" => Some(ReadModelChange::Upsert {
                    id: e.aggregate_id.to_string(),
                    data: json!({ "status": "pending", "version": e.version }),
                }),
                "OrderExpired" => Some(ReadModelChange::Remove {
                    id: e.aggregate_id.to_string(),
                }),
                _ => None,
            }
        })
    }

    #[tokio::test]
    async fn applies_projected_changes() {
        let store = Arc::new(InMemoryReadModel::new());
        let handler = projector(store.clone());
        let tenant = TenantId::from("t1");

        assert!(handler.supports_event(&event("OrderCreated")));
        assert!(!handler.supports_event(&event("OrderShipped")));

        handler.handle(&event("OrderCreated")).await.unwrap();
        assert_eq!(store.get(&tenant, "o1"), Some(json!({ "status": "pending", "version": 1 })));

        handler.handle(&event("OrderExpired")).await.unwrap();
        assert_eq!(store.get(&tenant, "o1"), None);
    }
}
