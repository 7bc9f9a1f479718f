//! Tenant-isolated read model port.
//!
//! Read models are disposable: they are rebuilt from events and written only
//! through [`ReadModelUpdater`]. [`ReadModelProjector`] adapts a projection
//! function into an event handler for the event bus.

pub mod postgres;
pub mod projector;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use strata_core::TenantId;

pub use postgres::PostgresReadModel;
pub use projector::{ReadModelChange, ReadModelProjector};
pub use store::InMemoryReadModel;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadModelError {
    #[error("read model storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ReadModelUpdater: Send + Sync {
    async fn upsert(&self, tenant_id: &TenantId, id: &str, data: JsonValue) -> Result<(), ReadModelError>;

    async fn remove(&self, tenant_id: &TenantId, id: &str) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<S> ReadModelUpdater for Arc<S>
where
    S: ReadModelUpdater + ?Sized,
{
    async fn upsert(&self, tenant_id: &TenantId, id: &str, data: JsonValue) -> Result<(), ReadModelError> {
        (**self).upsert(tenant_id, id, data).await
    }

    async fn remove(&self, tenant_id: &TenantId, id: &str) -> Result<(), ReadModelError> {
        (**self).remove(tenant_id, id).await
    }
}
