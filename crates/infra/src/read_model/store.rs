use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use strata_core::TenantId;

use super::{ReadModelError, ReadModelUpdater};

/// In-memory tenant-isolated read model for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadModel {
    inner: RwLock<HashMap<(TenantId, String), JsonValue>>,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &TenantId, id: &str) -> Option<JsonValue> {
        let map = self.inner.read().ok()?;
        map.get(&(tenant_id.clone(), id.to_string())).cloned()
    }

    /// All records of one tenant, ordered by id.
    pub fn list(&self, tenant_id: &TenantId) -> Vec<(String, JsonValue)> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };
        let mut rows: Vec<_> = map
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|((_, id), data)| (id.clone(), data.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drop every record of a tenant (rebuild support).
    pub fn clear_tenant(&self, tenant_id: &TenantId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, _), _| t != tenant_id);
        }
    }
}

#[async_trait]
impl ReadModelUpdater for InMemoryReadModel {
    async fn upsert(&self, tenant_id: &TenantId, id: &str, data: JsonValue) -> Result<(), ReadModelError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| ReadModelError::Storage("read model lock poisoned".to_string()))?;
        map.insert((tenant_id.clone(), id.to_string()), data);
        Ok(())
    }

    async fn remove(&self, tenant_id: &TenantId, id: &str) -> Result<(), ReadModelError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| ReadModelError::Storage("read model lock poisoned".to_string()))?;
        map.remove(&(tenant_id.clone(), id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let store = InMemoryReadModel::new();
        let t1 = TenantId::from("t1");
        let t2 = TenantId::from("t2");
        store.upsert(&t1, "o1", json!({ "status": "pending" })).await.unwrap();
        store.upsert(&t2, "o1", json!({ "status": "shipped" })).await.unwrap();

        assert_eq!(store.get(&t1, "o1"), Some(json!({ "status": "pending" })));
        assert_eq!(store.list(&t2).len(), 1);

        store.remove(&t1, "o1").await.unwrap();
        assert_eq!(store.get(&t1, "o1"), None);
        assert!(store.get(&t2, "o1").is_some());

        store.clear_tenant(&t2);
        assert!(store.list(&t2).is_empty());
    }
}
