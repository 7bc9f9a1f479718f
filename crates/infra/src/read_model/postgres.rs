//! Postgres-backed read model.
//!
//! Records live in one `read_models` table keyed by
//! `(tenant_id, model, id)`, so several read models can share a pool. Every
//! query is scoped by `tenant_id` and `model`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use strata_core::TenantId;

use super::{ReadModelError, ReadModelUpdater};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS read_models (
        tenant_id TEXT NOT NULL,
        model TEXT NOT NULL,
        id TEXT NOT NULL,
        data JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, model, id)
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresReadModel {
    pool: Arc<PgPool>,
    model: String,
}

impl PostgresReadModel {
    pub fn new(pool: PgPool, model: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            model: model.into(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ReadModelError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(model = %self.model), err)]
    pub async fn get(&self, tenant_id: &TenantId, id: &str) -> Result<Option<JsonValue>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT data FROM read_models
            WHERE tenant_id = $1 AND model = $2 AND id = $3
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&self.model)
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|r| r.try_get::<JsonValue, _>("data"))
            .transpose()
            .map_err(storage_error)
    }

    /// Drop every record of a tenant for this model (rebuild support).
    #[instrument(skip(self), fields(model = %self.model), err)]
    pub async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<u64, ReadModelError> {
        let result = sqlx::query("DELETE FROM read_models WHERE tenant_id = $1 AND model = $2")
            .bind(tenant_id.as_str())
            .bind(&self.model)
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReadModelUpdater for PostgresReadModel {
    #[instrument(skip(self, data), fields(model = %self.model), err)]
    async fn upsert(&self, tenant_id: &TenantId, id: &str, data: JsonValue) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            INSERT INTO read_models (tenant_id, model, id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, model, id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&self.model)
        .bind(id)
        .bind(data)
        .execute(&*self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(model = %self.model), err)]
    async fn remove(&self, tenant_id: &TenantId, id: &str) -> Result<(), ReadModelError> {
        sqlx::query("DELETE FROM read_models WHERE tenant_id = $1 AND model = $2 AND id = $3")
            .bind(tenant_id.as_str())
            .bind(&self.model)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

fn storage_error(err: sqlx::Error) -> ReadModelError {
    ReadModelError::Storage(err.to_string())
}
