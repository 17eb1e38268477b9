//! Third-party credentials per organization.
//!
//! Handlers only see the `SecretStore` trait. The bundled implementation keeps
//! values in the `secrets` table, which nothing else reads.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::info;

use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::plugins::upsert_plugin;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> ApiResult<Option<String>>;
    async fn upsert(&self, name: &str, value: &str) -> ApiResult<()>;
    async fn delete(&self, name: &str) -> ApiResult<()>;
}

pub struct PgSecretStore {
    db: PgPool,
}

impl PgSecretStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn get(&self, name: &str) -> ApiResult<Option<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT value FROM secrets WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn upsert(&self, name: &str, value: &str) -> ApiResult<()> {
        let now = now_iso();
        sqlx::query(
            "INSERT INTO secrets (name, value, created_at, updated_at) VALUES ($1,$2,$3,$3) \
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(name)
        .bind(value)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> ApiResult<()> {
        sqlx::query("DELETE FROM secrets WHERE name = $1")
            .bind(name)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

pub fn secret_name(organization_id: &str, service: &str) -> String {
    format!("tenant/{organization_id}/{service}")
}

/// `None` for a missing, empty or malformed secret string.
pub fn parse_secret_string<T: DeserializeOwned>(secret: Option<&str>) -> Option<T> {
    let raw = secret?.trim();
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[derive(Debug, Deserialize)]
pub struct UpsertSecretBody {
    pub service: String,
    pub value: Value,
}

pub const SUPPORTED_SERVICES: [&str; 1] = ["vapi"];

/// Stores the credentials and registers the organization's plugin.
pub async fn upsert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpsertSecretBody>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let service = body.service.trim().to_ascii_lowercase();
    if !SUPPORTED_SERVICES.contains(&service.as_str()) {
        return Err(ApiError::bad_request(format!("Unsupported service: {service}")));
    }
    if !body.value.is_object() {
        return Err(ApiError::bad_request("value must be an object"));
    }
    let name = secret_name(&org_id, &service);
    state
        .secrets
        .upsert(&name, &serde_json::to_string(&body.value)?)
        .await?;
    let plugin = upsert_plugin(&state.db, &org_id, &service, &name).await?;
    info!(organization_id = %org_id, service = %service, "secret stored");
    Ok(Json(json!({ "plugin": plugin })))
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySecretStore {
    values: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> ApiResult<Option<String>> {
        Ok(self.values.lock().await.get(name).cloned())
    }

    async fn upsert(&self, name: &str, value: &str) -> ApiResult<()> {
        self.values
            .lock()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> ApiResult<()> {
        self.values.lock().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Keys {
        public_api_key: String,
    }

    #[test]
    fn names_are_scoped_by_tenant_and_service() {
        assert_eq!(secret_name("org_1", "vapi"), "tenant/org_1/vapi");
    }

    #[test]
    fn parse_rejects_empty_and_invalid() {
        assert_eq!(parse_secret_string::<Keys>(None), None);
        assert_eq!(parse_secret_string::<Keys>(Some("  ")), None);
        assert_eq!(parse_secret_string::<Keys>(Some("{not json")), None);
        assert_eq!(
            parse_secret_string::<Keys>(Some(r#"{"publicApiKey":"pk"}"#)),
            Some(Keys {
                public_api_key: "pk".into()
            })
        );
    }

    #[tokio::test]
    async fn store_trait_object_round_trip() {
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::default());
        store.upsert("tenant/o/vapi", "{\"a\":1}").await.unwrap();
        store.upsert("tenant/o/vapi", "{\"a\":2}").await.unwrap();
        assert_eq!(
            store.get("tenant/o/vapi").await.unwrap().as_deref(),
            Some("{\"a\":2}")
        );
        store.delete("tenant/o/vapi").await.unwrap();
        assert!(store.get("tenant/o/vapi").await.unwrap().is_none());
    }
}
