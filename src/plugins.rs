use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::secrets::SecretStore;
use crate::types::Plugin;

pub async fn load_plugin(db: &PgPool, organization_id: &str, service: &str) -> ApiResult<Option<Plugin>> {
    let row = sqlx::query(
        "SELECT id, organization_id, service, secret_name FROM plugins WHERE organization_id = $1 AND service = $2",
    )
    .bind(organization_id)
    .bind(service)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| Plugin {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        service: row.get("service"),
        secret_name: row.get("secret_name"),
    }))
}

pub async fn upsert_plugin(
    db: &PgPool,
    organization_id: &str,
    service: &str,
    secret_name: &str,
) -> ApiResult<Plugin> {
    sqlx::query(
        "INSERT INTO plugins (id, organization_id, service, secret_name, created_at) VALUES ($1,$2,$3,$4,$5) \
         ON CONFLICT (organization_id, service) DO UPDATE SET secret_name = EXCLUDED.secret_name",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(organization_id)
    .bind(service)
    .bind(secret_name)
    .bind(now_iso())
    .execute(db)
    .await?;
    load_plugin(db, organization_id, service)
        .await?
        .ok_or_else(|| ApiError::internal("plugin upsert failed"))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let plugin = load_plugin(&state.db, &org_id, &service).await?;
    Ok(Json(json!({ "plugin": plugin })))
}

/// Drops the credentials a plugin points at.
pub async fn forget_credentials(secrets: &dyn SecretStore, plugin: &Plugin) -> ApiResult<()> {
    secrets.delete(&plugin.secret_name).await
}

/// Disconnects a service and deletes its stored credentials.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let plugin = load_plugin(&state.db, &org_id, &service)
        .await?
        .ok_or_else(|| ApiError::not_found("Plugin not found"))?;
    forget_credentials(state.secrets.as_ref(), &plugin).await?;
    sqlx::query("DELETE FROM plugins WHERE id = $1")
        .bind(&plugin.id)
        .execute(&state.db)
        .await?;
    info!(organization_id = %org_id, service = %service, "plugin removed");
    Ok(StatusCode::NO_CONTENT)
}
