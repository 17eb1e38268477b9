use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::app::{now_iso, AppState};
use crate::auth::require_identity;
use crate::error::{ApiError, ApiResult};
use crate::types::User;

#[derive(Debug, Deserialize)]
pub struct AddUserBody {
    pub name: String,
}

pub fn normalize_user_name(name: &str) -> ApiResult<String> {
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    Ok(name)
}

pub async fn list_users(db: &PgPool) -> ApiResult<Vec<User>> {
    let rows = sqlx::query("SELECT id, name, created_at FROM users ORDER BY created_at ASC, id ASC")
        .fetch_all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| User {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
        .collect())
}

pub async fn get_many(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(list_users(&state.db).await?))
}

pub async fn add(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AddUserBody>,
) -> ApiResult<impl IntoResponse> {
    let identity = require_identity(&state, &headers).await?;
    let name = normalize_user_name(&body.name)?;
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO users (id, name, created_at) VALUES ($1,$2,$3)")
        .bind(&id)
        .bind(&name)
        .bind(now_iso())
        .execute(&state.db)
        .await?;
    info!(user_id = %id, operator_id = %identity.operator_id, "user added");
    Ok((StatusCode::CREATED, Json(json!({ "userId": id }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_collapsed() {
        assert_eq!(normalize_user_name("  Ada   Lovelace ").unwrap(), "Ada Lovelace");
    }

    #[test]
    fn blank_names_are_rejected() {
        let err = normalize_user_name(" \t ").unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}
