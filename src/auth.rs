//! Operator identity.
//!
//! Dashboard requests carry `Authorization: Bearer <token>`; the token
//! resolves to an operator and the organization they act for. Register and
//! login are a minimal local stand-in for a hosted identity provider.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use bcrypt::{hash, verify, DEFAULT_COST};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::app::{now_iso, AppState};
use crate::error::{ApiError, ApiResult};
use crate::types::OperatorIdentity;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub name: String,
    #[serde(default)]
    pub family_name: String,
    pub email: String,
    pub password: String,
    pub organization_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub async fn identity_for_token(db: &PgPool, token: &str) -> ApiResult<Option<OperatorIdentity>> {
    let row = sqlx::query(
        "SELECT o.id, o.name, o.family_name, o.email, t.organization_id \
         FROM auth_tokens t JOIN operators o ON o.id = t.operator_id \
         WHERE t.token = $1",
    )
    .bind(token)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| OperatorIdentity {
        operator_id: row.get("id"),
        name: row.get("name"),
        family_name: row.get("family_name"),
        email: row.get("email"),
        organization_id: row.get("organization_id"),
    }))
}

pub async fn require_identity(state: &AppState, headers: &HeaderMap) -> ApiResult<OperatorIdentity> {
    let token = bearer_token(headers).ok_or_else(|| ApiError::unauthorized("Identity not found"))?;
    identity_for_token(&state.db, &token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Identity not found"))
}

/// Organization the identity acts for; an identity outside any organization is rejected.
pub fn require_organization(identity: &OperatorIdentity) -> ApiResult<String> {
    let org_id = identity.organization_id.trim();
    if org_id.is_empty() {
        return Err(ApiError::unauthorized(
            "Organization ID not found in identity",
        ));
    }
    Ok(org_id.to_string())
}

/// Identity plus organization, the preamble of every private handler.
pub async fn require_operator(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<(OperatorIdentity, String)> {
    let identity = require_identity(state, headers).await?;
    let org_id = require_organization(&identity)?;
    Ok((identity, org_id))
}

async fn issue_token(db: &PgPool, identity: &OperatorIdentity) -> ApiResult<String> {
    let token = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO auth_tokens (token, operator_id, organization_id, created_at) VALUES ($1,$2,$3,$4)",
    )
    .bind(&token)
    .bind(&identity.operator_id)
    .bind(&identity.organization_id)
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(token)
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&body.email);
    let name = body.name.trim().to_string();
    let organization_name = body.organization_name.trim().to_string();
    if email.is_empty() || name.is_empty() || organization_name.is_empty() {
        return Err(ApiError::bad_request(
            "name, email and organizationName are required",
        ));
    }
    if body.password.len() < 8 {
        return Err(ApiError::bad_request(
            "password must be at least 8 characters",
        ));
    }
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM operators WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.db)
        .await?
        > 0;
    if exists {
        return Err(ApiError::bad_request("email already registered"));
    }
    let password_hash = hash(&body.password, DEFAULT_COST)
        .map_err(|err| ApiError::internal(format!("failed to hash password: {err}")))?;

    let now = now_iso();
    let organization_id = Uuid::new_v4().to_string();
    let identity = OperatorIdentity {
        operator_id: Uuid::new_v4().to_string(),
        name,
        family_name: body.family_name.trim().to_string(),
        email,
        organization_id: organization_id.clone(),
    };

    let mut tx = state.db.begin().await?;
    sqlx::query("INSERT INTO organizations (id, name, created_at) VALUES ($1,$2,$3)")
        .bind(&organization_id)
        .bind(&organization_name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO operators (id, organization_id, name, family_name, email, password_hash, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&identity.operator_id)
    .bind(&organization_id)
    .bind(&identity.name)
    .bind(&identity.family_name)
    .bind(&identity.email)
    .bind(&password_hash)
    .bind(&now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let token = issue_token(&state.db, &identity).await?;
    info!(organization_id = %organization_id, operator_id = %identity.operator_id, "registered organization");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "token": token, "identity": identity })),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&body.email);
    let row = sqlx::query(
        "SELECT id, organization_id, name, family_name, email, password_hash FROM operators WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;

    let password_hash: String = row.get("password_hash");
    if !verify(&body.password, &password_hash).unwrap_or(false) {
        return Err(ApiError::unauthorized("invalid credentials"));
    }
    let identity = OperatorIdentity {
        operator_id: row.get("id"),
        name: row.get("name"),
        family_name: row.get("family_name"),
        email: row.get("email"),
        organization_id: row.get("organization_id"),
    };
    sqlx::query("UPDATE operators SET last_login_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(&identity.operator_id)
        .execute(&state.db)
        .await?;
    let token = issue_token(&state.db, &identity).await?;
    Ok(Json(json!({ "token": token, "identity": identity })))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let identity = require_identity(&state, &headers).await?;
    Ok(Json(json!({ "identity": identity })))
}
