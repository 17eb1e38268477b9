//! Anonymous widget visitors.
//!
//! A contact session is created when a visitor fills the widget's name and
//! email form. It authenticates every public call until `expires_at`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::{now_iso, now_ms, AppState};
use crate::auth::{normalize_email, require_operator};
use crate::error::{ApiError, ApiResult};
use crate::organizations::{organization_exists, ValidationResult};
use crate::types::{ContactSession, ContactSessionMetadata};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactSessionBody {
    pub name: String,
    pub email: String,
    pub organization_id: String,
    #[serde(default)]
    pub metadata: Option<ContactSessionMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSessionIdBody {
    pub contact_session_id: String,
}

fn parse_contact_session_row(row: PgRow) -> ContactSession {
    let metadata = row
        .get::<Option<String>, _>("metadata")
        .and_then(|raw| serde_json::from_str::<ContactSessionMetadata>(&raw).ok());
    ContactSession {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        organization_id: row.get("organization_id"),
        expires_at: row.get("expires_at"),
        metadata,
        created_at: row.get("created_at"),
    }
}

pub fn is_plausible_email(value: &str) -> bool {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// New expiry when the remaining lifetime dropped below the threshold.
pub fn refreshed_expiry(expires_at: i64, now: i64, ttl_ms: i64, threshold_ms: i64) -> Option<i64> {
    if expires_at - now < threshold_ms {
        Some(now + ttl_ms)
    } else {
        None
    }
}

pub async fn load_contact_session(db: &PgPool, id: &str) -> ApiResult<Option<ContactSession>> {
    let row = sqlx::query(
        "SELECT id, name, email, organization_id, expires_at, metadata, created_at \
         FROM contact_sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(parse_contact_session_row))
}

/// Session that exists and has not expired, or `Unauthorized`.
pub async fn require_valid_contact_session(db: &PgPool, id: &str) -> ApiResult<ContactSession> {
    match load_contact_session(db, id).await? {
        Some(session) if !session.is_expired_at(now_ms()) => Ok(session),
        _ => Err(ApiError::unauthorized("Invalid or expired contact session")),
    }
}

pub async fn validate_contact_session(
    db: &PgPool,
    id: &str,
) -> ApiResult<(ValidationResult, Option<ContactSession>)> {
    let Some(session) = load_contact_session(db, id).await? else {
        return Ok((ValidationResult::invalid("Contact session not found"), None));
    };
    if session.is_expired_at(now_ms()) {
        return Ok((ValidationResult::invalid("Contact session expired"), None));
    }
    Ok((ValidationResult::valid(), Some(session)))
}

/// Extends an active session's lifetime; called whenever the visitor writes.
pub async fn refresh_contact_session(
    state: &AppState,
    session: &ContactSession,
) -> ApiResult<()> {
    let ttl_ms = state.settings.contact_session_ttl_hours * HOUR_MS;
    let threshold_ms = state.settings.contact_session_refresh_threshold_hours * HOUR_MS;
    if let Some(expires_at) = refreshed_expiry(session.expires_at, now_ms(), ttl_ms, threshold_ms) {
        sqlx::query("UPDATE contact_sessions SET expires_at = $1 WHERE id = $2")
            .bind(expires_at)
            .bind(&session.id)
            .execute(&state.db)
            .await?;
        debug!(contact_session_id = %session.id, expires_at, "refreshed contact session");
    }
    Ok(())
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateContactSessionBody>,
) -> ApiResult<impl IntoResponse> {
    let name = body.name.trim().to_string();
    let email = normalize_email(&body.email);
    if name.is_empty() {
        return Err(ApiError::bad_request("Name is required"));
    }
    if !is_plausible_email(&email) {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    let organization_id = body.organization_id.trim().to_string();
    if !organization_exists(&state.db, &organization_id).await? {
        return Err(ApiError::not_found("Organization not found"));
    }

    let id = Uuid::new_v4().to_string();
    let expires_at = now_ms() + state.settings.contact_session_ttl_hours * HOUR_MS;
    let metadata = body
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    sqlx::query(
        "INSERT INTO contact_sessions (id, name, email, organization_id, expires_at, metadata, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&id)
    .bind(&name)
    .bind(&email)
    .bind(&organization_id)
    .bind(expires_at)
    .bind(metadata)
    .bind(now_iso())
    .execute(&state.db)
    .await?;

    info!(contact_session_id = %id, organization_id = %organization_id, "created contact session");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "contactSessionId": id, "expiresAt": expires_at })),
    ))
}

pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContactSessionIdBody>,
) -> ApiResult<impl IntoResponse> {
    let (result, session) = validate_contact_session(&state.db, &body.contact_session_id).await?;
    Ok(Json(json!({
        "valid": result.valid,
        "reason": result.reason,
        "contactSession": session,
    })))
}

/// Operator view of a visitor session, used by the conversation side panel.
pub async fn get_for_operator(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(contact_session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let session = load_contact_session(&state.db, &contact_session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Contact session not found"))?;
    if session.organization_id != org_id {
        return Err(ApiError::unauthorized("Invalid Organization ID"));
    }
    Ok(Json(json!({ "contactSession": session })))
}
