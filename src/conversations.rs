//! Conversations between a visitor and the organization.
//!
//! Three audiences touch this table: the widget (authenticated by contact
//! session), operators (bearer token) and the support agent's tools, which
//! address a conversation by its thread.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::contact_sessions::{load_contact_session, require_valid_contact_session};
use crate::error::{ApiError, ApiResult};
use crate::messages::{create_thread, last_message, save_message};
use crate::realtime::publish_conversation;
use crate::types::{
    ContactSession, Conversation, ConversationStatus, MessageRole, PageRequest, ThreadMessage,
};
use crate::widget_settings::greeting_for;

const CONVERSATION_COLUMNS: &str =
    "c.id, c.seq, c.thread_id, c.organization_id, c.contact_session_id, c.status, c.created_at, c.updated_at";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub organization_id: String,
    pub contact_session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSessionQuery {
    pub contact_session_id: String,
    pub num_items: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorListQuery {
    pub status: Option<String>,
    pub num_items: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    /// Omitted means "advance to the next status", as the dashboard toggle does.
    #[serde(default)]
    pub status: Option<ConversationStatus>,
}

impl UpdateStatusBody {
    pub fn target_status(&self, current: ConversationStatus) -> ConversationStatus {
        self.status.unwrap_or_else(|| current.next())
    }
}

pub(crate) fn parse_conversation_row(row: &PgRow) -> Conversation {
    let status: String = row.get("status");
    Conversation {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        organization_id: row.get("organization_id"),
        contact_session_id: row.get("contact_session_id"),
        status: status.parse().unwrap_or(ConversationStatus::Unresolved),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn load_conversation(db: &PgPool, id: &str) -> ApiResult<Option<Conversation>> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(row.as_ref().map(parse_conversation_row))
}

pub async fn get_by_thread_id(db: &PgPool, thread_id: &str) -> ApiResult<Option<Conversation>> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.thread_id = $1"
    ))
    .bind(thread_id)
    .fetch_optional(db)
    .await?;
    Ok(row.as_ref().map(parse_conversation_row))
}

/// Persists a status change and broadcasts the updated conversation.
pub async fn set_status(
    state: &AppState,
    conversation_id: &str,
    status: ConversationStatus,
) -> ApiResult<Conversation> {
    let row = sqlx::query(&format!(
        "UPDATE conversations c SET status = $1, updated_at = $2 WHERE c.id = $3 RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(status.as_str())
    .bind(now_iso())
    .bind(conversation_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Conversation not found"))?;
    let conversation = parse_conversation_row(&row);
    info!(
        conversation_id = %conversation.id,
        organization_id = %conversation.organization_id,
        status = %status,
        "conversation status changed"
    );
    publish_conversation(state, &conversation).await;
    Ok(conversation)
}

async fn set_status_by_thread(
    state: &AppState,
    thread_id: &str,
    status: ConversationStatus,
) -> ApiResult<Conversation> {
    let conversation = get_by_thread_id(&state.db, thread_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Conversation not found"))?;
    set_status(state, &conversation.id, status).await
}

pub async fn escalate(state: &AppState, thread_id: &str) -> ApiResult<Conversation> {
    set_status_by_thread(state, thread_id, ConversationStatus::Escalated).await
}

pub async fn resolve(state: &AppState, thread_id: &str) -> ApiResult<Conversation> {
    set_status_by_thread(state, thread_id, ConversationStatus::Resolved).await
}

/// Visitor access check: the conversation must exist and belong to the session.
pub fn ensure_visitor_owns(
    conversation: Option<Conversation>,
    session: &ContactSession,
) -> ApiResult<Conversation> {
    let conversation = conversation.ok_or_else(|| ApiError::not_found("Conversation not found"))?;
    if conversation.contact_session_id != session.id {
        return Err(ApiError::unauthorized(
            "Incorrect contact session for conversation",
        ));
    }
    Ok(conversation)
}

/// Operator access check shared by the private handlers.
pub fn ensure_same_organization(conversation: &Conversation, org_id: &str) -> ApiResult<()> {
    if conversation.organization_id != org_id {
        return Err(ApiError::unauthorized("Invalid Organization ID"));
    }
    Ok(())
}

async fn load_for_operator(db: &PgPool, id: &str, org_id: &str) -> ApiResult<Conversation> {
    let conversation = load_conversation(db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Conversation not found"))?;
    ensure_same_organization(&conversation, org_id)?;
    Ok(conversation)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConversationBody>,
) -> ApiResult<impl IntoResponse> {
    let session = require_valid_contact_session(&state.db, &body.contact_session_id).await?;
    if session.organization_id != body.organization_id {
        return Err(ApiError::unauthorized("Invalid Organization ID"));
    }

    let thread_id = create_thread(&state.db, &session.id).await?;
    let greeting = greeting_for(&state.db, &session.organization_id).await?;
    save_message(&state, &thread_id, MessageRole::Assistant, &greeting, None).await?;

    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    sqlx::query(
        "INSERT INTO conversations (id, thread_id, organization_id, contact_session_id, status, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$6)",
    )
    .bind(&id)
    .bind(&thread_id)
    .bind(&session.organization_id)
    .bind(&session.id)
    .bind(ConversationStatus::Unresolved.as_str())
    .bind(&now)
    .execute(&state.db)
    .await?;

    let conversation = Conversation {
        id: id.clone(),
        thread_id,
        organization_id: session.organization_id.clone(),
        contact_session_id: session.id.clone(),
        status: ConversationStatus::Unresolved,
        created_at: now.clone(),
        updated_at: now,
    };
    info!(conversation_id = %id, organization_id = %conversation.organization_id, "conversation created");
    publish_conversation(&state, &conversation).await;
    Ok((StatusCode::CREATED, Json(json!({ "conversationId": id }))))
}

pub async fn get_one_public(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ContactSessionQuery>,
) -> ApiResult<impl IntoResponse> {
    let session = require_valid_contact_session(&state.db, &query.contact_session_id).await?;
    let conversation = load_conversation(&state.db, &conversation_id).await?;
    let conversation = ensure_visitor_owns(conversation, &session)?;
    Ok(Json(json!({
        "_id": conversation.id,
        "threadId": conversation.thread_id,
        "status": conversation.status,
    })))
}

/// The visitor's inbox: their conversations, newest first, with the last message.
pub async fn get_many_public(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactSessionQuery>,
) -> ApiResult<impl IntoResponse> {
    let session = require_valid_contact_session(&state.db, &query.contact_session_id).await?;
    let request = PageRequest::new(query.num_items, query.cursor.as_deref());
    let rows = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
         WHERE c.contact_session_id = $1 AND c.seq < $2 ORDER BY c.seq DESC LIMIT $3"
    ))
    .bind(&session.id)
    .bind(request.seq_bound())
    .bind(request.fetch_limit())
    .fetch_all(&state.db)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let seq: i64 = row.get("seq");
        let conversation = parse_conversation_row(&row);
        let last = last_message(&state.db, &conversation.thread_id).await?;
        items.push((
            seq,
            json!({
                "_id": conversation.id,
                "_creationTime": conversation.created_at,
                "status": conversation.status,
                "organizationId": conversation.organization_id,
                "threadId": conversation.thread_id,
                "lastMessage": last,
            }),
        ));
    }
    Ok(Json(request.finish(items)))
}

/// Operator inbox. Conversations whose contact session is gone are left out.
pub async fn get_many(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<OperatorListQuery>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty() && *s != "all")
        .map(str::parse::<ConversationStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let request = PageRequest::new(query.num_items, query.cursor.as_deref());

    let rows = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
         JOIN contact_sessions s ON s.id = c.contact_session_id \
         WHERE c.organization_id = $1 AND ($2::text IS NULL OR c.status = $2) AND c.seq < $3 \
         ORDER BY c.seq DESC LIMIT $4"
    ))
    .bind(&org_id)
    .bind(status.map(ConversationStatus::as_str))
    .bind(request.seq_bound())
    .bind(request.fetch_limit())
    .fetch_all(&state.db)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let seq: i64 = row.get("seq");
        let conversation = parse_conversation_row(&row);
        let Some(session) = load_contact_session(&state.db, &conversation.contact_session_id).await? else {
            continue;
        };
        let last = last_message(&state.db, &conversation.thread_id).await?;
        items.push((seq, operator_view(&conversation, &session, last)));
    }
    Ok(Json(request.finish(items)))
}

fn operator_view(
    conversation: &Conversation,
    session: &ContactSession,
    last: Option<ThreadMessage>,
) -> Value {
    let mut value = serde_json::to_value(conversation).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("contactSession".into(), json!(session));
        map.insert("lastMessage".into(), json!(last));
    }
    value
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let conversation = load_for_operator(&state.db, &conversation_id, &org_id).await?;
    let session = load_contact_session(&state.db, &conversation.contact_session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Contact Session not found"))?;
    let mut value = serde_json::to_value(&conversation)?;
    if let Value::Object(map) = &mut value {
        map.insert("contactSession".into(), serde_json::to_value(&session)?);
    }
    Ok(Json(value))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<UpdateStatusBody>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let conversation = load_for_operator(&state.db, &conversation_id, &org_id).await?;
    let status = body.target_status(conversation.status);
    let updated = set_status(&state, &conversation.id, status).await?;
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(org: &str, session: &str) -> Conversation {
        Conversation {
            id: "conv_1".into(),
            thread_id: "thread_1".into(),
            organization_id: org.into(),
            contact_session_id: session.into(),
            status: ConversationStatus::Unresolved,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn session(id: &str) -> ContactSession {
        ContactSession {
            id: id.into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            organization_id: "org_1".into(),
            expires_at: i64::MAX,
            metadata: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn status_update_without_status_toggles() {
        let body: UpdateStatusBody = serde_json::from_str("{}").unwrap();
        assert_eq!(
            body.target_status(ConversationStatus::Unresolved),
            ConversationStatus::Escalated
        );
        assert_eq!(
            body.target_status(ConversationStatus::Resolved),
            ConversationStatus::Unresolved
        );

        let body: UpdateStatusBody = serde_json::from_str(r#"{"status":"resolved"}"#).unwrap();
        assert_eq!(
            body.target_status(ConversationStatus::Unresolved),
            ConversationStatus::Resolved
        );
        assert!(serde_json::from_str::<UpdateStatusBody>(r#"{"status":"archived"}"#).is_err());
    }

    #[test]
    fn cross_tenant_access_is_rejected() {
        let conv = conversation("org_1", "cs_1");
        assert!(ensure_same_organization(&conv, "org_1").is_ok());
        let err = ensure_same_organization(&conv, "org_2").unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(err.to_string().contains("Invalid Organization ID"));
    }

    #[test]
    fn visitor_must_own_conversation() {
        let err = ensure_visitor_owns(None, &session("cs_1")).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.to_string().contains("Conversation not found"));

        let err = ensure_visitor_owns(Some(conversation("org_1", "cs_1")), &session("cs_2")).unwrap_err();
        assert!(err
            .to_string()
            .contains("Incorrect contact session for conversation"));

        let ok = ensure_visitor_owns(Some(conversation("org_1", "cs_1")), &session("cs_1")).unwrap();
        assert_eq!(ok.id, "conv_1");
    }

    #[test]
    fn operator_view_embeds_session_and_last_message() {
        let view = operator_view(
            &conversation("org_1", "cs_1"),
            &session("cs_1"),
            Some(ThreadMessage {
                id: "m_1".into(),
                thread_id: "thread_1".into(),
                role: MessageRole::User,
                content: "hi".into(),
                agent_name: None,
                created_at: String::new(),
            }),
        );
        assert_eq!(view["_id"], "conv_1");
        assert_eq!(view["status"], "unresolved");
        assert_eq!(view["contactSession"]["_id"], "cs_1");
        assert_eq!(view["lastMessage"]["content"], "hi");
    }

    #[test]
    fn status_body_rejects_unknown_values() {
        assert!(serde_json::from_value::<UpdateStatusBody>(json!({ "status": "open" })).is_err());
        let body: UpdateStatusBody = serde_json::from_value(json!({ "status": "escalated" })).unwrap();
        assert_eq!(body.status, Some(ConversationStatus::Escalated));
    }
}
