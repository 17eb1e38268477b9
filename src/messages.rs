//! Threads and their messages.
//!
//! A thread is the ordered message log behind a conversation. Visitors post
//! through the public handlers (which may run the support agent), operators
//! through the private ones.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::run_support_agent;
use crate::app::{now_iso, AppState};
use crate::auth::require_operator;
use crate::contact_sessions::{refresh_contact_session, require_valid_contact_session};
use crate::conversations::{ensure_visitor_owns, get_by_thread_id, load_conversation, set_status};
use crate::error::{ApiError, ApiResult};
use crate::prompting::ENHANCE_RESPONSE_PROMPT;
use crate::realtime::publish_message;
use crate::types::{Conversation, ConversationStatus, MessageRole, Page, PageRequest, ThreadMessage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicCreateMessageBody {
    pub thread_id: String,
    pub prompt: String,
    pub contact_session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMessagesQuery {
    pub thread_id: String,
    pub contact_session_id: String,
    pub num_items: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageBody {
    pub conversation_id: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub thread_id: String,
    pub num_items: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnhanceBody {
    pub prompt: String,
}

fn parse_message_row(row: &PgRow) -> ThreadMessage {
    ThreadMessage {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        role: MessageRole::parse(&row.get::<String, _>("role")),
        content: row.get("content"),
        agent_name: row.get("agent_name"),
        created_at: row.get("created_at"),
    }
}

pub async fn create_thread(db: &PgPool, user_id: &str) -> ApiResult<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO threads (id, user_id, created_at) VALUES ($1,$2,$3)")
        .bind(&id)
        .bind(user_id)
        .bind(now_iso())
        .execute(db)
        .await?;
    debug!(thread_id = %id, "thread created");
    Ok(id)
}

/// Appends a message and notifies subscribers of the owning conversation.
pub async fn save_message(
    state: &AppState,
    thread_id: &str,
    role: MessageRole,
    content: &str,
    agent_name: Option<&str>,
) -> ApiResult<ThreadMessage> {
    let message = ThreadMessage {
        id: Uuid::new_v4().to_string(),
        thread_id: thread_id.to_string(),
        role,
        content: content.to_string(),
        agent_name: agent_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        created_at: now_iso(),
    };
    sqlx::query(
        "INSERT INTO messages (id, thread_id, role, content, agent_name, created_at) VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&message.id)
    .bind(&message.thread_id)
    .bind(role.as_str())
    .bind(&message.content)
    .bind(&message.agent_name)
    .bind(&message.created_at)
    .execute(&state.db)
    .await?;

    if let Some(conversation) = get_by_thread_id(&state.db, thread_id).await? {
        publish_message(state, &conversation, &message).await;
    }
    Ok(message)
}

pub async fn list_messages(
    db: &PgPool,
    thread_id: &str,
    request: &PageRequest,
) -> ApiResult<Page<ThreadMessage>> {
    let rows = sqlx::query(
        "SELECT id, seq, thread_id, role, content, agent_name, created_at FROM messages \
         WHERE thread_id = $1 AND seq < $2 ORDER BY seq DESC LIMIT $3",
    )
    .bind(thread_id)
    .bind(request.seq_bound())
    .bind(request.fetch_limit())
    .fetch_all(db)
    .await?;
    let items = rows
        .iter()
        .map(|row| (row.get::<i64, _>("seq"), parse_message_row(row)))
        .collect();
    Ok(request.finish(items))
}

/// The last `limit` messages in chronological order.
pub async fn recent_messages(db: &PgPool, thread_id: &str, limit: i64) -> ApiResult<Vec<ThreadMessage>> {
    let rows = sqlx::query(
        "SELECT id, thread_id, role, content, agent_name, created_at FROM messages \
         WHERE thread_id = $1 ORDER BY seq DESC LIMIT $2",
    )
    .bind(thread_id)
    .bind(limit)
    .fetch_all(db)
    .await?;
    let mut messages = rows.iter().map(parse_message_row).collect::<Vec<_>>();
    messages.reverse();
    Ok(messages)
}

pub async fn last_message(db: &PgPool, thread_id: &str) -> ApiResult<Option<ThreadMessage>> {
    Ok(recent_messages(db, thread_id, 1).await?.pop())
}

/// Visitors may write to unresolved and escalated conversations only.
pub fn ensure_visitor_can_write(conversation: &Conversation) -> ApiResult<()> {
    if !conversation.status.accepts_visitor_messages() {
        return Err(ApiError::bad_request("Conversation resolved"));
    }
    Ok(())
}

/// Checks shared by the operator message handlers.
pub fn ensure_operator_access(conversation: Option<Conversation>, org_id: &str) -> ApiResult<Conversation> {
    let conversation = conversation.ok_or_else(|| ApiError::not_found("Conversation not found."))?;
    if conversation.organization_id != org_id {
        return Err(ApiError::unauthorized(
            "You do not have access to this conversation.",
        ));
    }
    Ok(conversation)
}

pub async fn create_public(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublicCreateMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let session = require_valid_contact_session(&state.db, &body.contact_session_id).await?;
    refresh_contact_session(&state, &session).await?;

    let conversation = get_by_thread_id(&state.db, &body.thread_id).await?;
    let conversation = ensure_visitor_owns(conversation, &session)?;
    ensure_visitor_can_write(&conversation)?;

    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("Message is required"));
    }
    let message = save_message(&state, &conversation.thread_id, MessageRole::User, prompt, None).await?;

    if conversation.status.is_agent_handled() {
        run_support_agent(&state, &conversation).await?;
    } else {
        debug!(conversation_id = %conversation.id, "conversation escalated, waiting for operator");
    }
    Ok((StatusCode::CREATED, Json(json!({ "messageId": message.id }))))
}

pub async fn get_many_public(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PublicMessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let session = require_valid_contact_session(&state.db, &query.contact_session_id).await?;
    let conversation = get_by_thread_id(&state.db, &query.thread_id).await?;
    let conversation = ensure_visitor_owns(conversation, &session)?;
    let request = PageRequest::new(query.num_items, query.cursor.as_deref());
    Ok(Json(list_messages(&state.db, &conversation.thread_id, &request).await?))
}

/// Operator reply. Replying to an unresolved conversation takes it over from the agent.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let (identity, org_id) = require_operator(&state, &headers).await?;
    let conversation = load_conversation(&state.db, &body.conversation_id).await?;
    let conversation = ensure_operator_access(conversation, &org_id)?;
    if conversation.status == ConversationStatus::Resolved {
        return Err(ApiError::bad_request("Conversation is resolved."));
    }
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("Message is required"));
    }

    if conversation.status == ConversationStatus::Unresolved {
        set_status(&state, &conversation.id, ConversationStatus::Escalated).await?;
    }
    let message = save_message(
        &state,
        &conversation.thread_id,
        MessageRole::Assistant,
        prompt,
        Some(&identity.family_name),
    )
    .await?;
    info!(
        conversation_id = %conversation.id,
        operator_id = %identity.operator_id,
        "operator replied"
    );
    Ok((StatusCode::CREATED, Json(json!({ "messageId": message.id }))))
}

pub async fn get_many(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let conversation = get_by_thread_id(&state.db, &query.thread_id).await?;
    let conversation = ensure_operator_access(conversation, &org_id)?;
    let request = PageRequest::new(query.num_items, query.cursor.as_deref());
    Ok(Json(list_messages(&state.db, &conversation.thread_id, &request).await?))
}

/// Rewrites an operator draft to read more empathetic, keeping its meaning.
pub async fn enhance_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EnhanceBody>,
) -> ApiResult<impl IntoResponse> {
    require_operator(&state, &headers).await?;
    let text = state
        .ai
        .complete_text(&state.ai.chat_model, ENHANCE_RESPONSE_PROMPT, &body.prompt)
        .await?;
    Ok(Json(Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(status: ConversationStatus) -> Conversation {
        Conversation {
            id: "conv".into(),
            thread_id: "thread".into(),
            organization_id: "org_1".into(),
            contact_session_id: "cs".into(),
            status,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn resolved_conversations_reject_visitor_messages() {
        assert!(ensure_visitor_can_write(&conversation(ConversationStatus::Unresolved)).is_ok());
        assert!(ensure_visitor_can_write(&conversation(ConversationStatus::Escalated)).is_ok());
        let err = ensure_visitor_can_write(&conversation(ConversationStatus::Resolved)).unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
        assert!(err.to_string().contains("Conversation resolved"));
    }

    #[test]
    fn operator_access_messages() {
        let err = ensure_operator_access(None, "org_1").unwrap_err();
        assert!(err.to_string().contains("Conversation not found."));

        let err = ensure_operator_access(Some(conversation(ConversationStatus::Unresolved)), "org_2")
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(err
            .to_string()
            .contains("You do not have access to this conversation."));

        assert!(ensure_operator_access(Some(conversation(ConversationStatus::Escalated)), "org_1").is_ok());
    }

    #[test]
    fn messages_serialize_with_agent_name_only_when_present() {
        let message = ThreadMessage {
            id: "m".into(),
            thread_id: "t".into(),
            role: MessageRole::Assistant,
            content: "On it".into(),
            agent_name: Some("Hopper".into()),
            created_at: String::new(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["_id"], "m");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["agentName"], "Hopper");

        let value = serde_json::to_value(ThreadMessage { agent_name: None, ..message }).unwrap();
        assert!(value.get("agentName").is_none());
    }
}
