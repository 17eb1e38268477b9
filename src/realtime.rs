//! Websocket fan-out of conversation and message changes.
//!
//! Operators join with their bearer token and see every event of their
//! organization. Widget clients join one conversation with their contact
//! session and only see that conversation.

use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::Ordering, Arc},
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::auth::identity_for_token;
use crate::contact_sessions::require_valid_contact_session;
use crate::conversations::load_conversation;
use crate::types::{Conversation, ThreadMessage};

pub const CONVERSATION_UPDATED: &str = "conversation:updated";
pub const MESSAGE_CREATED: &str = "message:created";

#[derive(Default)]
pub struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    operator_orgs: HashMap<usize, String>,
    conversation_watchers: HashMap<String, HashSet<usize>>,
    watched_conversation: HashMap<usize, String>,
}

impl RealtimeState {
    pub fn register(&mut self, client_id: usize, sender: mpsc::UnboundedSender<String>) {
        self.clients.insert(client_id, sender);
    }

    pub fn join_operator(&mut self, client_id: usize, organization_id: &str) {
        self.operator_orgs
            .insert(client_id, organization_id.to_string());
    }

    /// A widget client follows one conversation at a time.
    pub fn join_conversation(&mut self, client_id: usize, conversation_id: &str) {
        if let Some(previous) = self
            .watched_conversation
            .insert(client_id, conversation_id.to_string())
        {
            self.unwatch(client_id, &previous);
        }
        self.conversation_watchers
            .entry(conversation_id.to_string())
            .or_default()
            .insert(client_id);
    }

    pub fn remove(&mut self, client_id: usize) {
        self.clients.remove(&client_id);
        self.operator_orgs.remove(&client_id);
        if let Some(previous) = self.watched_conversation.remove(&client_id) {
            self.unwatch(client_id, &previous);
        }
    }

    fn unwatch(&mut self, client_id: usize, conversation_id: &str) {
        if let Some(set) = self.conversation_watchers.get_mut(conversation_id) {
            set.remove(&client_id);
            if set.is_empty() {
                self.conversation_watchers.remove(conversation_id);
            }
        }
    }

    /// Operators of the organization plus widgets watching the conversation.
    pub fn recipients(&self, organization_id: &str, conversation_id: &str) -> Vec<usize> {
        let mut ids = self
            .operator_orgs
            .iter()
            .filter(|(_, org)| org.as_str() == organization_id)
            .map(|(id, _)| *id)
            .collect::<HashSet<_>>();
        if let Some(watchers) = self.conversation_watchers.get(conversation_id) {
            ids.extend(watchers.iter().copied());
        }
        let mut ids = ids.into_iter().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn senders(&self, client_ids: &[usize]) -> Vec<mpsc::UnboundedSender<String>> {
        client_ids
            .iter()
            .filter_map(|id| self.clients.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(state: &AppState, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let sender = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };
    if let Some(sender) = sender {
        let _ = sender.send(payload);
    }
}

async fn emit_to_conversation<T: Serialize>(
    state: &AppState,
    organization_id: &str,
    conversation_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        let ids = rt.recipients(organization_id, conversation_id);
        rt.senders(&ids)
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn publish_conversation(state: &AppState, conversation: &Conversation) {
    emit_to_conversation(
        state,
        &conversation.organization_id,
        &conversation.id,
        CONVERSATION_UPDATED,
        conversation,
    )
    .await;
}

pub async fn publish_message(state: &AppState, conversation: &Conversation, message: &ThreadMessage) {
    emit_to_conversation(
        state,
        &conversation.organization_id,
        &conversation.id,
        MESSAGE_CREATED,
        json!({ "conversationId": conversation.id, "message": message }),
    )
    .await;
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.realtime.lock().await.register(client_id, tx);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        match envelope.event.as_str() {
            "operator:join" => operator_join(&state, client_id, &envelope.data).await,
            "widget:join" => widget_join(&state, client_id, &envelope.data).await,
            other => debug!(client_id, event = other, "ignoring websocket event"),
        }
    }

    state.realtime.lock().await.remove(client_id);
    send_task.abort();
}

async fn operator_join(state: &AppState, client_id: usize, data: &Value) {
    let token = data.get("token").and_then(Value::as_str).unwrap_or("");
    let identity = match identity_for_token(&state.db, token).await {
        Ok(Some(identity)) if !identity.organization_id.is_empty() => identity,
        Ok(_) => {
            emit_to_client(state, client_id, "error", json!({ "message": "Identity not found" }))
                .await;
            return;
        }
        Err(err) => {
            warn!(client_id, error = %err, "operator join failed");
            return;
        }
    };
    state
        .realtime
        .lock()
        .await
        .join_operator(client_id, &identity.organization_id);
    emit_to_client(
        state,
        client_id,
        "operator:joined",
        json!({ "organizationId": identity.organization_id }),
    )
    .await;
}

async fn widget_join(state: &AppState, client_id: usize, data: &Value) {
    let conversation_id = data
        .get("conversationId")
        .and_then(Value::as_str)
        .unwrap_or("");
    let contact_session_id = data
        .get("contactSessionId")
        .and_then(Value::as_str)
        .unwrap_or("");

    let session = match require_valid_contact_session(&state.db, contact_session_id).await {
        Ok(session) => session,
        Err(err) => {
            debug!(client_id, error = %err, "widget join rejected");
            emit_to_client(state, client_id, "error", err.client_body()).await;
            return;
        }
    };
    let conversation = match load_conversation(&state.db, conversation_id).await {
        Ok(Some(conversation)) if conversation.contact_session_id == session.id => conversation,
        Ok(_) => {
            emit_to_client(
                state,
                client_id,
                "error",
                json!({ "message": "Conversation not found" }),
            )
            .await;
            return;
        }
        Err(err) => {
            warn!(client_id, error = %err, "widget join failed");
            return;
        }
    };
    state
        .realtime
        .lock()
        .await
        .join_conversation(client_id, &conversation.id);
    emit_to_client(state, client_id, CONVERSATION_UPDATED, &conversation).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;

    fn client(rt: &mut RealtimeState, id: usize) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        rt.register(id, tx);
        rx
    }

    #[test]
    fn recipients_cover_org_operators_and_watchers() {
        let mut rt = RealtimeState::default();
        let _a = client(&mut rt, 1);
        let _b = client(&mut rt, 2);
        let _c = client(&mut rt, 3);
        let _d = client(&mut rt, 4);
        rt.join_operator(1, "org_a");
        rt.join_operator(2, "org_b");
        rt.join_conversation(3, "conv_1");
        rt.join_conversation(4, "conv_2");

        assert_eq!(rt.recipients("org_a", "conv_1"), vec![1, 3]);
        assert_eq!(rt.recipients("org_b", "conv_2"), vec![2, 4]);
    }

    #[test]
    fn switching_conversation_drops_previous_watch() {
        let mut rt = RealtimeState::default();
        let _rx = client(&mut rt, 7);
        rt.join_conversation(7, "conv_1");
        rt.join_conversation(7, "conv_2");
        assert!(rt.recipients("org", "conv_1").is_empty());
        assert_eq!(rt.recipients("org", "conv_2"), vec![7]);
        assert!(!rt.conversation_watchers.contains_key("conv_1"));
        assert_eq!(rt.conversation_watchers.len(), 1);
    }

    #[test]
    fn rejoining_the_same_conversation_keeps_the_watch() {
        let mut rt = RealtimeState::default();
        let _rx = client(&mut rt, 7);
        rt.join_conversation(7, "conv_1");
        rt.join_conversation(7, "conv_1");
        assert_eq!(rt.recipients("org", "conv_1"), vec![7]);
    }

    #[test]
    fn join_errors_use_the_client_message() {
        let body = ApiError::unauthorized("Invalid session").client_body();
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert_eq!(body["message"], "Invalid session");

        let body = ApiError::Database(sqlx::Error::RowNotFound).client_body();
        assert_eq!(body["message"], "Internal server error");
    }

    #[test]
    fn removed_clients_receive_nothing() {
        let mut rt = RealtimeState::default();
        let _rx = client(&mut rt, 1);
        rt.join_operator(1, "org");
        rt.join_conversation(1, "conv");
        rt.remove(1);
        assert!(rt.recipients("org", "conv").is_empty());
        assert!(rt.senders(&[1]).is_empty());
    }

    #[test]
    fn payload_wraps_event_and_data() {
        let payload = event_payload(MESSAGE_CREATED, json!({ "x": 1 })).unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["event"], "message:created");
        assert_eq!(value["data"]["x"], 1);
    }
}
