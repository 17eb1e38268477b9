//! Thin client for an OpenAI-compatible chat/embeddings API.

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Settings;

pub const EMBEDDING_DIMENSIONS: usize = 1536;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("OPENAI_API_KEY not configured")]
    NotConfigured,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One model turn: either final text or a batch of tool calls.
#[derive(Debug, Clone)]
pub enum AssistantTurn {
    Text(String),
    ToolCalls {
        /// Raw assistant message, echoed back in the follow-up request.
        message: Value,
        calls: Vec<ToolCall>,
    },
}

#[derive(Clone)]
pub struct AiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    pub chat_model: String,
    pub document_model: String,
    pub embedding_model: String,
}

impl AiClient {
    pub fn new(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            base_url: settings.openai_base_url.clone(),
            api_key: settings.openai_api_key.clone(),
            chat_model: settings.chat_model.clone(),
            document_model: settings.document_model.clone(),
            embedding_model: settings.embedding_model.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, AiError> {
        let api_key = self.api_key.as_deref().ok_or(AiError::NotConfigured)?;
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Status { status, body });
        }
        Ok(response.json::<Value>().await?)
    }

    /// Plain completion returning the assistant text.
    pub async fn complete(&self, model: &str, messages: Vec<Value>) -> Result<String, AiError> {
        let payload = self
            .post(
                "/chat/completions",
                json!({ "model": model, "messages": messages }),
            )
            .await?;
        let text = first_message(&payload)
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AiError::Malformed("empty completion content".to_string()));
        }
        Ok(text)
    }

    /// System + user prompt shorthand.
    pub async fn complete_text(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, AiError> {
        self.complete(
            model,
            vec![
                json!({ "role": "system", "content": system }),
                json!({ "role": "user", "content": user }),
            ],
        )
        .await
    }

    pub async fn complete_with_tools(
        &self,
        messages: &[Value],
        tools: &[Value],
    ) -> Result<AssistantTurn, AiError> {
        let payload = self
            .post(
                "/chat/completions",
                json!({
                    "model": self.chat_model,
                    "messages": messages,
                    "tools": tools,
                    "tool_choice": "auto",
                }),
            )
            .await?;
        let message = first_message(&payload)
            .cloned()
            .ok_or_else(|| AiError::Malformed("missing choices".to_string()))?;
        parse_assistant_turn(message)
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f64>>, AiError> {
        if inputs.is_empty() {
            return Ok(vec![]);
        }
        let payload = self
            .post(
                "/embeddings",
                json!({ "model": self.embedding_model, "input": inputs }),
            )
            .await?;
        let data = payload
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| AiError::Malformed("embedding response missing data".to_string()))?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| AiError::Malformed("embedding item missing vector".to_string()))?
                .iter()
                .filter_map(Value::as_f64)
                .collect::<Vec<_>>();
            if embedding.len() != EMBEDDING_DIMENSIONS {
                return Err(AiError::Malformed(format!(
                    "embedding dimension mismatch: expected {EMBEDDING_DIMENSIONS} got {}",
                    embedding.len()
                )));
            }
            out.push(embedding);
        }
        if out.len() != inputs.len() {
            return Err(AiError::Malformed("embedding count mismatch".to_string()));
        }
        Ok(out)
    }
}

fn first_message(payload: &Value) -> Option<&Value> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
}

fn parse_assistant_turn(message: Value) -> Result<AssistantTurn, AiError> {
    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_tool_call).collect::<Vec<_>>())
        .unwrap_or_default();
    if !calls.is_empty() {
        return Ok(AssistantTurn::ToolCalls { message, calls });
    }
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    Ok(AssistantTurn::Text(text))
}

fn parse_tool_call(value: &Value) -> Option<ToolCall> {
    let id = value.get("id")?.as_str()?.to_string();
    let function = value.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    // Arguments arrive as a JSON-encoded string.
    let arguments = function
        .get("arguments")
        .and_then(Value::as_str)
        .map(|raw| serde_json::from_str(raw).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    Some(ToolCall {
        id,
        name,
        arguments,
    })
}

/// Tool-result message for the follow-up request.
pub fn tool_result_message(call: &ToolCall, content: &str) -> Value {
    json!({ "role": "tool", "tool_call_id": call.id, "content": content })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn client_for(server: &MockServer, key: Option<&str>) -> AiClient {
        let mut settings = Settings::for_tests();
        settings.openai_base_url = server.uri();
        settings.openai_api_key = key.map(str::to_string);
        AiClient::new(reqwest::Client::new(), &settings)
    }

    #[tokio::test]
    async fn complete_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "  Hi there \n" } }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("sk-test"));
        let text = client.complete_text("gpt-4o-mini", "sys", "hello").await.unwrap();
        assert_eq!(text, "Hi there");
    }

    #[tokio::test]
    async fn missing_key_is_reported_without_a_request() {
        let server = MockServer::start().await;
        let client = client_for(&server, None);
        let err = client.complete_text("m", "s", "u").await.unwrap_err();
        assert!(matches!(err, AiError::NotConfigured));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_errors_carry_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("sk"));
        match client.complete_text("m", "s", "u").await {
            Err(AiError::Status { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_calls_are_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "searchTool", "arguments": "{\"query\":\"refund policy\"}" }
                    }]
                } }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("sk"));
        let turn = client.complete_with_tools(&[], &[]).await.unwrap();
        let AssistantTurn::ToolCalls { calls, .. } = turn else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "searchTool");
        assert_eq!(calls[0].arguments["query"], "refund policy");
    }

    #[tokio::test]
    async fn embeddings_enforce_dimensions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3] }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("sk"));
        let err = client.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, AiError::Malformed(_)));
    }

    #[test]
    fn unparseable_arguments_become_null() {
        let call = parse_tool_call(&json!({
            "id": "c",
            "function": { "name": "resolveConversationTool", "arguments": "not json" }
        }))
        .unwrap();
        assert_eq!(call.arguments, Value::Null);
    }
}
