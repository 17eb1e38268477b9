//! Support agent: answers visitors in unresolved conversations.
//!
//! The model gets the recent thread history plus three tools. Tool calls are
//! executed in order; a tool that already posted a visible message ends the
//! turn without a further model reply.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::ai::{tool_result_message, AiError, AssistantTurn, ToolCall};
use crate::app::AppState;
use crate::conversations::{escalate, get_by_thread_id, resolve};
use crate::error::ApiResult;
use crate::messages::{recent_messages, save_message};
use crate::organizations::organization_name;
use crate::prompting::{
    render_agent_instructions, render_search_interpreter_prompt, render_search_user_prompt,
    AgentInstructionsContext, SearchUserContext,
};
use crate::rag;
use crate::types::{Conversation, MessageRole, ThreadMessage};

pub const MAX_AGENT_STEPS: usize = 4;
pub const HISTORY_LIMIT: i64 = 20;
pub const SEARCH_LIMIT: i64 = 5;

pub const ESCALATED_MESSAGE: &str = "The conversation escalated to a human operator.";
pub const RESOLVED_MESSAGE: &str = "The conversation has been marked as resolved.";
pub const FALLBACK_REPLY: &str =
    "Thanks for your message! Our assistant is unavailable right now. Ask to talk to a human and a member of our team will follow up.";

const HANDOVER_PHRASES: [&str; 6] = [
    "human",
    "real person",
    "operator",
    "representative",
    "talk to someone",
    "speak to someone",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportTool {
    Search,
    Escalate,
    Resolve,
}

impl SupportTool {
    pub const ALL: [SupportTool; 3] = [Self::Search, Self::Escalate, Self::Resolve];

    pub fn name(self) -> &'static str {
        match self {
            Self::Search => "searchTool",
            Self::Escalate => "escalateConversationTool",
            Self::Resolve => "resolveConversationTool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn schema(self) -> Value {
        let (description, parameters) = match self {
            Self::Search => (
                "Search the knowledge base for relevant information to help answer user questions.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "The question to search for." }
                    },
                    "required": ["query"]
                }),
            ),
            Self::Escalate => (
                "Escalate a conversation",
                json!({ "type": "object", "properties": {} }),
            ),
            Self::Resolve => (
                "Resolve a conversation",
                json!({ "type": "object", "properties": {} }),
            ),
        };
        json!({
            "type": "function",
            "function": { "name": self.name(), "description": description, "parameters": parameters }
        })
    }
}

/// Result handed back to the model for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    /// A visible message was posted to the thread.
    pub ends_turn: bool,
}

impl ToolOutcome {
    fn reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ends_turn: false,
        }
    }

    fn final_reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ends_turn: true,
        }
    }
}

/// What the agent loop does after one model step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStep {
    /// Save this text as the assistant reply and stop.
    Reply(String),
    /// A tool already posted to the thread.
    Finished,
    /// Feed the tool results back to the model.
    Continue,
    StepLimit,
}

/// `step` is zero-based; `outcomes` holds the results of the turn's tool calls.
pub fn decide_step(step: usize, turn: &AssistantTurn, outcomes: &[ToolOutcome]) -> AgentStep {
    match turn {
        AssistantTurn::Text(text) if text.trim().is_empty() => AgentStep::Reply(FALLBACK_REPLY.to_string()),
        AssistantTurn::Text(text) => AgentStep::Reply(text.clone()),
        AssistantTurn::ToolCalls { .. } if outcomes.iter().any(|o| o.ends_turn) => AgentStep::Finished,
        AssistantTurn::ToolCalls { .. } if step + 1 >= MAX_AGENT_STEPS => AgentStep::StepLimit,
        AssistantTurn::ToolCalls { .. } => AgentStep::Continue,
    }
}

pub fn search_context_text(titles: &[&str], text: &str) -> String {
    let titles = titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    format!("Found results in {titles}. Here is the relevant information:\n\n{text}")
}

pub fn history_to_chat_messages(history: &[ThreadMessage]) -> Vec<Value> {
    history
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

pub fn wants_human(text: &str) -> bool {
    let lower = text.to_lowercase();
    HANDOVER_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

async fn search_tool(state: &AppState, thread_id: &str, query: &str) -> ApiResult<ToolOutcome> {
    let Some(conversation) = get_by_thread_id(&state.db, thread_id).await? else {
        return Ok(ToolOutcome::reply("No conversation found for this thread ID."));
    };
    let results = rag::search(state, &conversation.organization_id, query, SEARCH_LIMIT).await?;
    let titles = results
        .entries
        .iter()
        .map(|e| e.title.as_str())
        .collect::<Vec<_>>();
    let context_text = search_context_text(&titles, &results.text);
    let answer = state
        .ai
        .complete_text(
            &state.ai.chat_model,
            &render_search_interpreter_prompt(),
            &render_search_user_prompt(&SearchUserContext {
                query,
                context_text: &context_text,
            }),
        )
        .await?;
    save_message(state, thread_id, MessageRole::Assistant, &answer, None).await?;
    Ok(ToolOutcome::final_reply(answer))
}

async fn escalate_tool(state: &AppState, thread_id: &str) -> ApiResult<ToolOutcome> {
    escalate(state, thread_id).await?;
    save_message(state, thread_id, MessageRole::Assistant, ESCALATED_MESSAGE, None).await?;
    Ok(ToolOutcome::final_reply("Conversation escalated for human operator."))
}

async fn resolve_tool(state: &AppState, thread_id: &str) -> ApiResult<ToolOutcome> {
    resolve(state, thread_id).await?;
    save_message(state, thread_id, MessageRole::Assistant, RESOLVED_MESSAGE, None).await?;
    Ok(ToolOutcome::final_reply("Conversation marked as resolved."))
}

async fn execute_tool(state: &AppState, thread_id: &str, call: &ToolCall) -> ApiResult<ToolOutcome> {
    if thread_id.is_empty() {
        return Ok(ToolOutcome::reply("Missing threadId in context"));
    }
    match SupportTool::from_name(&call.name) {
        Some(SupportTool::Search) => {
            let query = call
                .arguments
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            if query.is_empty() {
                return Ok(ToolOutcome::reply("A search query is required."));
            }
            search_tool(state, thread_id, query).await
        }
        Some(SupportTool::Escalate) => escalate_tool(state, thread_id).await,
        Some(SupportTool::Resolve) => resolve_tool(state, thread_id).await,
        None => Ok(ToolOutcome::reply(format!("Unknown tool: {}", call.name))),
    }
}

/// Reply used when no model is configured.
async fn run_fallback(state: &AppState, conversation: &Conversation, last: Option<&ThreadMessage>) -> ApiResult<()> {
    let asked_for_human = last
        .filter(|m| m.role == MessageRole::User)
        .is_some_and(|m| wants_human(&m.content));
    if asked_for_human {
        escalate_tool(state, &conversation.thread_id).await?;
    } else {
        save_message(state, &conversation.thread_id, MessageRole::Assistant, FALLBACK_REPLY, None).await?;
    }
    Ok(())
}

pub async fn run_support_agent(state: &AppState, conversation: &Conversation) -> ApiResult<()> {
    let thread_id = conversation.thread_id.as_str();
    let history = recent_messages(&state.db, thread_id, HISTORY_LIMIT).await?;
    if !state.ai.is_configured() {
        debug!(conversation_id = %conversation.id, "no AI provider, using fallback reply");
        return run_fallback(state, conversation, history.last()).await;
    }

    let organization = organization_name(&state.db, &conversation.organization_id)
        .await?
        .unwrap_or_default();
    let instructions = render_agent_instructions(&AgentInstructionsContext {
        organization_name: &organization,
    });
    let tools = SupportTool::ALL.map(SupportTool::schema);

    let mut messages = vec![json!({ "role": "system", "content": instructions })];
    messages.extend(history_to_chat_messages(&history));

    let mut step = 0;
    loop {
        let turn = match state.ai.complete_with_tools(&messages, &tools).await {
            Ok(turn) => turn,
            Err(AiError::NotConfigured) => return run_fallback(state, conversation, history.last()).await,
            Err(err) => return Err(err.into()),
        };
        let mut outcomes = Vec::new();
        match &turn {
            AssistantTurn::Text(text) if text.trim().is_empty() => {
                warn!(conversation_id = %conversation.id, step, "model returned an empty reply, using fallback");
            }
            AssistantTurn::Text(_) => {}
            AssistantTurn::ToolCalls { message, calls } => {
                messages.push(message.clone());
                for call in calls {
                    info!(conversation_id = %conversation.id, tool = %call.name, step, "agent tool call");
                    let outcome = execute_tool(state, thread_id, call).await?;
                    messages.push(tool_result_message(call, &outcome.content));
                    outcomes.push(outcome);
                }
            }
        }
        match decide_step(step, &turn, &outcomes) {
            AgentStep::Reply(text) => {
                save_message(state, thread_id, MessageRole::Assistant, &text, None).await?;
                debug!(conversation_id = %conversation.id, step, "agent replied");
                return Ok(());
            }
            AgentStep::Finished => return Ok(()),
            AgentStep::Continue => step += 1,
            AgentStep::StepLimit => {
                warn!(conversation_id = %conversation.id, "agent reached step limit without a reply");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_round_trip() {
        for tool in SupportTool::ALL {
            assert_eq!(SupportTool::from_name(tool.name()), Some(tool));
        }
        assert_eq!(SupportTool::from_name("deleteEverything"), None);
    }

    #[test]
    fn search_schema_requires_query() {
        let schema = SupportTool::Search.schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "searchTool");
        assert_eq!(schema["function"]["parameters"]["required"][0], "query");
    }

    #[test]
    fn context_text_lists_titles() {
        let text = search_context_text(&["refunds.pdf", "", "faq.md"], "Refunds take 5 days.");
        assert_eq!(
            text,
            "Found results in refunds.pdf, faq.md. Here is the relevant information:\n\nRefunds take 5 days."
        );
    }

    fn tool_turn() -> AssistantTurn {
        AssistantTurn::ToolCalls {
            message: json!({ "role": "assistant", "tool_calls": [] }),
            calls: Vec::new(),
        }
    }

    #[test]
    fn text_reply_ends_the_turn() {
        let step = decide_step(0, &AssistantTurn::Text("Refunds take 5 days.".into()), &[]);
        assert_eq!(step, AgentStep::Reply("Refunds take 5 days.".into()));
    }

    #[test]
    fn empty_text_falls_back_to_canned_reply() {
        for text in ["", "  \n"] {
            let step = decide_step(1, &AssistantTurn::Text(text.into()), &[]);
            assert_eq!(step, AgentStep::Reply(FALLBACK_REPLY.into()));
        }
    }

    #[test]
    fn terminal_tool_ends_the_turn() {
        let outcomes = [
            ToolOutcome::reply("Unknown tool: lookupOrder"),
            ToolOutcome::final_reply("Conversation escalated for human operator."),
        ];
        assert_eq!(decide_step(0, &tool_turn(), &outcomes), AgentStep::Finished);
        // Even on the last allowed step a posted message wins over the limit.
        assert_eq!(decide_step(MAX_AGENT_STEPS - 1, &tool_turn(), &outcomes), AgentStep::Finished);
    }

    #[test]
    fn non_terminal_results_go_back_to_the_model() {
        let outcomes = [
            ToolOutcome::reply("Unknown tool: lookupOrder"),
            ToolOutcome::reply("A search query is required."),
        ];
        assert_eq!(decide_step(0, &tool_turn(), &outcomes), AgentStep::Continue);
        assert_eq!(decide_step(MAX_AGENT_STEPS - 2, &tool_turn(), &outcomes), AgentStep::Continue);
    }

    #[test]
    fn step_limit_stops_the_loop() {
        let outcomes = [ToolOutcome::reply("A search query is required.")];
        assert_eq!(decide_step(MAX_AGENT_STEPS - 1, &tool_turn(), &outcomes), AgentStep::StepLimit);

        let mut step = 0;
        let mut model_calls = 0;
        loop {
            model_calls += 1;
            match decide_step(step, &tool_turn(), &outcomes) {
                AgentStep::Continue => step += 1,
                other => {
                    assert_eq!(other, AgentStep::StepLimit);
                    break;
                }
            }
        }
        assert_eq!(model_calls, MAX_AGENT_STEPS);
    }

    #[test]
    fn handover_detection() {
        assert!(wants_human("Can I talk to a HUMAN please"));
        assert!(wants_human("I need a representative"));
        assert!(!wants_human("How do refunds work?"));
    }

    #[test]
    fn history_maps_roles() {
        let history = vec![
            ThreadMessage {
                id: "1".into(),
                thread_id: "t".into(),
                role: MessageRole::Assistant,
                content: "Hello".into(),
                agent_name: None,
                created_at: String::new(),
            },
            ThreadMessage {
                id: "2".into(),
                thread_id: "t".into(),
                role: MessageRole::User,
                content: "Hi".into(),
                agent_name: None,
                created_at: String::new(),
            },
        ];
        let messages = history_to_chat_messages(&history);
        assert_eq!(messages[0], json!({ "role": "assistant", "content": "Hello" }));
        assert_eq!(messages[1], json!({ "role": "user", "content": "Hi" }));
    }
}
