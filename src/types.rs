use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Unresolved,
    Escalated,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
        }
    }

    /// Status the dashboard toggle moves to from `self`.
    pub fn next(self) -> Self {
        match self {
            Self::Unresolved => Self::Escalated,
            Self::Escalated => Self::Resolved,
            Self::Resolved => Self::Unresolved,
        }
    }

    pub fn accepts_visitor_messages(self) -> bool {
        self != Self::Resolved
    }

    /// Only unresolved conversations are answered by the support agent.
    pub fn is_agent_handled(self) -> bool {
        self == Self::Unresolved
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unresolved" => Ok(Self::Unresolved),
            "escalated" => Ok(Self::Escalated),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSession {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub organization_id: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    #[serde(default)]
    pub metadata: Option<ContactSessionMetadata>,
    pub created_at: String,
}

impl ContactSession {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at < now_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    pub thread_id: String,
    pub organization_id: String,
    pub contact_session_id: String,
    pub status: ConversationStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "user" {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefaultSuggestions {
    #[serde(default)]
    pub suggestion1: String,
    #[serde(default)]
    pub suggestion2: String,
    #[serde(default)]
    pub suggestion3: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VapiSettings {
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSettings {
    pub organization_id: String,
    pub greet_message: String,
    pub default_suggestions: DefaultSuggestions,
    pub vapi_settings: VapiSettings,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    #[serde(rename = "_id")]
    pub id: String,
    pub organization_id: String,
    pub service: String,
    pub secret_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub organization_id: String,
    pub status: String,
    pub updated_at: String,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorIdentity {
    pub operator_id: String,
    pub name: String,
    pub family_name: String,
    pub email: String,
    pub organization_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub page: Vec<T>,
    pub is_done: bool,
    pub continue_cursor: String,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            page: vec![],
            is_done: true,
            continue_cursor: String::new(),
        }
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Keyset pagination over a descending sequence column.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub num_items: i64,
    /// Rows with `seq` strictly below this value.
    pub before_seq: Option<i64>,
}

impl PageRequest {
    pub fn new(num_items: Option<i64>, cursor: Option<&str>) -> Self {
        let num_items = num_items
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let before_seq = cursor
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .and_then(|c| c.parse::<i64>().ok());
        Self {
            num_items,
            before_seq,
        }
    }

    /// Upper bound for the `seq < $n` filter.
    pub fn seq_bound(&self) -> i64 {
        self.before_seq.unwrap_or(i64::MAX)
    }

    /// Query limit; one extra row tells whether more pages exist.
    pub fn fetch_limit(&self) -> i64 {
        self.num_items + 1
    }

    /// Turns `(seq, item)` rows fetched with `fetch_limit` into a page.
    pub fn finish<T>(&self, mut rows: Vec<(i64, T)>) -> Page<T> {
        let is_done = rows.len() as i64 <= self.num_items;
        rows.truncate(self.num_items as usize);
        let continue_cursor = if is_done {
            String::new()
        } else {
            rows.last()
                .map(|(seq, _)| seq.to_string())
                .unwrap_or_default()
        };
        Page {
            page: rows.into_iter().map(|(_, item)| item).collect(),
            is_done,
            continue_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn status_toggle_cycles_through_all_states() {
        let start = ConversationStatus::Unresolved;
        assert_eq!(start.next(), ConversationStatus::Escalated);
        assert_eq!(start.next().next(), ConversationStatus::Resolved);
        assert_eq!(start.next().next().next(), start);
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(
            " Escalated ".parse::<ConversationStatus>(),
            Ok(ConversationStatus::Escalated)
        );
        assert!("open".parse::<ConversationStatus>().is_err());
    }

    #[test]
    fn only_unresolved_conversations_reach_the_agent() {
        assert!(ConversationStatus::Unresolved.is_agent_handled());
        assert!(!ConversationStatus::Escalated.is_agent_handled());
        assert!(ConversationStatus::Escalated.accepts_visitor_messages());
        assert!(!ConversationStatus::Resolved.accepts_visitor_messages());
    }

    #[test]
    fn status_serializes_lowercase() {
        let value = serde_json::to_value(ConversationStatus::Resolved).unwrap();
        assert_eq!(value, Value::String("resolved".into()));
    }

    #[test]
    fn page_request_clamps_and_parses_cursor() {
        let req = PageRequest::new(Some(1000), Some("42"));
        assert_eq!(req.num_items, MAX_PAGE_SIZE);
        assert_eq!(req.seq_bound(), 42);

        let req = PageRequest::new(None, Some("garbage"));
        assert_eq!(req.num_items, DEFAULT_PAGE_SIZE);
        assert_eq!(req.seq_bound(), i64::MAX);
    }

    #[test]
    fn finish_reports_continuation() {
        let req = PageRequest::new(Some(2), None);
        let page = req.finish(vec![(9, "a"), (7, "b"), (4, "c")]);
        assert_eq!(page.page, vec!["a", "b"]);
        assert!(!page.is_done);
        assert_eq!(page.continue_cursor, "7");

        let page = req.finish(vec![(3, "x")]);
        assert!(page.is_done);
        assert!(page.continue_cursor.is_empty());
    }

    #[test]
    fn contact_session_expiry_boundary() {
        let session = ContactSession {
            id: "cs".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            organization_id: "org".into(),
            expires_at: 1_000,
            metadata: None,
            created_at: String::new(),
        };
        assert!(!session.is_expired_at(1_000));
        assert!(session.is_expired_at(1_001));
    }
}
