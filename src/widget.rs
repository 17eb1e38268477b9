//! Widget start-up and embedding.
//!
//! The widget walks org → session → settings → vapi → done before showing
//! its first real screen. `LoadingMachine` holds that sequence; the
//! bootstrap endpoint drives it server-side so a client can fetch the
//! outcome in one request.

use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;
use crate::auth::require_operator;
use crate::contact_sessions::validate_contact_session;
use crate::error::{ApiError, ApiResult};
use crate::organizations::validate_organization;
use crate::prompting::render_template;
use crate::types::WidgetSettings;
use crate::vapi::public_api_key;
use crate::widget_settings::load_widget_settings;

const HTML_SNIPPET: &str = include_str!("snippets/html.j2");
const REACT_SNIPPET: &str = include_str!("snippets/react.j2");
const NEXTJS_SNIPPET: &str = include_str!("snippets/nextjs.j2");
const JAVASCRIPT_SNIPPET: &str = include_str!("snippets/javascript.j2");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Screen {
    Error,
    Loading,
    Auth,
    Selection,
    Chat,
    Voice,
    Contact,
    Inbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStep {
    Org,
    Session,
    Settings,
    Vapi,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrgCheck {
    Valid,
    Invalid(Option<String>),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCheck {
    Missing,
    Valid,
    Invalid,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitEvent {
    Org(OrgCheck),
    Session(SessionCheck),
    SettingsLoaded,
    VapiLoaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadingMachine {
    pub step: InitStep,
    pub screen: Screen,
    pub session_valid: bool,
    pub error_message: Option<String>,
    pub loading_message: String,
}

impl Default for LoadingMachine {
    fn default() -> Self {
        Self {
            step: InitStep::Org,
            screen: Screen::Loading,
            session_valid: false,
            error_message: None,
            loading_message: "Loading organization...".to_string(),
        }
    }
}

impl LoadingMachine {
    /// Fails fast when the embed carries no organization.
    pub fn start(&mut self, organization_id: Option<&str>) {
        if organization_id.map(str::trim).unwrap_or("").is_empty() {
            self.fail("Organization ID is required");
            return;
        }
        self.loading_message = "Validating organization...".to_string();
    }

    pub fn is_finished(&self) -> bool {
        self.step == InitStep::Done || self.screen == Screen::Error
    }

    fn fail(&mut self, message: &str) {
        self.error_message = Some(message.to_string());
        self.screen = Screen::Error;
    }

    fn enter(&mut self, step: InitStep) {
        self.step = step;
        match step {
            InitStep::Session => self.loading_message = "Finding contact session Id...".to_string(),
            InitStep::Settings => self.loading_message = "Loading widget settings...".to_string(),
            InitStep::Vapi => self.loading_message = "Loading voice features...".to_string(),
            InitStep::Done => {
                self.screen = if self.session_valid {
                    Screen::Selection
                } else {
                    Screen::Auth
                };
            }
            InitStep::Org => {}
        }
    }

    pub fn advance(&mut self, event: InitEvent) {
        if self.is_finished() {
            return;
        }
        match (self.step, event) {
            (InitStep::Org, InitEvent::Org(check)) => match check {
                OrgCheck::Valid => self.enter(InitStep::Session),
                OrgCheck::Invalid(reason) => {
                    let reason = reason.unwrap_or_else(|| "Invalid organization".to_string());
                    self.fail(&reason);
                }
                OrgCheck::Failed => self.fail("Failed to validate organization"),
            },
            (InitStep::Session, InitEvent::Session(check)) => match check {
                SessionCheck::Valid => {
                    self.session_valid = true;
                    self.enter(InitStep::Settings);
                }
                SessionCheck::Missing | SessionCheck::Invalid => {
                    self.session_valid = false;
                    self.enter(InitStep::Settings);
                }
                SessionCheck::Failed => {
                    self.session_valid = false;
                    self.enter(InitStep::Done);
                }
            },
            (InitStep::Settings, InitEvent::SettingsLoaded) => self.enter(InitStep::Vapi),
            (InitStep::Vapi, InitEvent::VapiLoaded) => self.enter(InitStep::Done),
            (step, event) => warn!(?step, ?event, "ignoring out-of-order widget init event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionOption {
    Chat,
    Voice,
    Contact,
}

/// Entry points offered on the selection screen.
pub fn selection_options(has_vapi_secrets: bool, settings: Option<&WidgetSettings>) -> Vec<SelectionOption> {
    let mut options = vec![SelectionOption::Chat];
    let vapi = settings.map(|s| &s.vapi_settings);
    if has_vapi_secrets && vapi.is_some_and(|v| !v.assistant_id.is_empty()) {
        options.push(SelectionOption::Voice);
    }
    if has_vapi_secrets && vapi.is_some_and(|v| !v.phone_number.is_empty()) {
        options.push(SelectionOption::Contact);
    }
    options
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapQuery {
    pub organization_id: Option<String>,
    pub contact_session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    pub screen: Screen,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub loading_message: String,
    pub contact_session_valid: bool,
    pub widget_settings: Option<WidgetSettings>,
    pub vapi_secrets: Value,
    pub selection_options: Vec<SelectionOption>,
}

pub async fn bootstrap(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BootstrapQuery>,
) -> ApiResult<impl IntoResponse> {
    let organization_id = query.organization_id.unwrap_or_default().trim().to_string();
    let contact_session_id = query
        .contact_session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let mut machine = LoadingMachine::default();
    machine.start(Some(&organization_id));
    let mut widget_settings = None;
    let mut vapi_key = None;

    while !machine.is_finished() {
        let event = match machine.step {
            InitStep::Org => InitEvent::Org(match validate_organization(&state.db, &organization_id).await {
                Ok(result) if result.valid => OrgCheck::Valid,
                Ok(result) => OrgCheck::Invalid(result.reason),
                Err(err) => {
                    warn!(organization_id = %organization_id, error = %err, "organization validation failed");
                    OrgCheck::Failed
                }
            }),
            InitStep::Session => InitEvent::Session(match contact_session_id.as_deref() {
                None => SessionCheck::Missing,
                Some(id) => match validate_contact_session(&state.db, id).await {
                    Ok((result, _)) if result.valid => SessionCheck::Valid,
                    Ok(_) => SessionCheck::Invalid,
                    Err(err) => {
                        warn!(contact_session_id = %id, error = %err, "contact session validation failed");
                        SessionCheck::Failed
                    }
                },
            }),
            InitStep::Settings => {
                widget_settings = load_widget_settings(&state.db, &organization_id).await?;
                InitEvent::SettingsLoaded
            }
            InitStep::Vapi => {
                vapi_key = public_api_key(&state, &organization_id).await?;
                InitEvent::VapiLoaded
            }
            InitStep::Done => break,
        };
        machine.advance(event);
    }

    let options = if machine.screen == Screen::Selection {
        selection_options(vapi_key.is_some(), widget_settings.as_ref())
    } else {
        vec![]
    };
    Ok(Json(BootstrapResponse {
        screen: machine.screen,
        error_message: machine.error_message,
        loading_message: machine.loading_message,
        contact_session_valid: machine.session_valid,
        widget_settings,
        vapi_secrets: vapi_key
            .map(|k| json!({ "publicApiKey": k }))
            .unwrap_or(Value::Null),
        selection_options: options,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    Html,
    React,
    NextJs,
    JavaScript,
}

impl FromStr for Integration {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "html" => Ok(Self::Html),
            "react" => Ok(Self::React),
            "nextjs" => Ok(Self::NextJs),
            "javascript" => Ok(Self::JavaScript),
            other => Err(ApiError::bad_request(format!("Unsupported integration: {other}"))),
        }
    }
}

impl Integration {
    fn template(self) -> (&'static str, &'static str) {
        match self {
            Self::Html => ("snippet_html", HTML_SNIPPET),
            Self::React => ("snippet_react", REACT_SNIPPET),
            Self::NextJs => ("snippet_nextjs", NEXTJS_SNIPPET),
            Self::JavaScript => ("snippet_javascript", JAVASCRIPT_SNIPPET),
        }
    }

    pub fn render_snippet(self, organization_id: &str, script_url: &str) -> ApiResult<String> {
        let (name, source) = self.template();
        render_template(
            name,
            source,
            context! { organization_id => organization_id, script_url => script_url },
        )
        .ok_or_else(|| ApiError::internal("failed to render embed snippet"))
    }
}

pub async fn embed_snippet(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(integration): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let snippet = integration
        .parse::<Integration>()?
        .render_snippet(&org_id, &state.settings.widget_script_url)?;
    Ok(Json(json!({ "integration": integration, "snippet": snippet })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DefaultSuggestions, VapiSettings};

    fn run(org: Option<&str>, events: Vec<InitEvent>) -> LoadingMachine {
        let mut machine = LoadingMachine::default();
        machine.start(org);
        for event in events {
            machine.advance(event);
        }
        machine
    }

    fn settings(assistant_id: &str, phone_number: &str) -> WidgetSettings {
        WidgetSettings {
            organization_id: "org".into(),
            greet_message: "Hi".into(),
            default_suggestions: DefaultSuggestions::default(),
            vapi_settings: VapiSettings {
                assistant_id: assistant_id.into(),
                phone_number: phone_number.into(),
            },
            updated_at: String::new(),
        }
    }

    #[test]
    fn missing_organization_is_an_error() {
        let machine = run(None, vec![]);
        assert_eq!(machine.screen, Screen::Error);
        assert_eq!(machine.error_message.as_deref(), Some("Organization ID is required"));
        assert!(machine.is_finished());
    }

    #[test]
    fn invalid_organization_uses_reason_or_default() {
        let machine = run(
            Some("org"),
            vec![InitEvent::Org(OrgCheck::Invalid(Some("Organization not found".into())))],
        );
        assert_eq!(machine.error_message.as_deref(), Some("Organization not found"));

        let machine = run(Some("org"), vec![InitEvent::Org(OrgCheck::Invalid(None))]);
        assert_eq!(machine.error_message.as_deref(), Some("Invalid organization"));

        let machine = run(Some("org"), vec![InitEvent::Org(OrgCheck::Failed)]);
        assert_eq!(
            machine.error_message.as_deref(),
            Some("Failed to validate organization")
        );
    }

    #[test]
    fn valid_session_lands_on_selection() {
        let machine = run(
            Some("org"),
            vec![
                InitEvent::Org(OrgCheck::Valid),
                InitEvent::Session(SessionCheck::Valid),
                InitEvent::SettingsLoaded,
                InitEvent::VapiLoaded,
            ],
        );
        assert_eq!(machine.step, InitStep::Done);
        assert_eq!(machine.screen, Screen::Selection);
        assert!(machine.session_valid);
    }

    #[test]
    fn missing_or_invalid_session_lands_on_auth() {
        for check in [SessionCheck::Missing, SessionCheck::Invalid] {
            let machine = run(
                Some("org"),
                vec![
                    InitEvent::Org(OrgCheck::Valid),
                    InitEvent::Session(check),
                    InitEvent::SettingsLoaded,
                    InitEvent::VapiLoaded,
                ],
            );
            assert_eq!(machine.screen, Screen::Auth);
        }
    }

    #[test]
    fn session_failure_skips_to_done() {
        let machine = run(
            Some("org"),
            vec![InitEvent::Org(OrgCheck::Valid), InitEvent::Session(SessionCheck::Failed)],
        );
        assert_eq!(machine.step, InitStep::Done);
        assert_eq!(machine.screen, Screen::Auth);
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        let machine = run(Some("org"), vec![InitEvent::SettingsLoaded]);
        assert_eq!(machine.step, InitStep::Org);
        assert_eq!(machine.screen, Screen::Loading);
        assert_eq!(machine.loading_message, "Validating organization...");
    }

    #[test]
    fn selection_requires_secrets_and_configuration() {
        use SelectionOption::*;
        assert_eq!(selection_options(false, Some(&settings("a", "p"))), vec![Chat]);
        assert_eq!(selection_options(true, None), vec![Chat]);
        assert_eq!(selection_options(true, Some(&settings("a", ""))), vec![Chat, Voice]);
        assert_eq!(selection_options(true, Some(&settings("", "p"))), vec![Chat, Contact]);
        assert_eq!(
            selection_options(true, Some(&settings("a", "p"))),
            vec![Chat, Voice, Contact]
        );
    }

    #[test]
    fn snippets_embed_organization_id() {
        for name in ["html", "react", "nextjs", "javascript"] {
            let snippet = name
                .parse::<Integration>()
                .unwrap()
                .render_snippet("org_42", "https://cdn.example.com/widget.js")
                .unwrap();
            assert!(snippet.contains("org_42"), "{name}");
            assert!(snippet.contains("https://cdn.example.com/widget.js"), "{name}");
        }
        assert!("vue".parse::<Integration>().is_err());
    }

    #[test]
    fn screens_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Screen::Selection).unwrap(), "selection");
        assert_eq!(serde_json::to_value(InitStep::Vapi).unwrap(), "vapi");
    }
}
